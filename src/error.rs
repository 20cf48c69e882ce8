use thiserror::Error;

/// Error kinds of the verification core.
///
/// `NotFound` is recoverable: a missing section simply means the feature is
/// absent for that binary (e.g. a module without `.altinstructions`). The
/// other kinds are fatal for the file or process they occur in;
/// `InternalError` aborts the whole run.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{0}: not an ELF file")]
    BadMagic(String),

    #[error("unsupported ELF flavor: {0}")]
    Unsupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown relocation type {0}")]
    UnknownReloc(u32),

    #[error("REL relocations present, toolchain only emits RELA")]
    UnexpectedRel,

    #[error("duplicate global symbol: {0}")]
    DuplicateSymbol(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl VerifyError {
    pub fn not_found(what: impl Into<String>) -> Self {
        VerifyError::NotFound(what.into())
    }

    /// True for errors a caller may treat as "feature absent".
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<VerifyError>(), Some(VerifyError::NotFound(_)))
    }
}

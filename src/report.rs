use std::path::Path;

use serde::Serialize;

use crate::prelude::*;

/// One integrity finding. Findings are reported and collected, never
/// thrown; the run continues.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    /// guest virtual address the finding anchors at
    pub address: u64,
    /// owning loader (kernel, module or mapping name)
    pub owner: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expected: Vec<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub observed: Vec<u8>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    CodeMismatch,
    UninitialisedTail,
    RodataMismatch,
    UnknownCodePointer,
    UnknownIdtEntry,
    UnvalidatedReturnAddress,
    UnknownExecutablePage,
}

#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub findings: Vec<Finding>,
    pub pages_checked: u64,
    pub stacks_checked: u64,
}

impl Report {
    pub fn new() -> Self {
        Report::default()
    }

    pub fn add(&mut self, finding: Finding) {
        let location = format!("{:#x} ({})", finding.address, finding.owner);
        match finding.kind {
            FindingKind::CodeMismatch => error!(
                "code mismatch at {location}: expected {} observed {}{}",
                hex(&finding.expected),
                hex(&finding.observed),
                note(&finding),
            ),
            FindingKind::UninitialisedTail => warn!(
                "uninitialised tail at {location}: code segment intact, rest of the page unwritten"
            ),
            FindingKind::RodataMismatch => error!(
                "read-only data mismatch at {location}: expected {} observed {}",
                hex(&finding.expected),
                hex(&finding.observed),
            ),
            FindingKind::UnknownCodePointer => error!(
                "undecidable pointer to executable memory at {location}{}",
                note(&finding)
            ),
            FindingKind::UnknownIdtEntry => {
                error!("unverifiable IDT entry at {location}{}", note(&finding))
            }
            FindingKind::UnvalidatedReturnAddress => {
                warn!("unvalidated return address at {location}{}", note(&finding))
            }
            FindingKind::UnknownExecutablePage => {
                warn!("executable page with no owning loader at {location}")
            }
        }
        self.findings.push(finding);
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn summarise(&self) {
        if self.is_clean() {
            info!(
                "validation clean: {} pages, {} stacks",
                self.pages_checked, self.stacks_checked
            );
        } else {
            warn!(
                "{} findings over {} pages, {} stacks",
                self.findings.len(),
                self.pages_checked,
                self.stacks_checked
            );
        }
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())
            .with_context(|| format!("cannot create report at {}", path.as_ref().display()))?;
        serde_json::to_writer_pretty(file, self)?;
        info!("report written to {}", path.as_ref().display());
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn note(finding: &Finding) -> String {
    if finding.note.is_empty() {
        String::new()
    } else {
        format!(" ({})", finding.note)
    }
}

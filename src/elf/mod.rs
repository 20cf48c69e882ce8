pub mod image;
pub mod sysmap;

#[cfg(test)]
pub(crate) mod testelf;

pub use image::{ElfImage, ElfSymbol, ObjectKind, RelaEntry, SectionInfo, SegmentInfo};

/// Explicit little-endian field readers.
///
/// ELF structures are decoded field by field from byte slices instead of
/// casting to packed structs, so images loaded from arbitrary byte buffers
/// (e.g. the vdso read out of guest memory) parse without any alignment
/// requirement.
pub(crate) mod le {
    pub fn u16_at(data: &[u8], off: usize) -> Option<u16> {
        Some(u16::from_le_bytes(data.get(off..off + 2)?.try_into().ok()?))
    }

    pub fn u32_at(data: &[u8], off: usize) -> Option<u32> {
        Some(u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?))
    }

    pub fn u64_at(data: &[u8], off: usize) -> Option<u64> {
        Some(u64::from_le_bytes(data.get(off..off + 8)?.try_into().ok()?))
    }

    pub fn i64_at(data: &[u8], off: usize) -> Option<i64> {
        Some(i64::from_le_bytes(data.get(off..off + 8)?.try_into().ok()?))
    }

    /// NUL-terminated string at `off` in a string table.
    pub fn str_at(strtab: &[u8], off: usize) -> Option<&str> {
        let bytes = strtab.get(off..)?;
        let end = bytes.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&bytes[..end]).ok()
    }
}

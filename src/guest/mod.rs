pub mod dump;
pub mod tasks;
pub mod types;

use serde::Serialize;

use crate::prelude::*;

/// Kernel address space marker for the `pid` parameter of the oracles.
pub const KERNEL_SPACE: i32 = 0;

/// One mapped guest page.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PageInfo {
    pub vaddr: u64,
    pub paddr: u64,
    pub size: u64,
    pub executable: bool,
    pub writable: bool,
}

/// Random-access view of guest memory, provided by the introspection
/// transport. Implementations are read-only and thread-safe; callers do not
/// coordinate.
pub trait GuestMemory: Send + Sync {
    /// Read `len` bytes of virtual memory. `pid == KERNEL_SPACE` addresses
    /// the kernel space.
    fn read(&self, vaddr: u64, len: usize, pid: i32) -> Result<Vec<u8>>;

    /// Enumerate all mapped pages of an address space.
    fn pages(&self, pid: i32) -> Result<Vec<PageInfo>>;

    fn is_executable(&self, page: &PageInfo) -> bool {
        page.executable
    }

    fn read_u64(&self, vaddr: u64, pid: i32) -> Result<u64> {
        let bytes = self.read(vaddr, 8, pid)?;
        Ok(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
    }

    fn read_u32(&self, vaddr: u64, pid: i32) -> Result<u32> {
        let bytes = self.read(vaddr, 4, pid)?;
        Ok(u32::from_le_bytes(bytes[..4].try_into().unwrap()))
    }

    fn read_i32(&self, vaddr: u64, pid: i32) -> Result<i32> {
        let bytes = self.read(vaddr, 4, pid)?;
        Ok(i32::from_le_bytes(bytes[..4].try_into().unwrap()))
    }

    /// NUL-terminated string, capped at `max` bytes.
    fn read_cstr(&self, vaddr: u64, max: usize, pid: i32) -> Result<String> {
        let bytes = self.read(vaddr, max, pid)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

//! File-dump backend of the guest-memory oracle.
//!
//! A dump is a single file produced by the capture helper: a header with the
//! magic `GGDUMP01` and a record table, each record describing one virtual
//! memory region of one address space, followed by the raw region contents.
//!
//! Record layout (little-endian, 40 bytes):
//! `{ pid: i32, _pad: u32, vaddr: u64, size: u64, flags: u32, _pad: u32,
//! file_offset: u64 }` with flag bits 0 = executable, 1 = writable.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use super::{GuestMemory, PageInfo};
use crate::elf::le;
use crate::prelude::*;

pub const DUMP_MAGIC: &[u8; 8] = b"GGDUMP01";

const HEADER_SIZE: usize = 16;
const RECORD_SIZE: usize = 40;

const FLAG_EXEC: u32 = 1 << 0;
const FLAG_WRITE: u32 = 1 << 1;

struct Record {
    pid: i32,
    vaddr: u64,
    size: u64,
    flags: u32,
    file_offset: u64,
}

pub struct DumpMemory {
    mmap: Mmap,
    records: Vec<Record>,
}

impl DumpMemory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open memory dump {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map memory dump {}", path.display()))?;

        if mmap.len() < HEADER_SIZE || mmap[..8] != *DUMP_MAGIC {
            bail!("{} is not a guestguard memory dump", path.display());
        }
        let count = le::u64_at(&mmap, 8).unwrap() as usize;

        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let base = HEADER_SIZE + i * RECORD_SIZE;
            let record = (|| {
                Some(Record {
                    pid: le::u32_at(&mmap, base)? as i32,
                    vaddr: le::u64_at(&mmap, base + 8)?,
                    size: le::u64_at(&mmap, base + 16)?,
                    flags: le::u32_at(&mmap, base + 24)?,
                    file_offset: le::u64_at(&mmap, base + 32)?,
                })
            })()
            .ok_or_else(|| anyhow!("{}: truncated record table", path.display()))?;
            records.push(record);
        }

        Ok(DumpMemory { mmap, records })
    }

    /// Cheap signature probe used by backend auto-detection.
    pub fn looks_like_dump(path: &Path) -> bool {
        std::fs::File::open(path)
            .and_then(|mut f| {
                use std::io::Read;
                let mut magic = [0u8; 8];
                f.read_exact(&mut magic)?;
                Ok(&magic == DUMP_MAGIC)
            })
            .unwrap_or(false)
    }
}

impl GuestMemory for DumpMemory {
    fn read(&self, vaddr: u64, len: usize, pid: i32) -> Result<Vec<u8>> {
        for record in &self.records {
            if record.pid != pid {
                continue;
            }
            if vaddr >= record.vaddr && vaddr + len as u64 <= record.vaddr + record.size {
                let start = (record.file_offset + (vaddr - record.vaddr)) as usize;
                let bytes = self
                    .mmap
                    .get(start..start + len)
                    .ok_or_else(|| anyhow!("dump record data out of bounds"))?;
                return Ok(bytes.to_vec());
            }
        }
        bail!("address {vaddr:#x} (pid {pid}) not present in dump")
    }

    fn pages(&self, pid: i32) -> Result<Vec<PageInfo>> {
        let mut pages = Vec::new();
        for record in self.records.iter().filter(|r| r.pid == pid) {
            let mut vaddr = record.vaddr;
            let end = record.vaddr + record.size;
            while vaddr < end {
                let size = 0x1000.min(end - vaddr);
                pages.push(PageInfo {
                    vaddr,
                    paddr: vaddr & 0xffff_ffff_ffff,
                    size,
                    executable: record.flags & FLAG_EXEC != 0,
                    writable: record.flags & FLAG_WRITE != 0,
                });
                vaddr += size;
            }
        }
        Ok(pages)
    }
}

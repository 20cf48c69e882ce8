//! Process-side comparator: diffs each mapping's resident bytes against
//! the reconstructed loader images, treating unresolved lazy PLT slots as
//! legitimate.

use crate::elf::le;
use crate::guest::GuestMemory;
use crate::guest::tasks::{VM_EXEC, VM_WRITE, VmaInfo};
use crate::loader::user::PAGE_SIZE;
use crate::prelude::*;
use crate::process::Process;
use crate::report::{Finding, FindingKind, Report};

pub struct ProcessValidator<'p> {
    process: &'p mut Process,
    memory: &'p dyn GuestMemory,
    pub report: Report,
}

impl<'p> ProcessValidator<'p> {
    pub fn new(process: &'p mut Process, memory: &'p dyn GuestMemory) -> Self {
        ProcessValidator {
            process,
            memory,
            report: Report::new(),
        }
    }

    /// Compare every file-backed mapping of the process.
    pub fn validate_mappings(&mut self) -> Result<()> {
        let pid = self.process.pid;
        let vmas = self.process.vmas.clone();

        for vma in &vmas {
            if !vma.is_file_backed() && vma.name != "[vdso]" {
                continue;
            }
            if self.process.loader_by_name(&vma.name).is_none() {
                continue;
            }

            if vma.flags & VM_EXEC != 0 {
                self.validate_text_mapping(pid, vma)?;
            } else if vma.flags & VM_WRITE != 0 {
                self.validate_data_mapping(pid, vma)?;
            }
            self.report.pages_checked += (vma.end - vma.start) / PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Executable mappings must match the reconstructed text exactly.
    fn validate_text_mapping(&mut self, pid: i32, vma: &VmaInfo) -> Result<()> {
        let loader = self.process.loader_by_name(&vma.name).unwrap();

        // the mapping covers file pages [off, off + len)
        let map_file_start = vma.off * PAGE_SIZE as u64;
        let text_file_start = loader
            .image
            .code_segment()
            .map(|seg| seg.offset & !(PAGE_SIZE as u64 - 1))
            .unwrap_or(0);
        let Some(skew) = map_file_start.checked_sub(text_file_start) else {
            return Ok(());
        };

        let len = (vma.end - vma.start) as usize;
        let expected_all = &loader.text.bytes;
        let start = skew as usize;
        if start >= expected_all.len() {
            return Ok(());
        }
        let expected = &expected_all[start..(start + len).min(expected_all.len())];
        let observed = self.memory.read(vma.start, expected.len(), pid)?;

        let mut i = 0usize;
        let mut findings = Vec::new();
        while i < expected.len() {
            if expected[i] == observed[i] {
                i += 1;
                continue;
            }
            if i > 0 && expected[i - 1] != observed[i - 1] {
                i += 1;
                continue;
            }
            if start + i >= loader.text.initialized {
                break;
            }
            findings.push(Finding {
                kind: FindingKind::CodeMismatch,
                address: vma.start + i as u64,
                owner: vma.name.clone(),
                expected: expected[i..(i + 8).min(expected.len())].to_vec(),
                observed: observed[i..(i + 8).min(observed.len())].to_vec(),
                note: String::new(),
            });
            i += 1;
        }
        for finding in findings {
            self.report.add(finding);
        }
        Ok(())
    }

    /// Writable mappings: GOT/PLT slots may differ where lazy binding has
    /// not fired (or has just fired); everything the relocator wrote must
    /// match.
    fn validate_data_mapping(&mut self, pid: i32, vma: &VmaInfo) -> Result<()> {
        let (data_base, data_file_page, initialized, expected) = {
            let loader = self.process.loader_by_name(&vma.name).unwrap();
            if loader.data.bytes.is_empty() {
                return Ok(());
            }
            (
                loader.data.base,
                loader
                    .image
                    .data_segment()
                    .map(|seg| seg.offset & !(PAGE_SIZE as u64 - 1))
                    .unwrap_or(0),
                loader.data.initialized,
                loader.data.bytes.clone(),
            )
        };

        // mapping offset into the data image
        let map_file_start = vma.off * PAGE_SIZE as u64;
        let Some(skew) = map_file_start.checked_sub(data_file_page) else {
            return Ok(());
        };

        let start = skew as usize;
        if start >= expected.len() {
            return Ok(());
        }
        let len = ((vma.end - vma.start) as usize).min(expected.len() - start);
        let observed = self.memory.read(vma.start, len, pid)?;
        // only the relocated, file-initialised prefix is predictable
        let check_len = len.min(initialized.saturating_sub(start));

        let mut i = 0usize;
        while i + 8 <= check_len {
            let expected_word = le::u64_at(&expected, start + i).unwrap();
            let observed_word = le::u64_at(&observed, i).unwrap();
            if expected_word == observed_word {
                i += 8;
                continue;
            }

            // an unresolved (or freshly resolved) lazy PLT slot?
            let site_file_vaddr = data_base + (start + i) as u64;
            let site_guest = vma.start + i as u64;
            if self.process.eval_lazy(site_guest)? {
                // re-derive the bind result and accept either state
                let loader = self.process.loader_by_name(&vma.name).unwrap();
                let resolved = le::u64_at(&loader.data.bytes, start + i).unwrap();
                if observed_word == resolved
                    || observed_self_relative(observed_word, site_file_vaddr)
                {
                    i += 8;
                    continue;
                }
            }
            self.report.add(Finding {
                kind: FindingKind::CodeMismatch,
                address: site_guest,
                owner: vma.name.clone(),
                expected: expected[start + i..start + i + 8].to_vec(),
                observed: observed[i..i + 8].to_vec(),
                note: "data slot differs from the reconstruction".into(),
            });
            i += 8;
        }
        Ok(())
    }
}

/// An unbound PLT slot points back into its own PLT stub (slot address
/// plus the push/jmp preamble), which is how the linker initialises it.
fn observed_self_relative(observed: u64, site_file_vaddr: u64) -> bool {
    observed.wrapping_sub(site_file_vaddr) < 0x40
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_plt_slots_look_self_relative()
    {
        // slot at 0x3018 pointing at its own stub preamble
        assert!(observed_self_relative(0x3018 + 6, 0x3018));
        assert!(!observed_self_relative(0x7f0000200000, 0x3018));
    }
}

//! Per-process state: the executable, its libraries and the vdso, the
//! merged relocation symbol map, and lazy PLT evaluation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use object::elf;

use crate::elf::ElfImage;
use crate::error::VerifyError;
use crate::guest::tasks::{TaskManager, VmaInfo};
use crate::guest::KERNEL_SPACE;
use crate::kernel::Kernel;
use crate::loader::user::build_user_loader;
use crate::loader::{Loader, LoaderKind};
use crate::prelude::*;
use crate::reloc::{self, RelSym};

pub struct Process {
    pub pid: i32,
    pub vmas: Vec<VmaInfo>,
    /// loaders keyed by the VMA backing name, in ascending mapping order
    pub loaders: Vec<Loader>,
    /// guest base address of each loader's lowest mapping
    pub bases: HashMap<String, u64>,
    pub rel_sym_map: HashMap<String, RelSym>,
}

impl Process {
    /// Build the full process image: enumerate VMAs, load every file-backed
    /// ELF plus the vdso, merge exported symbols, apply load-time
    /// relocations.
    pub fn load(kernel: &Kernel, pid: i32, library_path: &[PathBuf]) -> Result<Self> {
        let tm = TaskManager::new(kernel.types.as_ref(), kernel.memory.as_ref());
        let vmas = tm.vmas(pid)?;

        info!("process {pid}: {} VMAs", vmas.len());
        for vma in vmas.iter().sorted_by_key(|vma| vma.start) {
            debug!("  {}", vma.describe());
        }

        let mut process = Process {
            pid,
            vmas,
            loaders: Vec::new(),
            bases: HashMap::new(),
            rel_sym_map: HashMap::new(),
        };

        process.load_mapped_files(library_path)?;
        process.load_vdso(kernel)?;
        process.check_dependencies();
        process.merge_symbols()?;
        process.apply_relocations()?;

        Ok(process)
    }

    /// Every DT_NEEDED dependency should correspond to a mapped library;
    /// a missing one means symbol resolution will be incomplete.
    fn check_dependencies(&self) {
        for loader in &self.loaders {
            let Ok(needed) = loader.image.needed() else {
                continue;
            };
            for dep in needed {
                let mapped = self.loaders.iter().any(|l| {
                    Path::new(&l.name)
                        .file_name()
                        .is_some_and(|f| f.to_string_lossy().starts_with(&dep))
                });
                if !mapped {
                    warn!("{}: dependency {dep} is not mapped", loader.name);
                }
            }
        }
    }

    /// The first file-backed mapping is the executable; every later
    /// file-backed name is a library (the dynamic linker maps them above).
    fn load_mapped_files(&mut self, library_path: &[PathBuf]) -> Result<()> {
        let mut exec_seen = false;
        let vmas = self.vmas.clone();

        for vma in &vmas {
            if !vma.is_file_backed() || self.bases.contains_key(&vma.name) {
                continue;
            }

            let path = match resolve_backing_file(&vma.name, library_path) {
                Some(path) => path,
                None => {
                    warn!("no on-disk file for mapping {}", vma.name);
                    continue;
                }
            };

            let image = match ElfImage::open(&path) {
                Ok(image) => image,
                Err(err) => {
                    error!("{}: {err:#}", path.display());
                    continue;
                }
            };

            let kind = if !exec_seen && !image.is_dynamic_library() {
                exec_seen = true;
                LoaderKind::Exec
            } else {
                LoaderKind::Library
            };

            match build_user_loader(image, &vma.name, kind) {
                Ok(loader) => {
                    self.bases.insert(vma.name.clone(), vma.start);
                    self.loaders.push(loader);
                }
                Err(err) => error!("{}: {err:#}", vma.name),
            }
        }
        Ok(())
    }

    /// The vdso has no backing file; its image is read out of the guest via
    /// the kernel's `vdso_image_64` descriptor.
    fn load_vdso(&mut self, kernel: &Kernel) -> Result<()> {
        let oracle = kernel.types.as_ref();
        let memory = kernel.memory.as_ref();

        let image_desc = match oracle.variable("vdso_image_64") {
            Ok(desc) => desc,
            Err(err) => {
                warn!("vdso descriptor not available: {err}");
                return Ok(());
            }
        };
        let data_ptr = image_desc
            .member(oracle, memory, KERNEL_SPACE, "data", false)?
            .value_u64(memory, KERNEL_SPACE)?;
        let size = image_desc
            .member(oracle, memory, KERNEL_SPACE, "size", false)?
            .value_u64(memory, KERNEL_SPACE)?;

        let bytes = memory.read(data_ptr, size as usize, KERNEL_SPACE)?;
        let image = ElfImage::from_bytes("[vdso]", bytes)?;
        let loader = build_user_loader(image, "[vdso]", LoaderKind::Vdso)?;

        if let Some(vma) = self.vmas.iter().find(|v| v.name == "[vdso]") {
            self.bases.insert("[vdso]".into(), vma.start);
        }
        self.loaders.push(loader);
        Ok(())
    }

    /// Phases 1+2 of cross-loader resolution: collect every defined global
    /// and weak dynamic symbol, locate its in-guest address through the
    /// mapping whose protection flags match the owning segment, and merge
    /// into one per-process map. Globals displace weak entries; two global
    /// definitions of one name are an error.
    fn merge_symbols(&mut self) -> Result<()> {
        for loader in &self.loaders {
            let symbols = loader.image.exported_symbols()?;
            for sym in symbols {
                let Some(segment) = sym.segment else {
                    continue;
                };
                let Some(mapping) = self.vmas.iter().find(|vma| {
                    vma.name == loader.name && flags_match(vma.flags, segment.flags)
                }) else {
                    trace!(
                        "{}: no mapping matches the segment of {}",
                        loader.name, sym.name
                    );
                    continue;
                };

                let value = mapping.start + sym.value;
                let bind = sym.bind();

                let existing_bind = self.rel_sym_map.get(&sym.name).map(|e| e.info >> 4);
                match existing_bind {
                    Some(elf::STB_GLOBAL) if bind == elf::STB_GLOBAL => {
                        return Err(VerifyError::DuplicateSymbol(sym.name).into());
                    }
                    // a global definition displaces a weak one; anything
                    // else keeps the first registration
                    Some(existing) if !(existing == elf::STB_WEAK && bind == elf::STB_GLOBAL) => {}
                    _ => {
                        self.rel_sym_map.insert(
                            sym.name.clone(),
                            RelSym {
                                name: sym.name,
                                value,
                                info: sym.info,
                            },
                        );
                    }
                }
            }
        }
        debug!("process {}: {} merged symbols", self.pid, self.rel_sym_map.len());
        Ok(())
    }

    /// Phase 3: run the relocator over every loader against the merged
    /// map. `JUMP_SLOT`s stay deferred for lazily-bound images.
    fn apply_relocations(&mut self) -> Result<()> {
        for loader in &mut self.loaders {
            let base = self.bases.get(&loader.name).copied().unwrap_or(0);
            if let Err(err) = reloc::apply_user_relocations(loader, &self.rel_sym_map, base) {
                // one bad file does not take the process analysis down
                error!("{}: {err:#}", loader.name);
            }
        }
        Ok(())
    }

    pub fn loader_by_name(&self, name: &str) -> Option<&Loader> {
        self.loaders.iter().find(|l| l.name == name)
    }

    fn loader_index_for_address(&self, vaddr: u64) -> Option<usize> {
        let vma = self
            .vmas
            .iter()
            .find(|vma| vaddr >= vma.start && vaddr < vma.end)?;
        self.loaders.iter().position(|l| l.name == vma.name)
    }

    /// Guest address -> address in the loader's own (file) address space.
    fn file_vaddr(&self, loader: &Loader, guest_vaddr: u64) -> u64 {
        let base = self.bases.get(&loader.name).copied().unwrap_or(0);
        if loader.kind == LoaderKind::Library || loader.kind == LoaderKind::Vdso {
            guest_vaddr.wrapping_sub(base)
        } else {
            guest_vaddr
        }
    }

    /// Is `guest_vaddr` a legitimate unresolved `JUMP_SLOT` site? If so,
    /// materialise the bind as the dynamic linker would on first call, and
    /// report success.
    pub fn eval_lazy(&mut self, guest_vaddr: u64) -> Result<bool> {
        let Some(index) = self.loader_index_for_address(guest_vaddr) else {
            return Ok(false);
        };
        let file_vaddr = self.file_vaddr(&self.loaders[index], guest_vaddr);
        let base = self
            .bases
            .get(&self.loaders[index].name)
            .copied()
            .unwrap_or(0);

        let loader = &mut self.loaders[index];
        if !loader.lazy_bind {
            return Ok(false);
        }
        let Some(entry) = reloc::find_jump_slot(loader, file_vaddr) else {
            return Ok(false);
        };
        reloc::apply_user_entry(loader, &entry, &self.rel_sym_map, base)?;
        Ok(true)
    }
}

fn flags_match(vma_flags: u64, segment_flags: u32) -> bool {
    use crate::guest::tasks::{VM_EXEC, VM_READ, VM_WRITE};

    (vma_flags & VM_READ != 0) == (segment_flags & elf::PF_R != 0)
        && (vma_flags & VM_WRITE != 0) == (segment_flags & elf::PF_W != 0)
        && (vma_flags & VM_EXEC != 0) == (segment_flags & elf::PF_X != 0)
}

/// A mapping's backing file: the recorded path if it exists, otherwise the
/// basename searched through the library path (colon-separated directories
/// on the command line).
fn resolve_backing_file(name: &str, library_path: &[PathBuf]) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }

    let basename = direct.file_name()?;
    let mut stack: Vec<PathBuf> = library_path.to_vec();
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name() == Some(basename) {
                return Some(path);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testelf::TestElf;
    use crate::guest::tasks::{VM_READ, VM_WRITE};

    fn library_with_bar() -> Loader {
        let mut builder = TestElf::new(elf::ET_DYN);
        let text = builder.add_progbits(
            ".text",
            &[0xc3u8; 0x10],
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            0x1000,
        );
        let data = builder.add_progbits(
            ".data",
            &[0u8; 0x20],
            elf::SHF_ALLOC | elf::SHF_WRITE,
            0x2000,
        );
        builder.add_segment(elf::PF_R | elf::PF_X, text, text, 0);
        builder.add_segment(elf::PF_R | elf::PF_W, data, data, 0);
        // GLOBAL data symbol at file offset 0x2010 inside the RW segment
        builder.add_dyn_symbol("bar", 0x2010, elf::STB_GLOBAL, elf::STT_OBJECT, data);
        let image = ElfImage::from_bytes("/usr/lib/libfoo.so", builder.build()).unwrap();
        build_user_loader(image, "/usr/lib/libfoo.so", LoaderKind::Library).unwrap()
    }

    #[test]
    fn merged_symbol_addresses_come_from_the_matching_mapping() {
        // the RW mapping of libfoo starts at 0x7f0000123000; bar is at
        // file-level 0x2010 in the RW segment
        let mut process = Process {
            pid: 4242,
            vmas: vec![
                VmaInfo {
                    start: 0x7f0000100000,
                    end: 0x7f0000101000,
                    ino: 7,
                    off: 0,
                    flags: VM_READ | crate::guest::tasks::VM_EXEC,
                    name: "/usr/lib/libfoo.so".into(),
                },
                VmaInfo {
                    start: 0x7f0000123000,
                    end: 0x7f0000124000,
                    ino: 7,
                    off: 2,
                    flags: VM_READ | VM_WRITE,
                    name: "/usr/lib/libfoo.so".into(),
                },
            ],
            loaders: vec![library_with_bar()],
            bases: HashMap::from([("/usr/lib/libfoo.so".to_string(), 0x7f0000100000)]),
            rel_sym_map: HashMap::new(),
        };

        process.merge_symbols().unwrap();
        assert_eq!(process.rel_sym_map["bar"].value, 0x7f0000123000 + 0x2010);
    }

    #[test]
    fn duplicate_globals_are_rejected_but_weak_is_displaced() {
        let weak_then_global = |first_bind: u8, second_bind: u8| -> Result<HashMap<String, RelSym>> {
            let make = |bind: u8, path: &str| {
                let mut builder = TestElf::new(elf::ET_DYN);
                let text = builder.add_progbits(
                    ".text",
                    &[0xc3u8; 0x10],
                    elf::SHF_ALLOC | elf::SHF_EXECINSTR,
                    0x1000,
                );
                builder.add_segment(elf::PF_R | elf::PF_X, text, text, 0);
                builder.add_dyn_symbol("sym", 0x1004, bind, elf::STT_FUNC, text);
                let image = ElfImage::from_bytes(path, builder.build()).unwrap();
                build_user_loader(image, path, LoaderKind::Library).unwrap()
            };

            let mut process = Process {
                pid: 1,
                vmas: vec![
                    VmaInfo {
                        start: 0x7f0000100000,
                        end: 0x7f0000101000,
                        ino: 1,
                        off: 0,
                        flags: VM_READ | crate::guest::tasks::VM_EXEC,
                        name: "/a.so".into(),
                    },
                    VmaInfo {
                        start: 0x7f0000200000,
                        end: 0x7f0000201000,
                        ino: 2,
                        off: 0,
                        flags: VM_READ | crate::guest::tasks::VM_EXEC,
                        name: "/b.so".into(),
                    },
                ],
                loaders: vec![make(first_bind, "/a.so"), make(second_bind, "/b.so")],
                bases: HashMap::new(),
                rel_sym_map: HashMap::new(),
            };
            process.merge_symbols()?;
            Ok(process.rel_sym_map)
        };

        // weak then global: the global definition wins
        let map = weak_then_global(elf::STB_WEAK, elf::STB_GLOBAL).unwrap();
        assert_eq!(map["sym"].value, 0x7f0000200000 + 0x1004);

        // global then weak: the global stays
        let map = weak_then_global(elf::STB_GLOBAL, elf::STB_WEAK).unwrap();
        assert_eq!(map["sym"].value, 0x7f0000100000 + 0x1004);

        // two globals: DuplicateSymbol
        let err = weak_then_global(elf::STB_GLOBAL, elf::STB_GLOBAL).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::DuplicateSymbol(_))
        ));
    }
}

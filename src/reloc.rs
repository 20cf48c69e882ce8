//! ELF64 relocation application.
//!
//! Two site-addressing strategies exist: relocatable objects (kernel
//! modules) address the patch site as `section file offset + r_offset` and
//! write into the loader's working file copy; executables and shared
//! objects interpret `r_offset` as a virtual address mapped into the
//! reconstructed text/data regions.

use std::collections::HashMap;

use object::elf;

use crate::elf::{RelaEntry, SectionInfo};
use crate::error::VerifyError;
use crate::loader::{Loader, LoaderKind};
use crate::prelude::*;

/// Resolves `SHN_UNDEF` symbols against an external namespace: the kernel's
/// registry for modules, the merged per-process map for userspace.
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Result<u64>;
}

/// A symbol another loader of the same process provides for relocation.
#[derive(Debug, Clone)]
pub struct RelSym {
    pub name: String,
    /// final in-guest virtual address
    pub value: u64,
    pub info: u8,
}

/// The section a virtual address belongs to, chosen as the allocated
/// section with the largest base address at or below it. The SysV ABI does
/// not document this retargeting; it reproduces the linker-observed layout
/// and is cross-checked against `st_shndx` in the tests.
pub fn section_for_vaddr(sections: &[SectionInfo], vaddr: u64) -> Option<&SectionInfo> {
    sections
        .iter()
        .skip(1)
        .filter(|s| s.is_alloc() && s.addr <= vaddr)
        .max_by_key(|s| s.addr)
}

/// Apply every RELA section of a relocatable object (kernel module) whose
/// target section is allocated. Writes go to `loader.file_buf`.
///
/// `percpu_base`: in-guest address of the module's per-cpu area; symbols
/// defined in `.data..percpu` are rebased onto it.
pub fn apply_module_relocations(
    loader: &mut Loader,
    resolver: &dyn SymbolResolver,
    percpu_base: Option<u64>,
) -> Result<()> {
    debug!("relocating {}", loader.name);

    let symtab = loader.image.symtab_entries()?;
    let percpu_id = loader
        .image
        .section_by_name(".data..percpu")
        .map(|s| s.id)
        .unwrap_or(u32::MAX);

    let rela_sections: Vec<SectionInfo> = loader
        .image
        .rela_sections()?
        .into_iter()
        .cloned()
        .collect();

    for rela_section in rela_sections {
        let target = loader.image.section_by_id(rela_section.info)?.clone();
        if !target.is_alloc() {
            continue;
        }
        let is_altinstr = target.name == ".altinstructions";
        let target_mem = loader.section_mem_addr(&target);

        for entry in loader.image.rela_entries(&rela_section)? {
            let sym = symtab
                .get(entry.sym as usize)
                .ok_or_else(|| VerifyError::InternalError(format!(
                    "{}: relocation names symbol {} beyond the symtab",
                    loader.name, entry.sym
                )))?;

            let site_file = (target.offset + entry.offset) as usize;
            let site_mem = target_mem + entry.offset;

            // the symbol's defining section, for section-relative values
            let mut sym_sec_file = 0u64;
            let mut sym_sec_mem = 0u64;

            let sym_value = match sym.shndx {
                elf::SHN_COMMON => {
                    return Err(VerifyError::InternalError(format!(
                        "{}: SHN_COMMON symbol {} in relocation",
                        loader.name, sym.name
                    ))
                    .into());
                }
                elf::SHN_ABS => sym.value,
                elf::SHN_UNDEF => resolver.resolve(&sym.name).with_context(|| {
                    format!("{}: resolving undefined symbol {}", loader.name, sym.name)
                })?,
                shndx => {
                    let section = loader.image.section_by_id(u32::from(shndx))?.clone();
                    sym_sec_file = section.offset;
                    sym_sec_mem = if section.id == percpu_id {
                        percpu_base.unwrap_or_else(|| loader.section_mem_addr(&section))
                    } else {
                        loader.section_mem_addr(&section)
                    };
                    // kernel objects sometimes carry only the offset into
                    // the section
                    if sym.value < sym_sec_mem {
                        sym.value + sym_sec_mem
                    } else {
                        sym.value
                    }
                }
            };

            let val = sym_value.wrapping_add(entry.addend as u64);

            match entry.rtype {
                elf::R_X86_64_NONE => {}
                elf::R_X86_64_64 => {
                    loader.file_buf[site_file..site_file + 8].copy_from_slice(&val.to_le_bytes());
                }
                elf::R_X86_64_32 => {
                    let word = val as u32;
                    if u64::from(word) != val {
                        bail!("{}: R_X86_64_32 overflow at {site_mem:#x}", loader.name);
                    }
                    loader.file_buf[site_file..site_file + 4]
                        .copy_from_slice(&word.to_le_bytes());
                }
                elf::R_X86_64_32S => {
                    let word = val as i32;
                    if i64::from(word) != val as i64 {
                        bail!("{}: R_X86_64_32S overflow at {site_mem:#x}", loader.name);
                    }
                    loader.file_buf[site_file..site_file + 4]
                        .copy_from_slice(&word.to_le_bytes());
                }
                elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => {
                    // inside .altinstructions the site lives in a replacement
                    // buffer; express the delta buffer-relative
                    let word = if is_altinstr {
                        val.wrapping_sub(sym_sec_mem)
                            .wrapping_add(sym_sec_file)
                            .wrapping_sub(site_file as u64) as u32
                    } else {
                        val.wrapping_sub(site_mem) as u32
                    };
                    loader.file_buf[site_file..site_file + 4]
                        .copy_from_slice(&word.to_le_bytes());
                }
                other => {
                    return Err(VerifyError::UnknownReloc(other)).with_context(|| {
                        format!("{}: relocation at {site_mem:#x}", loader.name)
                    });
                }
            }
        }
    }

    Ok(())
}

/// Apply the dynamic relocations of an executable or shared object against
/// the merged per-process symbol map. `image_base` is the in-guest base of
/// the mapping (zero for fixed-address executables).
///
/// `JUMP_SLOT` entries are skipped when the loader binds lazily; the
/// comparator re-derives them on demand via [`apply_user_entry`].
pub fn apply_user_relocations(
    loader: &mut Loader,
    map: &HashMap<String, RelSym>,
    image_base: u64,
) -> Result<()> {
    debug!("relocating {}", loader.name);

    let rela_sections: Vec<SectionInfo> = loader
        .image
        .rela_sections()?
        .into_iter()
        .cloned()
        .collect();

    for rela_section in rela_sections {
        for entry in loader.image.rela_entries(&rela_section)? {
            if loader.lazy_bind && entry.rtype == elf::R_X86_64_JUMP_SLOT {
                continue;
            }
            apply_user_entry(loader, &entry, map, image_base)?;
        }
    }
    Ok(())
}

/// Apply a single dynamic relocation entry, as the dynamic linker would at
/// load time (or at first call for lazy `JUMP_SLOT`s).
pub fn apply_user_entry(
    loader: &mut Loader,
    entry: &RelaEntry,
    map: &HashMap<String, RelSym>,
    image_base: u64,
) -> Result<()> {
    match entry.rtype {
        elf::R_X86_64_NONE | elf::R_X86_64_COPY => return Ok(()),
        elf::R_X86_64_RELATIVE | elf::R_X86_64_IRELATIVE => {
            // the indirect resolver function is never invoked; the
            // program-base-adjusted addend stands in for its result
            let value = if loader.kind == LoaderKind::Library {
                image_base.wrapping_add(entry.addend as u64)
            } else {
                entry.addend as u64
            };
            return write_user_site(loader, entry.offset, &value.to_le_bytes());
        }
        elf::R_X86_64_JUMP_SLOT | elf::R_X86_64_GLOB_DAT | elf::R_X86_64_64 => {}
        other => {
            return Err(VerifyError::UnknownReloc(other))
                .with_context(|| format!("{}: relocation at {:#x}", loader.name, entry.offset));
        }
    }

    let dynsym = loader.image.section_by_name(".dynsym")?.clone();
    let name = dyn_symbol_name(loader, &dynsym, entry.sym)?;

    let Some(sym) = map.get(&name) else {
        warn!(
            "{}: symbol {name} not present in the process map, skipping",
            loader.name
        );
        return Ok(());
    };

    // slot relocations take the plain symbol value, no addend
    let value = if entry.rtype == elf::R_X86_64_64 {
        sym.value.wrapping_add(entry.addend as u64)
    } else {
        sym.value
    };
    write_user_site(loader, entry.offset, &value.to_le_bytes())
}

/// The site is an in-file virtual address; find the owning region through
/// the section layout and patch the reconstructed bytes.
fn write_user_site(loader: &mut Loader, vaddr: u64, bytes: &[u8]) -> Result<()> {
    if section_for_vaddr(loader.image.sections(), vaddr).is_none() {
        return Err(VerifyError::InternalError(format!(
            "{}: no section can be the target for the relocation at {vaddr:#x}",
            loader.name
        ))
        .into());
    }

    let region = if loader.text.contains(vaddr) {
        &mut loader.text
    } else if loader.data.contains(vaddr) {
        &mut loader.data
    } else {
        // e.g. a .got entry beyond the reconstructed spans
        warn!("{}: relocation site {vaddr:#x} outside image", loader.name);
        return Ok(());
    };

    let off = region.offset_of(vaddr);
    if off + bytes.len() > region.bytes.len() {
        bail!("{}: relocation write out of bounds at {vaddr:#x}", loader.name);
    }
    region.bytes[off..off + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn dyn_symbol_name(loader: &Loader, dynsym: &SectionInfo, index: u32) -> Result<String> {
    use crate::elf::le;

    let data = loader.image.section_data(dynsym);
    let base = index as usize * 24;
    let name_off = le::u32_at(data, base)
        .ok_or_else(|| anyhow!("{}: dynsym index {index} out of range", loader.name))?;
    let strtab = loader.image.section_by_id(dynsym.link)?;
    let strings = loader.image.section_data(strtab);
    Ok(le::str_at(strings, name_off as usize)
        .unwrap_or_default()
        .to_string())
}

/// Does a `JUMP_SLOT` entry for this site exist? Used by the comparator to
/// accept unresolved lazy PLT slots.
pub fn find_jump_slot(loader: &Loader, site_vaddr: u64) -> Option<RelaEntry> {
    let rela_sections = loader.image.rela_sections().ok()?;
    for rela_section in rela_sections {
        for entry in loader.image.rela_entries(rela_section).ok()? {
            if entry.rtype == elf::R_X86_64_JUMP_SLOT && entry.offset == site_vaddr {
                return Some(entry);
            }
        }
    }
    None
}

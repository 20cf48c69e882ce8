//! Kernel-module image reconstruction.
//!
//! Modules are relocatable objects: the guest's `struct module` dictates
//! where each section was placed, relocations resolve against the kernel's
//! registry, and the text image is `.text` plus every other executable
//! allocation, padded to page granularity.

use std::collections::HashMap;

use object::elf;

use super::{Loader, LoaderKind, Region};
use crate::elf::ElfImage;
use crate::guest::GuestMemory;
use crate::guest::types::TypeOracle;
use crate::patch::{self, PatchContext};
use crate::prelude::*;
use crate::reloc::{self, SymbolResolver};
use crate::symbols::{SymbolRegistry, scoped_local_name};

pub const MODULE_PAGE_SIZE: usize = 0x1000;

/// In-guest placement of a module, read from its `struct module`.
#[derive(Debug, Default, Clone)]
pub struct ModulePlacement {
    /// section name -> resident address (from `module.sect_attrs`)
    pub section_addrs: HashMap<String, u64>,
    /// `module.percpu`
    pub percpu_base: Option<u64>,
}

/// Dependency names from the `.modinfo` section: the comma-separated value
/// of the first `depends=` entry.
pub fn modinfo_depends(image: &ElfImage) -> Vec<String> {
    let Ok(section) = image.section_by_name(".modinfo") else {
        return Vec::new();
    };
    for entry in image.section_data(section).split(|&b| b == 0) {
        if entry.is_empty() {
            continue;
        }
        let Ok(text) = std::str::from_utf8(entry) else {
            continue;
        };
        if let Some(value) = text.strip_prefix("depends=") {
            return value
                .split(',')
                .filter(|dep| !dep.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    Vec::new()
}

pub fn build_module_loader(
    image: ElfImage,
    name: &str,
    placement: &ModulePlacement,
    resolver: &dyn SymbolResolver,
    ctx: &PatchContext,
    oracle: &dyn TypeOracle,
    memory: &dyn GuestMemory,
    registry: &SymbolRegistry,
) -> Result<Loader> {
    let mut loader = Loader::new(LoaderKind::Module, name.into(), image);

    for section in loader.image.sections() {
        if let Some(&addr) = placement.section_addrs.get(&section.name) {
            loader.section_addrs.insert(section.id, addr);
        }
    }

    reloc::apply_module_relocations(&mut loader, resolver, placement.percpu_base)?;

    patch::apply_alternatives(&mut loader, ctx)?;
    patch::apply_paravirt(&mut loader, ctx, memory)?;
    patch::apply_smp_locks(&mut loader, ctx)?;

    build_text(&mut loader)?;

    if let Some(section) = loader.image.section_by_name("__mcount_loc").ok().cloned() {
        let entries = patch::decode_mcount_entries(loader.buf_section(&section));
        patch::apply_mcount(&mut loader, ctx, &entries);
    }

    if let Some(section) = loader.image.section_by_name("__jump_table").ok().cloned() {
        let entries = patch::decode_jump_entries(loader.buf_section(&section));
        patch::apply_jump_entries(&mut loader, ctx, oracle, memory, &entries)?;
    }

    build_rodata(&mut loader)?;
    register_module_symbols(&loader, registry)?;

    Ok(loader)
}

/// `.text` first, then every other `SHF_ALLOC|SHF_EXECINSTR` section except
/// `.init.text`, padded out to the next page.
fn build_text(loader: &mut Loader) -> Result<()> {
    let text_section = loader.image.section_by_name(".text")?.clone();
    let mut text = Region::new(loader.section_mem_addr(&text_section));
    text.bytes
        .extend_from_slice(loader.buf_section(&text_section));

    let exec_sections: Vec<_> = loader
        .image
        .sections()
        .iter()
        .filter(|s| {
            s.flags == u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR)
                && s.name != ".text"
                && s.name != ".init.text"
        })
        .cloned()
        .collect();
    for section in exec_sections {
        text.bytes.extend_from_slice(loader.buf_section(&section));
    }

    text.initialized = text.bytes.len();
    let fill = MODULE_PAGE_SIZE - (text.bytes.len() % MODULE_PAGE_SIZE);
    let len = text.bytes.len() + fill;
    text.pad_to(len);

    loader.text = text;
    Ok(())
}

/// Read-only data starts at `.note.gnu.build-id`; every allocated
/// read-only PROGBITS (and note) section follows, each aligned to its
/// `sh_addralign`. `.modinfo`, `__versions` and `.init*` are not resident.
fn build_rodata(loader: &mut Loader) -> Result<()> {
    let build_id = match loader.image.section_by_name(".note.gnu.build-id") {
        Ok(s) => s.clone(),
        Err(_) => return Ok(()),
    };
    let mut rodata = Region::new(loader.section_mem_addr(&build_id));

    // merged string sections (.rodata.str*) carry ALLOC|MERGE|STRINGS and
    // are resident like any other read-only data
    const MERGED_STRING_FLAGS: u64 =
        (elf::SHF_ALLOC | elf::SHF_MERGE | elf::SHF_STRINGS) as u64;

    let sections: Vec<_> = loader
        .image
        .sections()
        .iter()
        .filter(|s| {
            let ro_progbits = s.sh_type == elf::SHT_PROGBITS
                && (s.flags == u64::from(elf::SHF_ALLOC)
                    || s.flags == u64::from(elf::SHF_STRINGS)
                    || s.flags == MERGED_STRING_FLAGS);
            let ro_note = s.sh_type == elf::SHT_NOTE && s.flags == u64::from(elf::SHF_ALLOC);
            (ro_progbits || ro_note)
                && s.name != ".modinfo"
                && s.name != "__versions"
                && !s.name.starts_with(".init")
        })
        .cloned()
        .collect();

    for section in sections {
        let align = section.align.max(1) as usize;
        rodata.align_to(align);
        rodata.bytes.extend_from_slice(loader.buf_section(&section));
    }
    rodata.initialized = rodata.bytes.len();

    loader.rodata = rodata;
    Ok(())
}

/// Export the module's symbols into the kernel registry: global objects and
/// functions under their own name, local functions scoped `@@<module>`,
/// function values rebased onto the module's text placement.
fn register_module_symbols(loader: &Loader, registry: &SymbolRegistry) -> Result<()> {
    let text_base = loader.text.base;

    for sym in loader.image.symtab_entries()? {
        if sym.name.is_empty() {
            continue;
        }
        let defined = sym.shndx != elf::SHN_UNDEF
            && sym.shndx != elf::SHN_ABS
            && sym.shndx != elf::SHN_COMMON;
        if !defined {
            continue;
        }

        let section = loader.image.section_by_id(u32::from(sym.shndx))?;
        let section_mem = loader.section_mem_addr(section);
        let address = if sym.value < section_mem {
            sym.value + section_mem
        } else {
            sym.value
        };

        if sym.stype() == elf::STT_OBJECT && sym.bind() == elf::STB_GLOBAL {
            registry.add_symbol(&sym.name, address);
        }

        if sym.stype() == elf::STT_FUNC {
            let name = if sym.bind() == elf::STB_LOCAL {
                scoped_local_name(&sym.name, &loader.name)
            } else {
                registry.add_symbol(&sym.name, address);
                sym.name.clone()
            };
            let address = if address < text_base {
                address + text_base
            } else {
                address
            };
            registry.add_function(&name, address);
        }
    }
    Ok(())
}

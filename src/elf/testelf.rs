//! Test fixture: assembles minimal 64-bit little-endian ELF images in
//! memory so parsing, relocation and patching can be exercised without
//! shipping binary test data.

use object::elf;

use super::image::{EI_CLASS, EI_DATA, EI_VERSION};

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

struct PendingSection {
    name: String,
    sh_type: u32,
    flags: u64,
    addr: u64,
    data: Vec<u8>,
    /// SHT_NOBITS carries no data; the size is explicit.
    nobits_size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

struct PendingSymbol {
    name: String,
    value: u64,
    size: u64,
    info: u8,
    shndx: u16,
}

struct PendingSegment {
    flags: u32,
    first: u32,
    last: u32,
    memsz_extra: u64,
}

pub struct TestElf {
    e_type: u16,
    sections: Vec<PendingSection>,
    symbols: Vec<PendingSymbol>,
    dyn_symbols: Vec<PendingSymbol>,
    dynamic: Vec<(u64, DynValue)>,
    segments: Vec<PendingSegment>,
}

enum DynValue {
    Raw(u64),
    StrOff(String),
}

impl TestElf {
    pub fn new(e_type: u16) -> Self {
        TestElf {
            e_type,
            sections: Vec::new(),
            symbols: Vec::new(),
            dyn_symbols: Vec::new(),
            dynamic: Vec::new(),
            segments: Vec::new(),
        }
    }

    fn push_section(&mut self, section: PendingSection) -> u32 {
        self.sections.push(section);
        // id 0 is the null section, user sections start at 1
        self.sections.len() as u32
    }

    pub fn add_progbits(&mut self, name: &str, data: &[u8], flags: u32, addr: u64) -> u32 {
        self.push_section(PendingSection {
            name: name.into(),
            sh_type: elf::SHT_PROGBITS,
            flags: flags.into(),
            addr,
            data: data.to_vec(),
            nobits_size: 0,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        })
    }

    pub fn add_raw_section(
        &mut self,
        name: &str,
        sh_type: u32,
        flags: u32,
        data: Vec<u8>,
        link: u32,
        info: u32,
    ) -> u32 {
        self.push_section(PendingSection {
            name: name.into(),
            sh_type,
            flags: flags.into(),
            addr: 0,
            data,
            nobits_size: 0,
            link,
            info,
            align: 1,
            entsize: 0,
        })
    }

    pub fn add_nobits(&mut self, name: &str, size: u64, flags: u32, addr: u64) -> u32 {
        self.push_section(PendingSection {
            name: name.into(),
            sh_type: elf::SHT_NOBITS,
            flags: flags.into(),
            addr,
            data: Vec::new(),
            nobits_size: size,
            link: 0,
            info: 0,
            align: 8,
            entsize: 0,
        })
    }

    pub fn add_symbol(&mut self, name: &str, value: u64, bind: u8, stype: u8, shndx: u32) {
        self.symbols.push(PendingSymbol {
            name: name.into(),
            value,
            size: 0,
            info: (bind << 4) | (stype & 0xf),
            shndx: shndx as u16,
        });
    }

    pub fn add_dyn_symbol(&mut self, name: &str, value: u64, bind: u8, stype: u8, shndx: u32) {
        self.dyn_symbols.push(PendingSymbol {
            name: name.into(),
            value,
            size: 0,
            info: (bind << 4) | (stype & 0xf),
            shndx: shndx as u16,
        });
    }

    /// Add a `.rela.<target>` section. `entries` are (r_offset, symbol index
    /// into the symtab built by `add_symbol` calls incl. the null entry,
    /// r_type, r_addend).
    pub fn add_rela(&mut self, target: u32, entries: &[(u64, u32, u32, i64)]) -> u32 {
        let mut data = Vec::new();
        for &(offset, sym, rtype, addend) in entries {
            data.extend_from_slice(&offset.to_le_bytes());
            let info = (u64::from(sym) << 32) | u64::from(rtype);
            data.extend_from_slice(&info.to_le_bytes());
            data.extend_from_slice(&addend.to_le_bytes());
        }
        let name = format!(
            ".rela{}",
            self.sections
                .get(target as usize - 1)
                .map(|s| s.name.clone())
                .unwrap_or_default()
        );
        self.push_section(PendingSection {
            name,
            sh_type: elf::SHT_RELA,
            flags: 0,
            addr: 0,
            data,
            nobits_size: 0,
            link: u32::MAX, // resolved to the symtab id at build time
            info: target,
            align: 8,
            entsize: 24,
        })
    }

    pub fn add_dynamic(&mut self, needed: &[&str], soname: Option<&str>, bind_now: bool) {
        for dep in needed {
            self.dynamic
                .push((elf::DT_NEEDED.into(), DynValue::StrOff((*dep).into())));
        }
        if let Some(soname) = soname {
            self.dynamic
                .push((elf::DT_SONAME.into(), DynValue::StrOff(soname.into())));
        }
        if bind_now {
            self.dynamic.push((elf::DT_BIND_NOW.into(), DynValue::Raw(0)));
        }
    }

    /// Cover sections `first..=last` with one PT_LOAD segment; `memsz_extra`
    /// models trailing zero-initialised memory (bss).
    pub fn add_segment(&mut self, flags: u32, first: u32, last: u32, memsz_extra: u64) {
        self.segments.push(PendingSegment {
            flags,
            first,
            last,
            memsz_extra,
        });
    }

    pub fn build(&self) -> Vec<u8> {
        let mut strtab = vec![0u8];
        let mut sym_name_offs = Vec::new();
        for sym in &self.symbols {
            sym_name_offs.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }

        let mut dynstr = vec![0u8];
        let mut dyn_name_offs = Vec::new();
        for sym in &self.dyn_symbols {
            dyn_name_offs.push(dynstr.len() as u32);
            dynstr.extend_from_slice(sym.name.as_bytes());
            dynstr.push(0);
        }
        let mut dynamic_data = Vec::new();
        {
            let mut entries = Vec::new();
            for (tag, value) in &self.dynamic {
                let val = match value {
                    DynValue::Raw(v) => *v,
                    DynValue::StrOff(s) => {
                        let off = dynstr.len() as u64;
                        dynstr.extend_from_slice(s.as_bytes());
                        dynstr.push(0);
                        off
                    }
                };
                entries.push((*tag, val));
            }
            entries.push((elf::DT_NULL.into(), 0));
            if self.dynamic.is_empty() {
                entries.clear();
            }
            for (tag, val) in entries {
                dynamic_data.extend_from_slice(&tag.to_le_bytes());
                dynamic_data.extend_from_slice(&val.to_le_bytes());
            }
        }

        let mut symtab_data = vec![0u8; 24]; // null symbol
        for (sym, name_off) in self.symbols.iter().zip(&sym_name_offs) {
            symtab_data.extend_from_slice(&name_off.to_le_bytes());
            symtab_data.push(sym.info);
            symtab_data.push(0);
            symtab_data.extend_from_slice(&sym.shndx.to_le_bytes());
            symtab_data.extend_from_slice(&sym.value.to_le_bytes());
            symtab_data.extend_from_slice(&sym.size.to_le_bytes());
        }
        let mut dynsym_data = vec![0u8; 24];
        for (sym, name_off) in self.dyn_symbols.iter().zip(&dyn_name_offs) {
            dynsym_data.extend_from_slice(&name_off.to_le_bytes());
            dynsym_data.push(sym.info);
            dynsym_data.push(0);
            dynsym_data.extend_from_slice(&sym.shndx.to_le_bytes());
            dynsym_data.extend_from_slice(&sym.value.to_le_bytes());
            dynsym_data.extend_from_slice(&sym.size.to_le_bytes());
        }

        // final section list: null + user sections + synthesized tables
        struct Out {
            name: String,
            sh_type: u32,
            flags: u64,
            addr: u64,
            size: u64,
            data: Vec<u8>,
            link: u32,
            info: u32,
            align: u64,
            entsize: u64,
        }

        let mut out: Vec<Out> = vec![Out {
            name: String::new(),
            sh_type: elf::SHT_NULL,
            flags: 0,
            addr: 0,
            size: 0,
            data: Vec::new(),
            link: 0,
            info: 0,
            align: 0,
            entsize: 0,
        }];

        for section in &self.sections {
            let size = if section.sh_type == elf::SHT_NOBITS {
                section.nobits_size
            } else {
                section.data.len() as u64
            };
            out.push(Out {
                name: section.name.clone(),
                sh_type: section.sh_type,
                flags: section.flags,
                addr: section.addr,
                size,
                data: section.data.clone(),
                link: section.link,
                info: section.info,
                align: section.align,
                entsize: section.entsize,
            });
        }

        let mut dynsym_id = 0u32;
        let mut dynstr_id;
        if !self.dyn_symbols.is_empty() || !self.dynamic.is_empty() {
            if !self.dyn_symbols.is_empty() {
                dynsym_id = out.len() as u32;
                out.push(Out {
                    name: ".dynsym".into(),
                    sh_type: elf::SHT_DYNSYM,
                    flags: elf::SHF_ALLOC.into(),
                    addr: 0,
                    size: dynsym_data.len() as u64,
                    data: dynsym_data,
                    link: 0, // fixed below to dynstr
                    info: 1,
                    align: 8,
                    entsize: 24,
                });
            }
            dynstr_id = out.len() as u32;
            if !self.dynamic.is_empty() {
                dynstr_id += 1;
                out.push(Out {
                    name: ".dynamic".into(),
                    sh_type: elf::SHT_DYNAMIC,
                    flags: (elf::SHF_ALLOC | elf::SHF_WRITE).into(),
                    addr: 0,
                    size: dynamic_data.len() as u64,
                    data: dynamic_data,
                    link: dynstr_id,
                    info: 0,
                    align: 8,
                    entsize: 16,
                });
            }
            out.push(Out {
                name: ".dynstr".into(),
                sh_type: elf::SHT_STRTAB,
                flags: elf::SHF_ALLOC.into(),
                addr: 0,
                size: dynstr.len() as u64,
                data: dynstr,
                link: 0,
                info: 0,
                align: 1,
                entsize: 0,
            });
            if dynsym_id != 0 {
                out[dynsym_id as usize].link = dynstr_id;
            }
        }

        let symtab_id = out.len() as u32;
        let strtab_id = symtab_id + 1;
        out.push(Out {
            name: ".symtab".into(),
            sh_type: elf::SHT_SYMTAB,
            flags: 0,
            addr: 0,
            size: symtab_data.len() as u64,
            data: symtab_data,
            link: strtab_id,
            info: 1,
            align: 8,
            entsize: 24,
        });
        out.push(Out {
            name: ".strtab".into(),
            sh_type: elf::SHT_STRTAB,
            flags: 0,
            addr: 0,
            size: strtab.len() as u64,
            data: strtab,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        });

        // shstrtab last
        let mut shstrtab = vec![0u8];
        let mut name_offs = Vec::new();
        for section in &out {
            if section.name.is_empty() {
                name_offs.push(0u32);
            } else {
                name_offs.push(shstrtab.len() as u32);
                shstrtab.extend_from_slice(section.name.as_bytes());
                shstrtab.push(0);
            }
        }
        name_offs.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(b".shstrtab\0");
        let shstrndx = out.len() as u32;
        out.push(Out {
            name: ".shstrtab".into(),
            sh_type: elf::SHT_STRTAB,
            flags: 0,
            addr: 0,
            size: shstrtab.len() as u64,
            data: shstrtab,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        });

        // resolve deferred rela links now that the symtab id is known
        for section in out.iter_mut() {
            if section.sh_type == elf::SHT_RELA && section.link == u32::MAX {
                section.link = symtab_id;
            }
        }

        // layout: ehdr, phdrs, section data (8-aligned), shdrs
        let phnum = self.segments.len();
        let mut cursor = EHDR_SIZE + phnum * PHDR_SIZE;
        let mut offsets = vec![0u64; out.len()];
        for (i, section) in out.iter().enumerate() {
            if section.sh_type == elf::SHT_NULL || section.sh_type == elf::SHT_NOBITS {
                continue;
            }
            cursor = (cursor + 7) & !7;
            offsets[i] = cursor as u64;
            cursor += section.data.len();
        }
        let shoff = (cursor + 7) & !7;

        let mut bytes = vec![0u8; shoff + out.len() * SHDR_SIZE];
        bytes[0..4].copy_from_slice(&super::image::ELF_MAGIC);
        bytes[EI_CLASS] = elf::ELFCLASS64;
        bytes[EI_DATA] = elf::ELFDATA2LSB;
        bytes[EI_VERSION] = 1; // EV_CURRENT
        bytes[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        bytes[18..20].copy_from_slice(&elf::EM_X86_64.to_le_bytes());
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
        let phoff: u64 = if phnum > 0 { EHDR_SIZE as u64 } else { 0 };
        bytes[32..40].copy_from_slice(&phoff.to_le_bytes());
        bytes[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
        bytes[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        bytes[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        bytes[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());
        bytes[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        bytes[60..62].copy_from_slice(&(out.len() as u16).to_le_bytes());
        bytes[62..64].copy_from_slice(&(shstrndx as u16).to_le_bytes());

        for (i, segment) in self.segments.iter().enumerate() {
            let first = segment.first as usize;
            let last = segment.last as usize;
            let p_offset = offsets[first];
            let p_vaddr = out[first].addr;
            let last_filled = (first..=last)
                .rev()
                .find(|&i| out[i].sh_type != elf::SHT_NOBITS)
                .unwrap_or(first);
            let filesz = offsets[last_filled] + out[last_filled].size - p_offset;
            let memsz = out[last].addr + out[last].size - p_vaddr + segment.memsz_extra;

            let base = EHDR_SIZE + i * PHDR_SIZE;
            bytes[base..base + 4].copy_from_slice(&elf::PT_LOAD.to_le_bytes());
            bytes[base + 4..base + 8].copy_from_slice(&segment.flags.to_le_bytes());
            bytes[base + 8..base + 16].copy_from_slice(&p_offset.to_le_bytes());
            bytes[base + 16..base + 24].copy_from_slice(&p_vaddr.to_le_bytes());
            bytes[base + 24..base + 32].copy_from_slice(&p_vaddr.to_le_bytes());
            bytes[base + 32..base + 40].copy_from_slice(&filesz.to_le_bytes());
            bytes[base + 40..base + 48].copy_from_slice(&memsz.to_le_bytes());
            bytes[base + 48..base + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        }

        for (i, section) in out.iter().enumerate() {
            let off = offsets[i];
            if section.sh_type != elf::SHT_NULL && section.sh_type != elf::SHT_NOBITS {
                bytes[off as usize..off as usize + section.data.len()]
                    .copy_from_slice(&section.data);
            }
            let base = shoff + i * SHDR_SIZE;
            bytes[base..base + 4].copy_from_slice(&name_offs[i].to_le_bytes());
            bytes[base + 4..base + 8].copy_from_slice(&section.sh_type.to_le_bytes());
            bytes[base + 8..base + 16].copy_from_slice(&section.flags.to_le_bytes());
            bytes[base + 16..base + 24].copy_from_slice(&section.addr.to_le_bytes());
            bytes[base + 24..base + 32].copy_from_slice(&off.to_le_bytes());
            bytes[base + 32..base + 40].copy_from_slice(&section.size.to_le_bytes());
            bytes[base + 40..base + 44].copy_from_slice(&section.link.to_le_bytes());
            bytes[base + 44..base + 48].copy_from_slice(&section.info.to_le_bytes());
            bytes[base + 48..base + 56].copy_from_slice(&section.align.to_le_bytes());
            bytes[base + 56..base + 64].copy_from_slice(&section.entsize.to_le_bytes());
        }

        bytes
    }
}

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use object::elf;

use super::le;
use crate::error::VerifyError;
use crate::prelude::*;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;
const DYN_SIZE: usize = 16;

pub(crate) const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub(crate) const EI_CLASS: usize = 4;
pub(crate) const EI_DATA: usize = 5;
pub(crate) const EI_VERSION: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Relocatable,
    Executable,
    SharedObject,
}

/// One entry of the section header table.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub name: String,
    pub id: u32,
    pub sh_type: u32,
    pub flags: u64,
    /// Target virtual address of the section.
    pub addr: u64,
    /// Offset of the section contents in the file.
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub align: u64,
    pub entsize: u64,
}

impl SectionInfo {
    pub fn contains_vaddr(&self, vaddr: u64) -> bool {
        self.addr <= vaddr && vaddr < self.addr + self.size
    }

    pub fn contains_file_offset(&self, off: u64) -> bool {
        self.sh_type != elf::SHT_NOBITS && self.offset <= off && off < self.offset + self.size
    }

    pub fn is_alloc(&self) -> bool {
        self.flags & u64::from(elf::SHF_ALLOC) != 0
    }

    pub fn is_exec(&self) -> bool {
        self.flags & u64::from(elf::SHF_EXECINSTR) != 0
    }
}

/// One PT_LOAD entry of the program header table.
#[derive(Debug, Clone, Copy)]
pub struct SegmentInfo {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl SegmentInfo {
    pub fn contains_vaddr(&self, vaddr: u64) -> bool {
        self.vaddr <= vaddr && vaddr <= self.vaddr + self.memsz
    }
}

/// A defined symbol exported by an ELF, as needed for cross-loader
/// resolution: the file-level value plus the flags of the segment the symbol
/// lives in (used to match the in-guest mapping).
#[derive(Debug, Clone)]
pub struct ElfSymbol {
    pub name: String,
    pub value: u64,
    pub info: u8,
    pub segment: Option<SegmentInfo>,
}

impl ElfSymbol {
    pub fn bind(&self) -> u8 {
        self.info >> 4
    }
}

/// A RELA relocation entry in decoded form.
#[derive(Debug, Clone, Copy)]
pub struct RelaEntry {
    pub offset: u64,
    pub sym: u32,
    pub rtype: u32,
    pub addend: i64,
}

/// A full symbol-table entry (from `.symtab` or `.dynsym`).
#[derive(Debug, Clone)]
pub struct SymtabEntry {
    pub name: String,
    pub value: u64,
    pub info: u8,
    pub shndx: u16,
}

impl SymtabEntry {
    pub fn bind(&self) -> u8 {
        self.info >> 4
    }

    pub fn stype(&self) -> u8 {
        self.info & 0xf
    }
}

#[derive(Debug)]
enum Backing {
    Mapped(#[allow(dead_code)] File, Mmap),
    Buffer(Vec<u8>),
}

/// A parsed 64-bit little-endian ELF file.
///
/// The file stays mapped (or buffered) for the lifetime of the image; all
/// structure access decodes from the raw bytes on demand.
#[derive(Debug)]
pub struct ElfImage {
    path: PathBuf,
    backing: Backing,
    kind: ObjectKind,
    sections: Vec<SectionInfo>,
    section_names: HashMap<String, u32>,
    segments: Vec<SegmentInfo>,
    /// id of `.symtab` (0 when absent) and its string table.
    symtab_id: u32,
    symtab_str_id: u32,
    /// name -> st_value over the whole `.symtab`.
    symbol_addrs: HashMap<String, u64>,
}

impl ElfImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map {}", path.display()))?;
        Self::parse(path.to_path_buf(), Backing::Mapped(file, mmap))
    }

    /// Parse an ELF out of an in-memory buffer (e.g. the vdso image read
    /// from guest memory).
    pub fn from_bytes(name: &str, bytes: Vec<u8>) -> Result<Self> {
        Self::parse(PathBuf::from(name), Backing::Buffer(bytes))
    }

    fn parse(path: PathBuf, backing: Backing) -> Result<Self> {
        let data = match &backing {
            Backing::Mapped(_, mmap) => &mmap[..],
            Backing::Buffer(buf) => &buf[..],
        };
        let display = path.display().to_string();

        if data.len() < EHDR_SIZE || data[..4] != ELF_MAGIC {
            return Err(VerifyError::BadMagic(display).into());
        }
        if data[EI_CLASS] != elf::ELFCLASS64 {
            return Err(VerifyError::Unsupported(format!("{display}: not a 64-bit ELF")).into());
        }
        if data[EI_DATA] != elf::ELFDATA2LSB {
            return Err(
                VerifyError::Unsupported(format!("{display}: not little-endian")).into(),
            );
        }

        let e_type = le::u16_at(data, 16).unwrap();
        let kind = match e_type {
            elf::ET_REL => ObjectKind::Relocatable,
            elf::ET_EXEC => ObjectKind::Executable,
            elf::ET_DYN => ObjectKind::SharedObject,
            other => {
                return Err(
                    VerifyError::Unsupported(format!("{display}: e_type {other}")).into(),
                );
            }
        };

        let e_phoff = le::u64_at(data, 32).unwrap() as usize;
        let e_shoff = le::u64_at(data, 40).unwrap() as usize;
        let e_phnum = le::u16_at(data, 56).unwrap() as usize;
        let e_shnum = le::u16_at(data, 60).unwrap() as usize;
        let e_shstrndx = le::u16_at(data, 62).unwrap() as usize;

        // Raw section headers first; names need the shstrtab which is
        // itself one of the sections.
        let mut raw = Vec::with_capacity(e_shnum);
        for i in 0..e_shnum {
            let base = e_shoff + i * SHDR_SIZE;
            let section = (|| {
                Some(SectionInfo {
                    name: String::new(),
                    id: i as u32,
                    sh_type: le::u32_at(data, base + 4)?,
                    flags: le::u64_at(data, base + 8)?,
                    addr: le::u64_at(data, base + 16)?,
                    offset: le::u64_at(data, base + 24)?,
                    size: le::u64_at(data, base + 32)?,
                    link: le::u32_at(data, base + 40)?,
                    info: le::u32_at(data, base + 44)?,
                    align: le::u64_at(data, base + 48)?,
                    entsize: le::u64_at(data, base + 56)?,
                })
            })()
            .ok_or_else(|| anyhow!("{display}: truncated section header table"))?;
            raw.push((le::u32_at(data, base).unwrap(), section));
        }

        let shstr = raw
            .get(e_shstrndx)
            .map(|(_, s)| (s.offset as usize, s.size as usize))
            .ok_or_else(|| anyhow!("{display}: bad e_shstrndx {e_shstrndx}"))?;
        let shstrtab = data
            .get(shstr.0..shstr.0 + shstr.1)
            .ok_or_else(|| anyhow!("{display}: shstrtab out of bounds"))?;

        let mut sections = Vec::with_capacity(e_shnum);
        let mut section_names = HashMap::new();
        let mut symtab_id = 0u32;
        let mut symtab_str_id = 0u32;
        for (name_off, mut section) in raw {
            section.name = le::str_at(shstrtab, name_off as usize)
                .unwrap_or_default()
                .to_string();
            if section.sh_type == elf::SHT_SYMTAB {
                symtab_id = section.id;
                symtab_str_id = section.link;
            }
            section_names.entry(section.name.clone()).or_insert(section.id);
            sections.push(section);
        }

        let mut segments = Vec::new();
        for i in 0..e_phnum {
            let base = e_phoff + i * PHDR_SIZE;
            let p_type = le::u32_at(data, base)
                .ok_or_else(|| anyhow!("{display}: truncated program header table"))?;
            if p_type != elf::PT_LOAD {
                continue;
            }
            segments.push(SegmentInfo {
                p_type,
                flags: le::u32_at(data, base + 4).unwrap(),
                offset: le::u64_at(data, base + 8).unwrap(),
                vaddr: le::u64_at(data, base + 16).unwrap(),
                paddr: le::u64_at(data, base + 24).unwrap(),
                filesz: le::u64_at(data, base + 32).unwrap(),
                memsz: le::u64_at(data, base + 40).unwrap(),
                align: le::u64_at(data, base + 48).unwrap(),
            });
        }

        let mut image = ElfImage {
            path,
            backing,
            kind,
            sections,
            section_names,
            segments,
            symtab_id,
            symtab_str_id,
            symbol_addrs: HashMap::new(),
        };

        if symtab_id != 0 {
            for sym in image.symtab_entries()? {
                if !sym.name.is_empty() {
                    image.symbol_addrs.insert(sym.name, sym.value);
                }
            }
        }

        Ok(image)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(_, mmap) => &mmap[..],
            Backing::Buffer(buf) => &buf[..],
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_relocatable(&self) -> bool {
        self.kind == ObjectKind::Relocatable
    }

    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    pub fn section_by_id(&self, id: u32) -> Result<&SectionInfo> {
        self.sections
            .get(id as usize)
            .ok_or_else(|| VerifyError::not_found(format!("section id {id}")).into())
    }

    pub fn section_by_name(&self, name: &str) -> Result<&SectionInfo> {
        self.section_names
            .get(name)
            .map(|&id| &self.sections[id as usize])
            .ok_or_else(|| VerifyError::not_found(format!("section {name}")).into())
    }

    pub fn section_by_offset(&self, off: u64) -> Option<&SectionInfo> {
        self.sections
            .iter()
            .skip(1)
            .find(|s| s.contains_file_offset(off))
    }

    /// Raw file bytes of a section; empty for SHT_NOBITS.
    pub fn section_data(&self, section: &SectionInfo) -> &[u8] {
        if section.sh_type == elf::SHT_NOBITS {
            return &[];
        }
        let start = section.offset as usize;
        let end = start + section.size as usize;
        self.data().get(start..end).unwrap_or(&[])
    }

    pub fn is_code_address(&self, vaddr: u64) -> bool {
        match self.sections.iter().find(|s| s.contains_vaddr(vaddr)) {
            Some(s) => s.is_alloc() && s.is_exec(),
            None => false,
        }
    }

    pub fn is_data_address(&self, vaddr: u64) -> bool {
        match self.sections.iter().find(|s| s.contains_vaddr(vaddr)) {
            Some(s) => s.is_alloc() && !s.is_exec(),
            None => false,
        }
    }

    /// Address of a named symbol from the full symbol table.
    pub fn symbol_addr(&self, name: &str) -> Option<u64> {
        self.symbol_addrs.get(name).copied()
    }

    fn decode_symtab(&self, symtab_id: u32, str_id: u32) -> Result<Vec<SymtabEntry>> {
        let symtab = self.section_by_id(symtab_id)?;
        let strtab = self.section_by_id(str_id)?;
        let data = self.section_data(symtab);
        let strings = self.section_data(strtab);

        let count = data.len() / SYM_SIZE;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let base = i * SYM_SIZE;
            let name_off = le::u32_at(data, base).unwrap() as usize;
            out.push(SymtabEntry {
                name: le::str_at(strings, name_off).unwrap_or_default().to_string(),
                info: data[base + 4],
                shndx: le::u16_at(data, base + 6).unwrap(),
                value: le::u64_at(data, base + 8).unwrap(),
            });
        }
        Ok(out)
    }

    /// Every entry of `.symtab`.
    pub fn symtab_entries(&self) -> Result<Vec<SymtabEntry>> {
        if self.symtab_id == 0 {
            return Ok(Vec::new());
        }
        self.decode_symtab(self.symtab_id, self.symtab_str_id)
    }

    /// The defined global and weak dynamic symbols this ELF exports for
    /// cross-object resolution. Undefined, absolute and common entries are
    /// excluded.
    pub fn exported_symbols(&self) -> Result<Vec<ElfSymbol>> {
        if self.kind == ObjectKind::Relocatable {
            return Ok(Vec::new());
        }
        let dynsym = match self.section_by_name(".dynsym") {
            Ok(s) => s,
            Err(_) => return Ok(Vec::new()),
        };
        let entries = self.decode_symtab(dynsym.id, dynsym.link)?;

        let mut out = Vec::new();
        for sym in entries {
            let bind = sym.bind();
            if bind != elf::STB_GLOBAL && bind != elf::STB_WEAK {
                continue;
            }
            if sym.shndx == elf::SHN_UNDEF
                || sym.shndx == elf::SHN_ABS
                || sym.shndx == elf::SHN_COMMON
            {
                continue;
            }
            let segment = self
                .segments
                .iter()
                .find(|seg| seg.contains_vaddr(sym.value))
                .copied();
            out.push(ElfSymbol {
                name: sym.name,
                value: sym.value,
                info: sym.info,
                segment,
            });
        }
        Ok(out)
    }

    /// Decode the entries of one SHT_RELA section.
    pub fn rela_entries(&self, section: &SectionInfo) -> Result<Vec<RelaEntry>> {
        if section.sh_type != elf::SHT_RELA {
            return Err(VerifyError::InternalError(format!(
                "section {} is not SHT_RELA",
                section.name
            ))
            .into());
        }
        let data = self.section_data(section);
        let count = data.len() / RELA_SIZE;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let base = i * RELA_SIZE;
            let info = le::u64_at(data, base + 8).unwrap();
            out.push(RelaEntry {
                offset: le::u64_at(data, base).unwrap(),
                sym: (info >> 32) as u32,
                rtype: (info & 0xffff_ffff) as u32,
                addend: le::i64_at(data, base + 16).unwrap(),
            });
        }
        Ok(out)
    }

    /// All SHT_RELA sections. A non-empty SHT_REL section is a toolchain we
    /// do not produce and aborts the file.
    pub fn rela_sections(&self) -> Result<Vec<&SectionInfo>> {
        for section in &self.sections {
            if section.sh_type == elf::SHT_REL && section.size > 0 {
                return Err(VerifyError::UnexpectedRel.into());
            }
        }
        Ok(self
            .sections
            .iter()
            .filter(|s| s.sh_type == elf::SHT_RELA)
            .collect())
    }

    fn dynamic_entries(&self) -> Result<Vec<(u64, u64)>> {
        let dynamic = self.section_by_name(".dynamic")?;
        let data = self.section_data(dynamic);
        let mut out = Vec::new();
        for i in 0..data.len() / DYN_SIZE {
            let base = i * DYN_SIZE;
            let tag = le::u64_at(data, base).unwrap();
            if tag == u64::from(elf::DT_NULL) {
                break;
            }
            out.push((tag, le::u64_at(data, base + 8).unwrap()));
        }
        Ok(out)
    }

    /// Names of the DT_NEEDED dependencies. Empty for static executables.
    pub fn needed(&self) -> Result<Vec<String>> {
        if self.kind == ObjectKind::Relocatable {
            return Ok(Vec::new());
        }
        let Ok(dynamic) = self.dynamic_entries() else {
            return Ok(Vec::new());
        };
        let dynstr = self.section_by_name(".dynstr")?;
        let strings = self.section_data(dynstr);

        let mut deps = Vec::new();
        for (tag, val) in dynamic {
            if tag == u64::from(elf::DT_NEEDED) {
                if let Some(name) = le::str_at(strings, val as usize) {
                    deps.push(name.to_string());
                }
            }
        }
        Ok(deps)
    }

    /// A DT_SONAME entry distinguishes a shared library from a
    /// position-independent executable.
    pub fn is_dynamic_library(&self) -> bool {
        match self.dynamic_entries() {
            Ok(entries) => entries
                .iter()
                .any(|&(tag, _)| tag == u64::from(elf::DT_SONAME)),
            Err(_) => false,
        }
    }

    /// DT_BIND_NOW (or DF_BIND_NOW in DT_FLAGS) disables lazy binding.
    pub fn is_bind_now(&self) -> bool {
        match self.dynamic_entries() {
            Ok(entries) => entries.iter().any(|&(tag, val)| {
                tag == u64::from(elf::DT_BIND_NOW)
                    || (tag == u64::from(elf::DT_FLAGS) && val & u64::from(elf::DF_BIND_NOW) != 0)
            }),
            Err(_) => false,
        }
    }

    pub fn code_segment(&self) -> Result<&SegmentInfo> {
        self.segments
            .iter()
            .find(|seg| seg.p_type == elf::PT_LOAD && seg.flags == elf::PF_X | elf::PF_R)
            .ok_or_else(|| VerifyError::not_found("code segment").into())
    }

    pub fn data_segment(&self) -> Result<&SegmentInfo> {
        self.segments
            .iter()
            .find(|seg| seg.p_type == elf::PT_LOAD && seg.flags & elf::PF_X == 0)
            .ok_or_else(|| VerifyError::not_found("data segment").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testelf::TestElf;

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-elf");
        std::fs::write(&path, b"MZ\x90\x00 definitely a PE").unwrap();

        let err = ElfImage::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_32_bit() {
        let mut bytes = TestElf::new(elf::ET_REL).build();
        bytes[EI_CLASS] = elf::ELFCLASS32;
        let err = ElfImage::from_bytes("elf32", bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::Unsupported(_))
        ));
    }

    #[test]
    fn section_lookup_by_name_and_offset() {
        let mut builder = TestElf::new(elf::ET_REL);
        builder.add_progbits(".text", b"\x90\x90\x90\x90", elf::SHF_ALLOC | elf::SHF_EXECINSTR, 0);
        builder.add_progbits(".rodata", b"abcd", elf::SHF_ALLOC, 0);
        let image = ElfImage::from_bytes("sections", builder.build()).unwrap();

        let text = image.section_by_name(".text").unwrap();
        assert_eq!(image.section_data(text), b"\x90\x90\x90\x90");
        assert_eq!(image.section_by_offset(text.offset).unwrap().name, ".text");

        let err = image.section_by_name(".altinstructions").unwrap_err();
        assert!(VerifyError::is_not_found(&err));
    }

    #[test]
    fn code_and_data_address_classification() {
        let mut builder = TestElf::new(elf::ET_EXEC);
        builder.add_progbits(
            ".text",
            b"\xc3\xc3",
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            0x401000,
        );
        builder.add_progbits(".data", b"\x00\x00", elf::SHF_ALLOC | elf::SHF_WRITE, 0x402000);
        let image = ElfImage::from_bytes("addrs", builder.build()).unwrap();

        assert!(image.is_code_address(0x401001));
        assert!(!image.is_code_address(0x402000));
        assert!(image.is_data_address(0x402001));
        assert!(!image.is_data_address(0x403000));
    }

    #[test]
    fn symtab_round_trip() {
        let mut builder = TestElf::new(elf::ET_REL);
        let text = builder.add_progbits(".text", &[0u8; 32], elf::SHF_ALLOC | elf::SHF_EXECINSTR, 0);
        builder.add_symbol("local_helper", 0x10, elf::STB_LOCAL, elf::STT_FUNC, text);
        builder.add_symbol("exported_fn", 0x18, elf::STB_GLOBAL, elf::STT_FUNC, text);
        let image = ElfImage::from_bytes("syms", builder.build()).unwrap();

        let syms = image.symtab_entries().unwrap();
        let exported = syms.iter().find(|s| s.name == "exported_fn").unwrap();
        assert_eq!(exported.value, 0x18);
        assert_eq!(exported.bind(), elf::STB_GLOBAL);
        assert_eq!(image.symbol_addr("local_helper"), Some(0x10));
    }

    #[test]
    fn nonempty_rel_section_is_rejected() {
        let mut builder = TestElf::new(elf::ET_REL);
        let text = builder.add_progbits(".text", &[0u8; 8], elf::SHF_ALLOC | elf::SHF_EXECINSTR, 0);
        builder.add_raw_section(".rel.text", elf::SHT_REL, 0, vec![0u8; 16], 0, text);
        let image = ElfImage::from_bytes("rel", builder.build()).unwrap();

        let err = image.rela_sections().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::UnexpectedRel)
        ));
    }

    #[test]
    fn needed_and_soname() {
        let mut builder = TestElf::new(elf::ET_DYN);
        builder.add_dynamic(&["libc.so.6", "libm.so.6"], Some("libfoo.so.1"), false);
        let image = ElfImage::from_bytes("libfoo", builder.build()).unwrap();

        assert_eq!(image.needed().unwrap(), vec!["libc.so.6", "libm.so.6"]);
        assert!(image.is_dynamic_library());
        assert!(!image.is_bind_now());
    }
}

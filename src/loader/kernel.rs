//! Kernel image reconstruction.
//!
//! The kernel's resident text is `.text`, zero-padded out to `.notes`, then
//! `__ex_table`, padded to a 2 MiB large-page boundary; read-only data runs
//! from `.rodata` to the end of `__modver`. All five patch passes are
//! applied along the way.

use super::{Loader, LoaderKind, Region};
use crate::elf::ElfImage;
use crate::guest::GuestMemory;
use crate::guest::types::TypeOracle;
use crate::patch::{self, PatchContext};
use crate::prelude::*;
use crate::symbols::{SymbolRegistry, scoped_local_name};

use object::elf;

/// Large-page granularity of the kernel's code mapping.
pub const KERNEL_CODEPAGE_SIZE: usize = 0x200000;

/// Distinguished addresses the comparator needs, captured while the kernel
/// image is built.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelAddresses {
    pub fentry: u64,
    pub copy_user_generic_unrolled: u64,
    pub idt_table: u64,
    pub nmi_idt_table: u64,
    pub sinittext: u64,
    pub irq_entries_start: u64,
}

pub fn build_kernel_loader(
    image: ElfImage,
    ctx: &PatchContext,
    oracle: &dyn TypeOracle,
    memory: &dyn GuestMemory,
) -> Result<Loader> {
    let mut loader = Loader::new(LoaderKind::Kernel, "kernel".into(), image);

    patch::apply_alternatives(&mut loader, ctx)?;
    patch::apply_paravirt(&mut loader, ctx, memory)?;
    patch::apply_smp_locks(&mut loader, ctx)?;

    let text_section = loader.image.section_by_name(".text")?.clone();
    let mut text = Region::new(text_section.addr);
    text.bytes
        .extend_from_slice(loader.buf_section(&text_section));

    // sections are concatenated at their file-offset distances so the
    // in-memory layout is reproduced
    for name in [".notes", "__ex_table"] {
        let section = loader.image.section_by_name(name)?.clone();
        text.pad_to((section.offset - text_section.offset) as usize);
        text.bytes.extend_from_slice(loader.buf_section(&section));
    }
    text.initialized = text.bytes.len();
    loader.text = text;

    let mcount = symbol_span_bytes(&loader, "__start_mcount_loc", "__stop_mcount_loc")?;
    patch::apply_mcount(&mut loader, ctx, &patch::decode_mcount_entries(&mcount));

    let jump_table = symbol_span_bytes(&loader, "__start___jump_table", "__stop___jump_table")?;
    let entries = patch::decode_jump_entries(&jump_table);
    patch::apply_jump_entries(&mut loader, ctx, oracle, memory, &entries)?;

    let fill = KERNEL_CODEPAGE_SIZE - (loader.text.bytes.len() % KERNEL_CODEPAGE_SIZE);
    let len = loader.text.bytes.len() + fill;
    loader.text.pad_to(len);

    build_rodata(&mut loader)?;

    Ok(loader)
}

fn build_rodata(loader: &mut Loader) -> Result<()> {
    let rodata_section = loader.image.section_by_name(".rodata")?.clone();
    let modver = loader.image.section_by_name("__modver")?.clone();

    let mut rodata = Region::new(rodata_section.addr);
    let start = rodata_section.offset as usize;
    let end = (modver.offset + modver.size) as usize;
    rodata.bytes.extend_from_slice(&loader.file_buf[start..end]);
    rodata.initialized = rodata.bytes.len();

    let fill = KERNEL_CODEPAGE_SIZE - (rodata.bytes.len() % KERNEL_CODEPAGE_SIZE);
    let len = rodata.bytes.len() + fill;
    rodata.pad_to(len);

    loader.rodata = rodata;
    Ok(())
}

/// Count direct `CALL __fentry__` instructions remaining in a text image.
/// A fully patched reconstruction contains none.
pub fn count_fentry_calls(text: &super::Region, fentry: u64) -> usize {
    let limit = text.initialized.min(text.bytes.len());
    if fentry == 0 || limit < 5 {
        return 0;
    }
    let mut count = 0;
    for i in 0..limit - 4 {
        if text.bytes[i] != 0xe8 {
            continue;
        }
        let disp = i32::from_le_bytes(text.bytes[i + 1..i + 5].try_into().unwrap());
        let target = text
            .base
            .wrapping_add(i as u64 + 5)
            .wrapping_add(disp as i64 as u64);
        if target == fentry {
            count += 1;
        }
    }
    count
}

/// File bytes between two symbols (e.g. `__start_mcount_loc` and
/// `__stop_mcount_loc`), located through the section that contains them.
fn symbol_span_bytes(loader: &Loader, start_sym: &str, stop_sym: &str) -> Result<Vec<u8>> {
    let start = loader
        .image
        .symbol_addr(start_sym)
        .ok_or_else(|| anyhow!("symbol {start_sym} not found"))?;
    let stop = loader
        .image
        .symbol_addr(stop_sym)
        .ok_or_else(|| anyhow!("symbol {stop_sym} not found"))?;
    if stop < start {
        bail!("symbol range {start_sym}..{stop_sym} is inverted");
    }

    let section = loader
        .image
        .sections()
        .iter()
        .skip(1)
        .find(|s| s.contains_vaddr(start))
        .ok_or_else(|| anyhow!("{start_sym} not contained in any section"))?;

    let file_start = (section.offset + (start - section.addr)) as usize;
    let file_end = file_start + (stop - start) as usize;
    Ok(loader.file_buf[file_start..file_end].to_vec())
}

pub fn kernel_addresses(image: &ElfImage, registry: &SymbolRegistry) -> KernelAddresses {
    let lookup = |name: &str| {
        image
            .symbol_addr(name)
            .or_else(|| registry.symbol_address(name))
            .unwrap_or(0)
    };
    KernelAddresses {
        fentry: lookup("__fentry__"),
        copy_user_generic_unrolled: lookup("copy_user_generic_unrolled"),
        idt_table: lookup("idt_table"),
        nmi_idt_table: lookup("nmi_idt_table"),
        sinittext: lookup("_sinittext"),
        irq_entries_start: lookup("irq_entries_start"),
    }
}

/// Feed the kernel's symbol table into the registry: every named symbol,
/// locals scoped `@@kernel`, functions additionally into the function map
/// with section-relative values rebased onto the text base.
pub fn register_kernel_symbols(
    image: &ElfImage,
    registry: &SymbolRegistry,
    text_base: u64,
) -> Result<()> {
    for sym in image.symtab_entries()? {
        if sym.name.is_empty() {
            continue;
        }
        let name = if sym.bind() == elf::STB_LOCAL {
            scoped_local_name(&sym.name, "kernel")
        } else {
            sym.name.clone()
        };

        registry.add_symbol(&name, sym.value);

        if sym.stype() == elf::STT_FUNC {
            let mut address = sym.value;
            if address < text_base {
                address += text_base;
            }
            registry.add_function(&name, address);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testelf::TestElf;
    use crate::guest::mock::MockGuest;
    use crate::patch::nops::NopFamily;
    use crate::patch::paravirt::ParavirtState;
    use crate::patch::paravirt::tests::pv_oracle;
    use crate::patch::{CpuCaps, JumpEntry};

    const TEXT_VA: u64 = 0xffffffff81000000;

    fn kernel_image() -> ElfImage {
        let mut builder = TestElf::new(elf::ET_EXEC);
        // a `call __fentry__` site at +0, a jump-label site at +0x10
        let mut text = vec![0u8; 0x40];
        text[..5].copy_from_slice(&[0xe8, 0x2b, 0x00, 0x00, 0x00]);
        builder.add_progbits(".text", &text, elf::SHF_ALLOC | elf::SHF_EXECINSTR, TEXT_VA);
        builder.add_progbits(".notes", b"\x01\x02\x03\x04", elf::SHF_ALLOC, TEXT_VA + 0x100000);
        builder.add_progbits("__ex_table", &[0xeeu8; 8], elf::SHF_ALLOC, TEXT_VA + 0x100100);

        // one mcount entry and one jump entry live in .data
        let data_va = 0xffffffff81a00000u64;
        let mut data = Vec::new();
        data.extend_from_slice(&TEXT_VA.to_le_bytes()); // __mcount_loc[0]
        let jump = JumpEntry {
            code: TEXT_VA + 0x10,
            target: TEXT_VA + 0x20,
            key: 0xffffffff82000000,
        };
        data.extend_from_slice(&jump.code.to_le_bytes());
        data.extend_from_slice(&jump.target.to_le_bytes());
        data.extend_from_slice(&jump.key.to_le_bytes());
        let data_id =
            builder.add_progbits(".data", &data, elf::SHF_ALLOC | elf::SHF_WRITE, data_va);

        builder.add_progbits(".rodata", b"read-only-data!!", elf::SHF_ALLOC, 0xffffffff81600000);
        builder.add_progbits("__modver", &[0xabu8; 8], elf::SHF_ALLOC, 0xffffffff81600100);

        builder.add_symbol(
            "__start_mcount_loc",
            data_va,
            elf::STB_GLOBAL,
            elf::STT_NOTYPE,
            data_id,
        );
        builder.add_symbol(
            "__stop_mcount_loc",
            data_va + 8,
            elf::STB_GLOBAL,
            elf::STT_NOTYPE,
            data_id,
        );
        builder.add_symbol(
            "__start___jump_table",
            data_va + 8,
            elf::STB_GLOBAL,
            elf::STT_NOTYPE,
            data_id,
        );
        builder.add_symbol(
            "__stop___jump_table",
            data_va + 32,
            elf::STB_GLOBAL,
            elf::STT_NOTYPE,
            data_id,
        );
        builder.add_symbol("__fentry__", TEXT_VA + 0x30, elf::STB_GLOBAL, elf::STT_FUNC, 1);
        ElfImage::from_bytes("vmlinux", builder.build()).unwrap()
    }

    fn jump_key_oracle() -> crate::guest::types::fake::FakeTypes {
        use crate::guest::types::{Member, MemberKind};
        let mut types = pv_oracle();
        types.add_struct(
            "static_key",
            8,
            vec![Member {
                name: "enabled".into(),
                offset: 0,
                size: 4,
                kind: MemberKind::Struct("atomic_t".into()),
            }],
        );
        types.add_struct(
            "atomic_t",
            4,
            vec![Member {
                name: "counter".into(),
                offset: 0,
                size: 4,
                kind: MemberKind::Scalar,
            }],
        );
        types
    }

    #[test]
    fn kernel_text_composition_and_patching() {
        let types = jump_key_oracle();
        let mut guest = MockGuest::new();
        guest.map_kernel(0xffffffff81e00000, vec![0u8; 0x700], false);
        guest.map_kernel(0xffffffff82000000, 0i32.to_le_bytes().to_vec(), false);

        let ctx = PatchContext {
            nops: NopFamily::P6,
            caps: CpuCaps([0u32; 10]),
            pv: ParavirtState::load(&types).unwrap(),
        };
        let loader = build_kernel_loader(kernel_image(), &ctx, &types, &guest).unwrap();

        // mcount call at offset 0 replaced with the 5-byte NOP; no
        // __fentry__ call survives in the reconstruction
        assert_eq!(&loader.text.bytes[..5], NopFamily::P6.nop5());
        assert_eq!(count_fentry_calls(&loader.text, TEXT_VA + 0x30), 0);
        // disabled jump label at +0x10 is a 5-byte NOP too, and recorded
        assert_eq!(&loader.text.bytes[0x10..0x15], NopFamily::P6.nop5());
        assert_eq!(loader.jump_entries[&(TEXT_VA + 0x10)], 0x20 - 0x15);
        assert!(loader.jump_destinations.contains(&(TEXT_VA + 0x20)));

        // .notes and __ex_table appear at their file-offset distances
        let text_section = loader.image.section_by_name(".text").unwrap().clone();
        let notes = loader.image.section_by_name(".notes").unwrap().clone();
        let notes_off = (notes.offset - text_section.offset) as usize;
        assert_eq!(&loader.text.bytes[notes_off..notes_off + 4], b"\x01\x02\x03\x04");

        // padded to the large-page size
        assert_eq!(loader.text.bytes.len() % KERNEL_CODEPAGE_SIZE, 0);
        assert!(loader.text.initialized < loader.text.bytes.len());

        // rodata spans .rodata through __modver
        assert!(loader.rodata.bytes.starts_with(b"read-only-data!!"));
        assert_eq!(loader.rodata.bytes.len() % KERNEL_CODEPAGE_SIZE, 0);
        assert_eq!(loader.rodata.base, 0xffffffff81600000);
    }

    #[test]
    fn symbol_registration_scopes_locals() {
        let image = kernel_image();
        let registry = SymbolRegistry::new();
        register_kernel_symbols(&image, &registry, TEXT_VA).unwrap();
        registry.update_reverse_maps();

        assert_eq!(registry.symbol_address("__fentry__"), Some(TEXT_VA + 0x30));
        assert!(registry.is_function(TEXT_VA + 0x30));
    }
}

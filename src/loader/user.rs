//! Userspace image reconstruction (executables, shared libraries, vdso).
//!
//! The text image is the code segment's file bytes at page granularity; the
//! data image is a zero-filled buffer of the data segment's `memsz` with
//! every contained section copied to its in-segment position. Both regions
//! are addressed in the file's own virtual address space; the per-process
//! mapping base is applied by the owner.

use super::{Loader, LoaderKind, Region};
use crate::elf::{ElfImage, ObjectKind};
use crate::prelude::*;

pub const PAGE_SIZE: usize = 0x1000;

pub fn build_user_loader(image: ElfImage, name: &str, kind: LoaderKind) -> Result<Loader> {
    if image.kind() == ObjectKind::Relocatable {
        bail!("{name}: relocatable objects are never mapped into a process");
    }
    let mut loader = Loader::new(kind, name.into(), image);
    loader.lazy_bind = !loader.image.is_bind_now();

    build_text(&mut loader)?;
    if kind != LoaderKind::Vdso {
        build_data(&mut loader)?;
    }
    Ok(loader)
}

fn build_text(loader: &mut Loader) -> Result<()> {
    let segment = *loader.image.code_segment()?;

    // whole pages, the way the guest maps them
    let file_start = (segment.offset as usize) & !(PAGE_SIZE - 1);
    let span = segment.offset as usize - file_start + segment.memsz as usize;
    let pages = span.next_multiple_of(PAGE_SIZE);

    let mut text = Region::new(segment.vaddr & !(PAGE_SIZE as u64 - 1));
    let data = loader.image.data();
    let available = data.len().saturating_sub(file_start);
    text.bytes
        .extend_from_slice(&data[file_start..file_start + available.min(pages)]);
    text.pad_to(pages);
    text.initialized = (segment.offset - file_start as u64 + segment.filesz) as usize;

    loader.text = text;
    Ok(())
}

fn build_data(loader: &mut Loader) -> Result<()> {
    let segment = match loader.image.data_segment() {
        Ok(segment) => *segment,
        // statically linked images without a writable segment
        Err(_) => return Ok(()),
    };
    if segment.vaddr == 0 && segment.memsz == 0 {
        return Ok(());
    }

    let mut data = Region::new(segment.vaddr);
    data.bytes = vec![0u8; segment.memsz as usize];
    data.initialized = segment.filesz as usize;

    let sections: Vec<_> = loader
        .image
        .sections()
        .iter()
        .skip(1)
        .filter(|s| {
            s.size <= segment.filesz
                && s.offset >= segment.offset
                && s.offset <= segment.offset + segment.filesz - s.size
        })
        .cloned()
        .collect();

    for section in sections {
        let bytes = loader.image.section_data(&section);
        if bytes.is_empty() {
            continue;
        }
        let Some(pos) = section.addr.checked_sub(segment.vaddr) else {
            continue;
        };
        let pos = pos as usize;
        if pos + bytes.len() <= data.bytes.len() {
            data.bytes[pos..pos + bytes.len()].copy_from_slice(bytes);
        }
    }

    loader.data = data;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testelf::TestElf;
    use object::elf;

    fn library_image() -> ElfImage {
        let mut builder = TestElf::new(elf::ET_DYN);
        let text = builder.add_progbits(
            ".text",
            &[0xc3u8; 0x30],
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            0x1000,
        );
        let data = builder.add_progbits(
            ".data",
            &[0x42u8; 0x20],
            elf::SHF_ALLOC | elf::SHF_WRITE,
            0x3000,
        );
        let bss = builder.add_nobits(".bss", 0x40, elf::SHF_ALLOC | elf::SHF_WRITE, 0x3020);
        builder.add_segment(elf::PF_R | elf::PF_X, text, text, 0);
        builder.add_segment(elf::PF_R | elf::PF_W, data, bss, 0);
        builder.add_dynamic(&["libc.so.6"], Some("libfoo.so.1"), false);
        ElfImage::from_bytes("libfoo.so", builder.build()).unwrap()
    }

    #[test]
    fn text_is_page_granular() {
        let loader =
            build_user_loader(library_image(), "libfoo.so", LoaderKind::Library).unwrap();
        assert_eq!(loader.text.bytes.len() % PAGE_SIZE, 0);
        assert!(loader.lazy_bind);
    }

    #[test]
    fn data_sections_land_at_their_segment_positions() {
        let loader =
            build_user_loader(library_image(), "libfoo.so", LoaderKind::Library).unwrap();
        // memsz covers .data plus .bss
        assert_eq!(loader.data.base, 0x3000);
        assert_eq!(loader.data.bytes.len(), 0x60);
        assert_eq!(&loader.data.bytes[..0x20], &[0x42u8; 0x20]);
        // bss stays zero
        assert!(loader.data.bytes[0x20..].iter().all(|&b| b == 0));
    }
}

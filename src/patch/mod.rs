//! Emulation of the kernel's boot-time self-patching.
//!
//! Five passes reproduce what `alternative_instructions()`, the paravirt
//! patcher, the SMP-lock rewriter, ftrace init and the jump-label code do to
//! resident text. Alternatives, paravirt sites and SMP locks run against the
//! working file copy before the text image is assembled; mcount NOPs and
//! jump labels against the assembled text buffer, mirroring the order the
//! kernel applies them in.

pub mod nops;
pub mod paravirt;

use crate::elf::le;
use crate::guest::types::TypeOracle;
use crate::guest::{GuestMemory, KERNEL_SPACE};
use crate::loader::{Loader, LoaderKind};
use crate::prelude::*;

pub use nops::{NopFamily, add_nops};
pub use paravirt::ParavirtState;

/// `X86_FEATURE_UP`: an SMP kernel running on a uni-processor machine.
pub const X86_FEATURE_UP: u16 = 3 * 32 + 9;

const ALT_ENTRY_SIZE: usize = 12;
const PARA_ENTRY_SIZE: usize = 16;
const JUMP_ENTRY_SIZE: usize = 24;

/// First words of `boot_cpu_data.x86_capability`.
#[derive(Debug, Clone, Copy)]
pub struct CpuCaps(pub [u32; 10]);

impl CpuCaps {
    pub fn has(&self, feature: u16) -> bool {
        let word = usize::from(feature / 32);
        word < self.0.len() && (self.0[word] >> (feature % 32)) & 1 != 0
    }
}

/// A decoded `__jump_table` entry.
#[derive(Debug, Clone, Copy)]
pub struct JumpEntry {
    pub code: u64,
    pub target: u64,
    pub key: u64,
}

/// Guest state every patch pass depends on, read once per run.
pub struct PatchContext {
    pub nops: NopFamily,
    pub caps: CpuCaps,
    pub pv: ParavirtState,
}

impl PatchContext {
    pub fn load(oracle: &dyn TypeOracle, memory: &dyn GuestMemory) -> Result<Self> {
        let nops = NopFamily::detect(oracle, memory)?;

        let boot_cpu_data = oracle.variable("boot_cpu_data")?;
        let capability = boot_cpu_data.member(oracle, memory, KERNEL_SPACE, "x86_capability", false)?;
        let mut words = [0u32; 10];
        for (i, word) in words.iter_mut().enumerate() {
            *word = capability
                .array_elem(oracle, i as u64)?
                .value_u32(memory, KERNEL_SPACE)?;
        }

        let pv = ParavirtState::load(oracle)?;

        Ok(PatchContext {
            nops,
            caps: CpuCaps(words),
            pv,
        })
    }

    /// `0xF0` (LOCK) on a multiprocessor guest, `0x3E` (DS override, a
    /// no-op prefix) on a uni-processor one.
    pub fn smp_lock_byte(&self) -> u8 {
        if self.caps.has(X86_FEATURE_UP) { 0x3e } else { 0xf0 }
    }
}

/// Map a site virtual address into the working file copy through the
/// section that contains it.
fn file_offset_of_vaddr(loader: &Loader, vaddr: u64) -> Option<usize> {
    let section = loader
        .image
        .sections()
        .iter()
        .skip(1)
        .find(|s| s.is_alloc() && s.contains_vaddr(vaddr))?;
    Some((section.offset + (vaddr - section.addr)) as usize)
}

/// Pass A: alternative instructions.
///
/// Feature-gated replacements from `.altinstr_replacement` are copied over
/// their sites, direct-call displacements are rebased from the replacement
/// position to the site, and the remainder is NOP-padded.
pub fn apply_alternatives(loader: &mut Loader, ctx: &PatchContext) -> Result<()> {
    let altsec = match loader.image.section_by_name(".altinstructions") {
        Ok(s) => s.clone(),
        Err(_) => return Ok(()),
    };
    let replsec = loader.image.section_by_name(".altinstr_replacement")?.clone();
    let relocatable = loader.image.is_relocatable();
    let repl_mem = loader.section_mem_addr(&replsec);

    let mut applied = 0usize;
    let count = altsec.size as usize / ALT_ENTRY_SIZE;
    for idx in 0..count {
        let entry_off = altsec.offset as usize + idx * ALT_ENTRY_SIZE;
        let entry = &loader.file_buf[entry_off..entry_off + ALT_ENTRY_SIZE];
        let instr_offset = le::u32_at(entry, 0).unwrap() as i32;
        let repl_offset = le::u32_at(entry, 4).unwrap() as i32;
        let cpuid = le::u16_at(entry, 8).unwrap();
        let instr_len = entry[10] as usize;
        let repl_len = entry[11] as usize;

        if !ctx.caps.has(cpuid) {
            continue;
        }

        // the offset fields are relative to their own position
        let (site_file, site_va, repl_file, repl_va);
        if relocatable {
            // relocations already rebased the fields to file-relative deltas
            site_file = (entry_off as i64 + i64::from(instr_offset)) as usize;
            repl_file = (entry_off as i64 + 4 + i64::from(repl_offset)) as usize;
            let site_section = loader
                .image
                .section_by_offset(site_file as u64)
                .ok_or_else(|| anyhow!("alternative site outside any section"))?
                .clone();
            site_va = loader.section_mem_addr(&site_section) + site_file as u64
                - site_section.offset;
            repl_va = repl_mem + repl_file as u64 - replsec.offset;
        } else {
            site_va = (altsec.addr + (idx * ALT_ENTRY_SIZE) as u64)
                .wrapping_add(instr_offset as i64 as u64);
            repl_va = (altsec.addr + (idx * ALT_ENTRY_SIZE + 4) as u64)
                .wrapping_add(repl_offset as i64 as u64);
            site_file = file_offset_of_vaddr(loader, site_va)
                .ok_or_else(|| anyhow!("alternative site {site_va:#x} outside any section"))?;
            repl_file = (replsec.offset + (repl_va - replsec.addr)) as usize;
        }

        if instr_len < repl_len {
            warn!("alternative entry {idx}: replacement longer than site, skipping");
            continue;
        }

        let mut insnbuf = loader.file_buf[repl_file..repl_file + repl_len].to_vec();

        // a relative call keeps its target when the code moves
        if repl_len == 5 && insnbuf.first() == Some(&0xe8) {
            let disp = le::u32_at(&insnbuf, 1).unwrap() as i32;
            let rebased = disp.wrapping_add(repl_va.wrapping_sub(site_va) as i32);
            insnbuf[1..5].copy_from_slice(&rebased.to_le_bytes());
        }

        insnbuf.resize(instr_len, 0);
        add_nops(&mut insnbuf[repl_len..], ctx.nops);
        loader.file_buf[site_file..site_file + instr_len].copy_from_slice(&insnbuf);
        applied += 1;
    }

    debug!("{}: applied {applied}/{count} alternatives", loader.name);
    Ok(())
}

/// Pass B: paravirt call sites.
pub fn apply_paravirt(
    loader: &mut Loader,
    ctx: &PatchContext,
    memory: &dyn GuestMemory,
) -> Result<()> {
    let parasec = match loader.image.section_by_name(".parainstructions") {
        Ok(s) => s.clone(),
        Err(_) => return Ok(()),
    };
    let text = loader.image.section_by_name(".text")?.clone();
    let text_mem = loader.section_mem_addr(&text);

    let mut applied = 0usize;
    let count = parasec.size as usize / PARA_ENTRY_SIZE;
    for idx in 0..count {
        let entry_off = parasec.offset as usize + idx * PARA_ENTRY_SIZE;
        let entry = &loader.file_buf[entry_off..entry_off + PARA_ENTRY_SIZE];
        let instr = le::u64_at(entry, 0).unwrap();
        let instr_type = entry[8];
        let len = entry[9] as usize;
        let clobbers = le::u16_at(entry, 10).unwrap();

        if instr < text_mem || instr + len as u64 > text_mem + text.size {
            continue;
        }
        let site_file = (text.offset + (instr - text_mem)) as usize;

        let mut insnbuf = loader.file_buf[site_file..site_file + len].to_vec();
        // the type field indexes an array of pointer slots
        let used = ctx.pv.patch_site(
            memory,
            u64::from(instr_type) * 8,
            clobbers,
            instr,
            &mut insnbuf,
        )?;
        add_nops(&mut insnbuf[used..], ctx.nops);
        loader.file_buf[site_file..site_file + len].copy_from_slice(&insnbuf);
        applied += 1;
    }

    debug!("{}: applied {applied} paravirt sites", loader.name);
    Ok(())
}

/// Pass C: SMP lock prefixes.
pub fn apply_smp_locks(loader: &mut Loader, ctx: &PatchContext) -> Result<()> {
    let smpsec = match loader.image.section_by_name(".smp_locks") {
        Ok(s) => s.clone(),
        Err(_) => return Ok(()),
    };
    let text = loader.image.section_by_name(".text")?.clone();
    let text_mem = loader.section_mem_addr(&text);
    let smp_mem = loader.section_mem_addr(&smpsec);
    let lock = ctx.smp_lock_byte();

    let mut applied = 0usize;
    for idx in 0..smpsec.size as usize / 4 {
        let field_off = smpsec.offset as usize + idx * 4;
        let delta = le::u32_at(&loader.file_buf, field_off).unwrap() as i32;
        let field_va = smp_mem + (idx * 4) as u64;
        let site_va = field_va.wrapping_add(delta as i64 as u64);

        if site_va < text_mem || site_va >= text_mem + text.size {
            continue;
        }
        let site_file = (text.offset + (site_va - text_mem)) as usize;
        loader.file_buf[site_file] = lock;
        loader.smp_offsets.insert(site_va - text_mem);
        applied += 1;
    }

    debug!("{}: applied {applied} smp locks", loader.name);
    Ok(())
}

/// Pass D: ftrace call sites.
///
/// Every `__mcount_loc` entry addresses a 5-byte `call __fentry__` that the
/// kernel NOPs out at init.
pub fn apply_mcount(loader: &mut Loader, ctx: &PatchContext, entries: &[u64]) {
    let mut applied = 0usize;
    for &site in entries {
        if !loader.text.contains(site) {
            continue;
        }
        let off = loader.text.offset_of(site);
        if off + 5 > loader.text.bytes.len() {
            continue;
        }
        add_nops(&mut loader.text.bytes[off..off + 5], ctx.nops);
        applied += 1;
    }
    debug!("{}: applied {applied} mcount sites", loader.name);
}

/// Pass E: static jump labels.
///
/// The site becomes `E9 disp32` when the key is enabled in the guest and a
/// 5-byte NOP otherwise; both forms are recorded so the comparator accepts
/// runtime toggles.
pub fn apply_jump_entries(
    loader: &mut Loader,
    ctx: &PatchContext,
    oracle: &dyn TypeOracle,
    memory: &dyn GuestMemory,
    entries: &[JumpEntry],
) -> Result<()> {
    let mut applied = 0usize;
    for entry in entries {
        if loader.kind == LoaderKind::Kernel
            && entry.code >= loader.text.base + loader.text.initialized as u64
        {
            // init text is discarded after boot
            continue;
        }
        if !loader.text.contains(entry.code) {
            continue;
        }

        let enabled = match read_key_enabled(oracle, memory, entry.key) {
            Ok(enabled) => enabled,
            Err(err) => {
                warn!(
                    "{}: cannot read static key at {:#x}: {err}",
                    loader.name, entry.key
                );
                continue;
            }
        };

        let destination = entry.target.wrapping_sub(entry.code + 5) as u32 as i32;
        loader.jump_entries.insert(entry.code, destination);
        loader.jump_destinations.insert(entry.target);

        let off = loader.text.offset_of(entry.code);
        if off + 5 > loader.text.bytes.len() {
            continue;
        }
        if enabled != 0 {
            loader.text.bytes[off] = 0xe9;
            loader.text.bytes[off + 1..off + 5].copy_from_slice(&destination.to_le_bytes());
        } else {
            add_nops(&mut loader.text.bytes[off..off + 5], ctx.nops);
        }
        applied += 1;
    }

    debug!("{}: applied {applied} jump entries", loader.name);
    Ok(())
}

fn read_key_enabled(
    oracle: &dyn TypeOracle,
    memory: &dyn GuestMemory,
    key_addr: u64,
) -> Result<i32> {
    oracle
        .instance_at("static_key", key_addr)?
        .member(oracle, memory, KERNEL_SPACE, "enabled", false)?
        .member(oracle, memory, KERNEL_SPACE, "counter", false)?
        .value_i32(memory, KERNEL_SPACE)
}

/// Decode a raw `__jump_table` byte range.
pub fn decode_jump_entries(data: &[u8]) -> Vec<JumpEntry> {
    let mut entries = Vec::with_capacity(data.len() / JUMP_ENTRY_SIZE);
    for chunk in data.chunks_exact(JUMP_ENTRY_SIZE) {
        entries.push(JumpEntry {
            code: le::u64_at(chunk, 0).unwrap(),
            target: le::u64_at(chunk, 8).unwrap(),
            key: le::u64_at(chunk, 16).unwrap(),
        });
    }
    entries
}

/// Decode a raw `__mcount_loc` byte range.
pub fn decode_mcount_entries(data: &[u8]) -> Vec<u64> {
    data.chunks_exact(8)
        .map(|chunk| le::u64_at(chunk, 0).unwrap())
        .collect()
}

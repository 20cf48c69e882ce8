//! Kernel-space comparator: diffs every executable guest page against the
//! reconstructed images, accepting only mismatches that are legitimate
//! runtime rewrites, scans writable data for unexplained code pointers and
//! walks every task's kernel stack.

use std::collections::BTreeMap;
use std::path::Path;

use crate::elf::le;
use crate::guest::tasks::{KERNEL_STACK_SIZE, TaskManager};
use crate::guest::{KERNEL_SPACE, PageInfo};
use crate::kernel::{Kernel, KernelSpaceLoader};
use crate::loader::{KERNEL_ADDR_MASK, Loader, LoaderKind};
use crate::patch::NopFamily;
use crate::prelude::*;
use crate::report::{Finding, FindingKind, Report};

/// Low 48 bits; guest page tables report canonical kernel addresses with
/// the sign-extension bits dropped.
const LOW_ADDR_MASK: u64 = 0xffff_ffff_ffff;

/// The hypercall page is rewritten by the hypervisor itself.
const HYPERCALL_PAGE: u64 = 0xffff_ffff_8100_1000;

#[derive(Debug, Clone, Copy)]
pub struct ValidatorOptions {
    pub loop_mode: bool,
    pub code_validation: bool,
    pub pointer_examination: bool,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        ValidatorOptions {
            loop_mode: false,
            code_validation: true,
            pointer_examination: true,
        }
    }
}

pub struct KernelValidator<'k> {
    kernel: &'k Kernel,
    options: ValidatorOptions,
    /// call site -> recorded destinations, from a pre-recorded call graph
    call_targets: BTreeMap<u64, Vec<u64>>,
    /// low-masked stack bottom -> live stack pointer
    stack_addresses: BTreeMap<u64, u64>,
    pub report: Report,
}

impl<'k> KernelValidator<'k> {
    pub fn new(
        kernel: &'k Kernel,
        options: ValidatorOptions,
        targets_file: Option<&Path>,
    ) -> Result<Self> {
        let mut call_targets: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        if let Some(path) = targets_file {
            let bytes = std::fs::read(path)
                .with_context(|| format!("cannot read call targets from {}", path.display()))?;
            for pair in bytes.chunks_exact(16) {
                let call_addr = le::u64_at(pair, 0).unwrap();
                let call_dest = le::u64_at(pair, 8).unwrap();
                call_targets.entry(call_addr).or_default().push(call_dest);
            }
            info!("loaded {} recorded call targets", call_targets.len());
        }

        Ok(KernelValidator {
            kernel,
            options,
            call_targets,
            stack_addresses: BTreeMap::new(),
            report: Report::new(),
        })
    }

    /// One full sweep over stacks and executable pages; repeats forever in
    /// loop mode.
    pub fn validate_pages(&mut self) -> Result<u64> {
        let mut iterations = 0u64;
        loop {
            iterations += 1;

            if self.options.pointer_examination {
                self.validate_stacks()?;
            }

            let pages = self.kernel.memory.pages(KERNEL_SPACE)?;
            for page in &pages {
                // the direct physical mapping aliases everything; skip it
                if page.vaddr & 0xff00_0000_0000 == 0x8800_0000_0000 {
                    continue;
                }
                self.validate_page(page)?;
                self.report.pages_checked += 1;
            }

            info!("done validating pages");
            if !self.options.loop_mode {
                return Ok(iterations);
            }
        }
    }

    fn validate_page(&mut self, page: &PageInfo) -> Result<()> {
        // vmalloc/ioremap space is backed by drivers, not by files
        if page.vaddr & 0xff00_0000_0000 == 0xc900_0000_0000 {
            return Ok(());
        }

        let Some(owner) = self.kernel.loader_for_address(page.vaddr) else {
            if self.kernel.memory.is_executable(page) {
                self.report.add(Finding {
                    kind: FindingKind::UnknownExecutablePage,
                    address: page.vaddr,
                    owner: String::new(),
                    expected: Vec::new(),
                    observed: Vec::new(),
                    note: String::new(),
                });
            }
            return Ok(());
        };

        let (name, loader): (String, &Loader) = match &owner {
            KernelSpaceLoader::Kernel => ("kernel".into(), &self.kernel.loader),
            KernelSpaceLoader::Module(name, loader) => (name.clone(), loader.as_ref()),
        };

        if self.options.code_validation && loader.is_code_address(page.vaddr) {
            self.validate_code_page(page, &name, loader)?;
        } else if self.options.pointer_examination && loader.is_data_address(page.vaddr) {
            if self.kernel.memory.is_executable(page) {
                warn!("executable data page at {:#x}", page.vaddr);
            }
            self.validate_data_page(page, &name, loader)?;
        }
        Ok(())
    }

    fn validate_code_page(&mut self, page: &PageInfo, name: &str, loader: &Loader) -> Result<()> {
        let observed = self.kernel.memory.read(page.vaddr, page.size as usize, KERNEL_SPACE)?;
        if let Some(finding) = diff_code_page(
            loader,
            name,
            self.kernel.ctx.nops,
            self.kernel.addrs.copy_user_generic_unrolled,
            page.vaddr,
            &observed,
        ) {
            self.report.add(finding);
        }
        Ok(())
    }

    fn validate_data_page(&mut self, page: &PageInfo, name: &str, loader: &Loader) -> Result<()> {
        let observed = self.kernel.memory.read(page.vaddr, page.size as usize, KERNEL_SPACE)?;

        if page.vaddr == self.kernel.addrs.idt_table & LOW_ADDR_MASK
            || page.vaddr == self.kernel.addrs.nmi_idt_table & LOW_ADDR_MASK
        {
            self.validate_idt_page(page, &observed);
            return Ok(());
        }

        let rodata_base = loader.rodata.base & LOW_ADDR_MASK;
        if page.vaddr >= rodata_base
            && page.vaddr < rodata_base + loader.rodata.bytes.len() as u64
        {
            self.validate_rodata_page(page, name, loader, &observed);
            return Ok(());
        }

        // a task stack is examined separately, with call-chain context
        if self
            .stack_addresses
            .contains_key(&(page.vaddr & !(KERNEL_STACK_SIZE - 1)))
        {
            return Ok(());
        }

        let unknown = self.scan_code_pointers(page, name, &observed);
        if unknown > 0 {
            warn!("{unknown} undecidable code pointers in a data page of {name}");
        }
        Ok(())
    }

    /// Every 16-byte IDT gate must point at a known function, at the
    /// `_sinittext` slot pattern of never-initialised vectors, or at the
    /// IRQ stub array.
    fn validate_idt_page(&mut self, page: &PageInfo, observed: &[u8]) {
        let addrs = &self.kernel.addrs;
        for slot_off in (0..observed.len().saturating_sub(15)).step_by(0x10) {
            let gate = &observed[slot_off..slot_off + 16];
            // offset bits 0..16 | 16..32 | 32..64 of the gate descriptor
            let mut target = le::u64_at(gate, 4).unwrap();
            target = (target & !0xffff) | u64::from(le::u16_at(gate, 0).unwrap());
            let reserved = le::u32_at(gate, 12).unwrap();

            let known = (self.kernel.registry.is_function(target)
                || self.kernel.registry.is_symbol(target)
                || target == 0)
                && reserved == 0;
            if known {
                continue;
            }

            let slot = slot_off as u64 / 0x10;
            if (0x140..0x210).contains(&(slot_off as u64))
                && target == addrs.sinittext + slot * 9
            {
                continue;
            }
            if slot_off as u64 >= 0x210 {
                let vector = slot - 0x20;
                if target == addrs.irq_entries_start + (vector % 7) * 4 + (vector / 7) * 0x20 {
                    continue;
                }
            }

            self.report.add(Finding {
                kind: FindingKind::UnknownIdtEntry,
                address: page.vaddr + slot_off as u64,
                owner: "kernel".into(),
                expected: Vec::new(),
                observed: gate.to_vec(),
                note: format!("gate target {target:#x}"),
            });
        }
    }

    fn validate_rodata_page(
        &mut self,
        page: &PageInfo,
        name: &str,
        loader: &Loader,
        observed: &[u8],
    ) {
        let page_offset = (page.vaddr - (loader.rodata.base & LOW_ADDR_MASK)) as usize;
        let Some(expected) = loader.rodata.bytes.get(page_offset..) else {
            return;
        };

        let kvm_eoi = self
            .kernel
            .registry
            .function_address("kvm_guest_apic_eoi_write")
            .unwrap_or(0);

        let mut i = 0usize;
        let limit = observed.len().min(expected.len());
        while i < limit {
            if expected[i] == observed[i] {
                i += 1;
                continue;
            }
            // KVM init redirects apic->eoi_write; an 8-byte pointer to
            // kvm_guest_apic_eoi_write displacing the original is expected
            if kvm_eoi != 0 && i + 8 <= observed.len() {
                let value = le::u64_at(observed, i).unwrap();
                if value == kvm_eoi {
                    i += 8;
                    continue;
                }
            }
            self.report.add(Finding {
                kind: FindingKind::RodataMismatch,
                address: page.vaddr + i as u64,
                owner: name.into(),
                expected: window(expected, i),
                observed: window(observed, i),
                note: String::new(),
            });
            // one finding per divergent run
            while i < limit && expected[i] != observed[i] {
                i += 1;
            }
        }
    }

    /// Scan a writable page for values shaped like kernel code pointers and
    /// try to explain each one.
    fn scan_code_pointers(&mut self, page: &PageInfo, name: &str, observed: &[u8]) -> u64 {
        let mut unknown = 0u64;
        let mut i = 4usize;
        while i + 4 <= observed.len() {
            if le::u32_at(observed, i).unwrap() != 0xffff_ffff {
                i += 1;
                continue;
            }
            let value = le::u64_at(observed, i - 4).unwrap();
            if value == u64::MAX {
                i += 8;
                continue;
            }

            if self.explain_code_pointer(page.vaddr + i as u64 - 4, value) {
                i += 1;
                continue;
            }

            self.report.add(Finding {
                kind: FindingKind::UnknownCodePointer,
                address: page.vaddr + i as u64 - 4,
                owner: name.into(),
                expected: Vec::new(),
                observed: value.to_le_bytes().to_vec(),
                note: format!("points into executable memory at {value:#x}"),
            });
            unknown += 1;
            i += 1;
        }
        unknown
    }

    /// True if a candidate pointer has a legitimate reason to exist.
    fn explain_code_pointer(&mut self, location: u64, value: u64) -> bool {
        let registry = &self.kernel.registry;
        if registry.is_function(value) || registry.is_symbol(value) {
            return true;
        }

        let Some(owner) = self.kernel.loader_for_address(value) else {
            return true; // not executable memory at all
        };
        let loader: &Loader = match &owner {
            KernelSpaceLoader::Kernel => &self.kernel.loader,
            KernelSpaceLoader::Module(_, loader) => loader.as_ref(),
        };
        if !loader.is_code_address(value) {
            return true;
        }

        let offset = (value | KERNEL_ADDR_MASK).wrapping_sub(loader.text.base);
        if offset > loader.text.initialized as u64 {
            // points past the initialised image; nothing legitimises that
            return false;
        }

        if loader.smp_offsets.contains(&offset) {
            return true;
        }
        if loader.jump_entries.contains_key(&value) || loader.jump_destinations.contains(&value) {
            return true;
        }

        // addresses into the exception table region are fixup entries
        if let Ok(ex_table) = self.kernel.loader.image.section_by_name("__ex_table") {
            if value >= ex_table.addr && value < ex_table.addr + ex_table.size {
                return true;
            }
        }

        // a return address saved by a call instruction
        if self
            .call_site_before(loader, offset as usize)
            .is_some()
        {
            trace!("return address {value:#x} stored at {location:#x}");
            return true;
        }

        // the int3 breakpoint patching slots are transient by design
        if let Some(bp_int3) = registry.symbol_address("bp_int3_addr") {
            if location == bp_int3 & LOW_ADDR_MASK {
                return true;
            }
        }

        false
    }

    /// Decode the bytes immediately before `offset` in the loader's text:
    /// do they encode a CALL whose return address would be `offset`?
    /// Returns the call target for direct calls, 0 for register-indirect
    /// forms whose target is unknowable statically.
    fn call_site_before(&self, loader: &Loader, offset: usize) -> Option<u64> {
        let text = &loader.text.bytes;
        let base = loader.text.base;
        if offset > text.len() {
            return None;
        }

        // call rel32
        if offset > 5 && text[offset - 5] == 0xe8 {
            let disp = le::u32_at(text, offset - 4).unwrap() as i32;
            return Some(base.wrapping_add(offset as u64).wrapping_add(disp as i64 as u64));
        }
        // jmp rel32 does not push a return address
        if offset > 5 && text[offset - 5] == 0xe9 {
            return None;
        }
        // call [rax+0x0]
        if offset > 6 && text[offset - 6] == 0xff && text[offset - 5] == 0x90 {
            return Some(0);
        }
        // call [rip+disp32]: the slot itself holds the target
        if offset > 6 && text[offset - 6] == 0xff && text[offset - 5] == 0x15 {
            let disp = le::u32_at(text, offset - 4).unwrap() as i32;
            let slot = base.wrapping_add(offset as u64).wrapping_add(disp as i64 as u64);
            return self
                .kernel
                .memory
                .read_u64(slot, KERNEL_SPACE)
                .ok()
                .or(Some(0));
        }
        // call [abs32] / call [rax*8]
        if offset > 7
            && text[offset - 7] == 0xff
            && text[offset - 6] == 0x14
            && (text[offset - 5] == 0x25 || text[offset - 5] == 0xc5)
        {
            return Some(0);
        }
        // short register forms: call reg / call [reg+disp8]
        if offset > 2 && text[offset - 2] == 0xff {
            return Some(0);
        }
        if offset > 3 && text[offset - 3] == 0xff {
            return Some(0);
        }

        None
    }

    fn validate_stacks(&mut self) -> Result<()> {
        let tm = TaskManager::new(self.kernel.types.as_ref(), self.kernel.memory.as_ref());
        let stacks = tm.stacks()?;

        self.stack_addresses.clear();
        for stack in &stacks {
            self.stack_addresses
                .insert(stack.bottom & LOW_ADDR_MASK, stack.rsp);
        }

        for stack in &stacks {
            match self
                .kernel
                .memory
                .read(stack.bottom, KERNEL_STACK_SIZE as usize, KERNEL_SPACE)
            {
                Ok(bytes) => {
                    self.validate_stack_page(&bytes, stack.bottom, stack.rsp);
                    self.report.stacks_checked += 1;
                }
                Err(err) => debug!("stack at {:#x} unreadable: {err}", stack.bottom),
            }
        }
        Ok(())
    }

    /// Walk the live part of one kernel stack. Every recognised return
    /// address must be preceded by a CALL, and each frame's return function
    /// must be the one the previous frame called (or a known scheduler
    /// transition, or a recorded call-graph edge).
    fn validate_stack_page(&mut self, memory: &[u8], stack_bottom: u64, rsp: u64) {
        let mut return_addresses: BTreeMap<u64, u64> = BTreeMap::new();

        let live_start = (rsp % KERNEL_STACK_SIZE) as usize;
        let mut i = live_start.max(4);
        while i + 4 <= memory.len() {
            if le::u32_at(memory, i).unwrap() != 0xffff_ffff {
                i += 1;
                continue;
            }
            let value = le::u64_at(memory, i - 4).unwrap();
            if value == u64::MAX {
                i += 8;
                continue;
            }

            let Some(owner) = self.kernel.loader_for_address(value) else {
                i += 1;
                continue;
            };
            let loader: &Loader = match &owner {
                KernelSpaceLoader::Kernel => &self.kernel.loader,
                KernelSpaceLoader::Module(_, loader) => loader.as_ref(),
            };
            if !loader.is_code_address(value)
                || self.kernel.registry.is_function(value)
                || self.kernel.registry.is_symbol(value)
            {
                i += 1;
                continue;
            }

            let offset = (value | KERNEL_ADDR_MASK).wrapping_sub(loader.text.base);
            if offset > loader.text.initialized as u64 {
                self.report.add(Finding {
                    kind: FindingKind::UnvalidatedReturnAddress,
                    address: stack_bottom + i as u64 - 4,
                    owner: loader.name.clone(),
                    expected: Vec::new(),
                    observed: value.to_le_bytes().to_vec(),
                    note: "points past the initialised image".into(),
                });
                i += 1;
                continue;
            }

            return_addresses.insert(stack_bottom + i as u64 - 4, value);
            i += 1;
        }

        let mut prev_ret_func: Option<u64> = None;
        for (&location, &ret_addr) in &return_addresses {
            let Some(owner) = self.kernel.loader_for_address(ret_addr) else {
                continue;
            };
            let loader: &Loader = match &owner {
                KernelSpaceLoader::Kernel => &self.kernel.loader,
                KernelSpaceLoader::Module(_, loader) => loader.as_ref(),
            };
            let offset = ((ret_addr | KERNEL_ADDR_MASK) - loader.text.base) as usize;

            let call_target = self.call_site_before(loader, offset);
            if call_target.is_none() {
                self.report.add(Finding {
                    kind: FindingKind::UnvalidatedReturnAddress,
                    address: location,
                    owner: loader.name.clone(),
                    expected: Vec::new(),
                    observed: ret_addr.to_le_bytes().to_vec(),
                    note: "no CALL precedes this return address".into(),
                });
            }

            let ret_func = self.kernel.registry.containing_function(ret_addr);

            let Some(prev) = prev_ret_func else {
                // the innermost frame needs no caller
                prev_ret_func = ret_func;
                continue;
            };

            if call_target == Some(prev) || call_target == Some(0) {
                prev_ret_func = ret_func;
                continue;
            }
            if self.is_scheduler_transition(prev, ret_func) {
                prev_ret_func = ret_func;
                continue;
            }
            if self.recorded_call_reaches(ret_addr, prev) {
                prev_ret_func = ret_func;
                continue;
            }

            self.report.add(Finding {
                kind: FindingKind::UnvalidatedReturnAddress,
                address: location,
                owner: loader.name.clone(),
                expected: Vec::new(),
                observed: ret_addr.to_le_bytes().to_vec(),
                note: format!(
                    "caller chain broken: previous frame {:#x}, call target {:?}",
                    prev, call_target
                ),
            });
            prev_ret_func = ret_func;
        }
    }

    /// Context switches splice stacks at well-known points.
    fn is_scheduler_transition(&self, prev_func: u64, ret_func: Option<u64>) -> bool {
        const LEGAL: [(&str, &str); 3] = [
            ("__schedule", "kthread"),
            ("kthread", "do_exit"),
            ("do_exit", "ret_from_fork"),
        ];

        let registry = &self.kernel.registry;
        let prev_name = registry.function_name(prev_func);
        let ret_name = ret_func.and_then(|f| registry.function_name(f));
        match (prev_name, ret_name) {
            (Some(prev), Some(ret)) => LEGAL
                .iter()
                .any(|&(from, to)| prev == from && ret == to),
            _ => false,
        }
    }

    /// The pre-recorded call graph relaxes the chain check: the destination
    /// recorded for the closest call site at or below the return address
    /// may match the previous frame's function.
    fn recorded_call_reaches(&self, ret_addr: u64, prev_func: u64) -> bool {
        if self.call_targets.is_empty() {
            return false;
        }
        match self.call_targets.range(..=ret_addr).next_back() {
            Some((_, destinations)) => destinations.contains(&prev_func),
            None => false,
        }
    }
}

/// Byte-compare one executable page against the reconstruction, consulting
/// the whitelist of legitimate rewrites. Returns the first real mismatch.
pub fn diff_code_page(
    loader: &Loader,
    name: &str,
    nops: NopFamily,
    generic_unrolled: u64,
    page_vaddr: u64,
    observed: &[u8],
) -> Option<Finding> {
    let page_offset = (page_vaddr - (loader.text.base & LOW_ADDR_MASK)) as usize;
    if loader.text.bytes.len() < page_offset {
        return Some(Finding {
            kind: FindingKind::CodeMismatch,
            address: page_vaddr,
            owner: name.into(),
            expected: Vec::new(),
            observed: Vec::new(),
            note: "page lies beyond the reconstructed text".into(),
        });
    }
    let expected = &loader.text.bytes[page_offset..];
    let limit = observed.len().min(expected.len());

    let nop5 = nops.nop5();
    let atomic5 = nops.atomic5();

    let mut i = 0usize;
    while i < limit {
        if expected[i] == observed[i] {
            i += 1;
            continue;
        }
        // only the first byte of a divergent run is classified
        if i > 0 && expected[i - 1] != observed[i - 1] {
            i += 1;
            continue;
        }

        let address = loader.text.base + (page_offset + i) as u64;

        if address & !0xfff == HYPERCALL_PAGE {
            i += 1;
            continue;
        }

        // atomic NOP exchange: the 5-byte NOP and its atomic form swap
        // under the code-patching machinery
        if i > 1
            && i + 3 <= limit
            && (slice_eq(&expected[i - 2..], nop5) && slice_eq(&observed[i - 2..], atomic5)
                || slice_eq(&expected[i - 2..], atomic5) && slice_eq(&observed[i - 2..], nop5))
        {
            i += 5;
            continue;
        }

        // 2-byte NOP spellings
        if i <= 1
            && ((expected[i] == 0x66 && observed[i] == 0x90)
                || (expected[i] == 0x90 && observed[i] == 0x66))
        {
            i += 1;
            continue;
        }

        // P6 5-byte NOP vs the 66-prefixed atomic spelling
        if slice_eq(&expected[i..], &[0x0f, 0x1f, 0x44, 0x00, 0x00])
            && slice_eq(&observed[i..], &[0x66, 0x66, 0x66, 0x66, 0x90])
        {
            i += 5;
            continue;
        }

        if jump_label_matches(loader, address, &observed[i..], nops) {
            i += 5;
            continue;
        }

        // direct-call relaxation: the memory-variant displacement reaches
        // copy_user_generic_unrolled
        if i > 0 && expected[i - 1] == 0xe8 && i + 4 <= expected.len() {
            let disp = le::u32_at(expected, i).unwrap() as i32;
            let dest = address.wrapping_add(4).wrapping_add(disp as i64 as u64);
            if loader.kind == LoaderKind::Kernel && dest == generic_unrolled {
                i += 4;
                continue;
            }
        }

        // SMP lock prefix toggled at a recorded site
        if ((expected[i] == 0x3e && observed[i] == 0xf0)
            || (expected[i] == 0xf0 && observed[i] == 0x3e))
            && loader.smp_offsets.contains(&((page_offset + i) as u64))
        {
            i += 1;
            continue;
        }

        // an out-of-line jump stub relaxed into a NOP
        if slice_eq(&expected[i..], &[0xe9, 0x00, 0x00, 0x00, 0x00])
            && (slice_eq(&observed[i..], atomic5) || slice_eq(&observed[i..], nop5))
        {
            i += 5;
            continue;
        }

        // uninitialised tail of the last mapped page
        if loader.kind == LoaderKind::Kernel && page_offset + i >= loader.text.initialized {
            return Some(Finding {
                kind: FindingKind::UninitialisedTail,
                address,
                owner: name.into(),
                expected: Vec::new(),
                observed: Vec::new(),
                note: String::new(),
            });
        }

        return Some(Finding {
            kind: FindingKind::CodeMismatch,
            address,
            owner: name.into(),
            expected: window(expected, i),
            observed: window(observed, i),
            note: String::new(),
        });
    }
    None
}

/// A recorded jump-label site is valid as either polarity: the recorded
/// `E9 disp32`, or any 5-byte NOP spelling.
fn jump_label_matches(loader: &Loader, address: u64, observed: &[u8], nops: NopFamily) -> bool {
    let Some(&disp) = loader.jump_entries.get(&address) else {
        return false;
    };
    if slice_eq(observed, nops.nop5()) || slice_eq(observed, nops.atomic5()) {
        return true;
    }
    observed.len() >= 5
        && observed[0] == 0xe9
        && le::u32_at(observed, 1).unwrap() as i32 == disp
}

fn slice_eq(haystack: &[u8], pattern: &[u8]) -> bool {
    haystack.len() >= pattern.len() && &haystack[..pattern.len()] == pattern
}

fn window(bytes: &[u8], at: usize) -> Vec<u8> {
    let end = (at + 8).min(bytes.len());
    bytes[at..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::ElfImage;
    use crate::elf::testelf::TestElf;
    use object::elf;

    const TEXT_VA: u64 = 0xffffffff81000000;
    const PAGE_VA: u64 = TEXT_VA & LOW_ADDR_MASK;

    fn code_loader(text: Vec<u8>) -> Loader {
        let mut builder = TestElf::new(elf::ET_EXEC);
        builder.add_progbits(".text", &text, elf::SHF_ALLOC | elf::SHF_EXECINSTR, TEXT_VA);
        let image = ElfImage::from_bytes("vmlinux", builder.build()).unwrap();
        let mut loader = Loader::new(LoaderKind::Kernel, "kernel".into(), image);
        loader.text.base = TEXT_VA;
        loader.text.initialized = text.len();
        loader.text.bytes = text;
        loader
    }

    fn diff(loader: &Loader, observed: &[u8]) -> Option<Finding> {
        diff_code_page(loader, "kernel", NopFamily::P6, 0, PAGE_VA, observed)
    }

    #[test]
    fn identical_pages_are_clean() {
        let loader = code_loader(vec![0x55, 0x48, 0x89, 0xe5, 0xc3]);
        assert!(diff(&loader, &[0x55, 0x48, 0x89, 0xe5, 0xc3]).is_none());
    }

    #[test]
    fn single_patched_byte_is_reported_at_the_right_offset() {
        let loader = code_loader(vec![0x55, 0x48, 0x89, 0xe5, 0xc3, 0x90, 0x90, 0x90]);
        let mut observed = loader.text.bytes.clone();
        observed[3] = 0xcc;

        let finding = diff(&loader, &observed).unwrap();
        assert_eq!(finding.kind, FindingKind::CodeMismatch);
        assert_eq!(finding.address, TEXT_VA + 3);
        assert_eq!(finding.expected[0], 0xe5);
        assert_eq!(finding.observed[0], 0xcc);
    }

    #[test]
    fn nop5_spelling_swap_is_accepted() {
        // expected P6 call-site NOP, observed 66-prefixed spelling
        let mut text = vec![0xc3u8; 16];
        text[4..9].copy_from_slice(&[0x0f, 0x1f, 0x44, 0x00, 0x00]);
        let loader = code_loader(text);

        let mut observed = loader.text.bytes.clone();
        observed[4..9].copy_from_slice(&[0x66, 0x66, 0x66, 0x66, 0x90]);
        assert!(diff(&loader, &observed).is_none());
    }

    #[test]
    fn smp_lock_toggle_is_accepted_only_at_recorded_sites() {
        let mut text = vec![0x90u8; 8];
        text[2] = 0xf0;
        let mut loader = code_loader(text);
        loader.smp_offsets.insert(2);

        let mut observed = loader.text.bytes.clone();
        observed[2] = 0x3e;
        assert!(diff(&loader, &observed).is_none());

        // the same byte swap away from a recorded site is a finding
        let mut text = vec![0x90u8; 8];
        text[5] = 0xf0;
        let loader = code_loader(text);
        let mut observed = loader.text.bytes.clone();
        observed[5] = 0x3e;
        let finding = diff(&loader, &observed).unwrap();
        assert_eq!(finding.address, TEXT_VA + 5);
    }

    #[test]
    fn jump_label_accepts_both_polarities() {
        let mut text = vec![0x90u8; 16];
        // reconstructed as disabled: 5-byte NOP at +4
        text[4..9].copy_from_slice(NopFamily::P6.nop5());
        let mut loader = code_loader(text);
        loader.jump_entries.insert(TEXT_VA + 4, 0x42);

        // guest enabled the key since: E9 with the recorded displacement
        let mut observed = loader.text.bytes.clone();
        observed[4] = 0xe9;
        observed[5..9].copy_from_slice(&0x42u32.to_le_bytes());
        assert!(diff(&loader, &observed).is_none());

        // a jump with a different displacement is not explained
        observed[5..9].copy_from_slice(&0x4343u32.to_le_bytes());
        assert!(diff(&loader, &observed).is_some());
    }

    #[test]
    fn uninitialised_tail_reported_once() {
        let mut loader = code_loader(vec![0xc3u8; 0x20]);
        loader.text.initialized = 0x10;
        loader.text.bytes.resize(0x40, 0);

        let mut observed = loader.text.bytes.clone();
        observed[0x30] = 0xab;
        let finding = diff(&loader, &observed).unwrap();
        assert_eq!(finding.kind, FindingKind::UninitialisedTail);
    }

    #[test]
    fn relaxed_jump_stub_is_accepted() {
        let mut text = vec![0xc3u8; 16];
        text[4..9].copy_from_slice(&[0xe9, 0x00, 0x00, 0x00, 0x00]);
        let loader = code_loader(text);

        let mut observed = loader.text.bytes.clone();
        observed[4..9].copy_from_slice(NopFamily::P6.atomic5());
        assert!(diff(&loader, &observed).is_none());
    }
}

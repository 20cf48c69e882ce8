//! Paravirtualization patching state.
//!
//! The kernel replaces every `.parainstructions` site at boot with whatever
//! the active hypervisor installed into the `pv_*_ops` operation tables.
//! To reproduce the result, the current table contents are read from the
//! guest and each site's operation slot is classified: well-known slots get
//! their canonical inline byte sequence, everything else a direct call or
//! jump to the installed function.

use std::collections::HashMap;

use crate::guest::types::TypeOracle;
use crate::guest::{GuestMemory, KERNEL_SPACE};
use crate::prelude::*;

/// Register-clobber mask: any caller-save register.
pub const CLBR_ANY: u16 = (1 << 4) - 1;

/// Canonical inline sequences emitted by the native patch templates.
mod native {
    pub const RESTORE_FL: &[u8] = &[0x57, 0x9d]; // push %rdi; popfq
    pub const SAVE_FL: &[u8] = &[0x9c, 0x58]; // pushfq; pop %rax
    pub const IRQ_ENABLE: &[u8] = &[0xfb]; // sti
    pub const IRQ_DISABLE: &[u8] = &[0xfa]; // cli
    pub const IRQ_ENABLE_SYSEXIT: &[u8] = &[0x0f, 0x01, 0xf8, 0xfb, 0x0f, 0x35];
    pub const USERGS_SYSRET32: &[u8] = &[0x0f, 0x01, 0xf8, 0x0f, 0x07];
    pub const USERGS_SYSRET64: &[u8] = &[0x0f, 0x01, 0xf8, 0x48, 0x0f, 0x07];
    pub const SWAPGS: &[u8] = &[0x0f, 0x01, 0xf8];
    pub const READ_CR2: &[u8] = &[0x0f, 0x20, 0xd0]; // mov %cr2, %rax
    pub const READ_CR3: &[u8] = &[0x0f, 0x20, 0xd8]; // mov %cr3, %rax
    pub const WRITE_CR3: &[u8] = &[0x0f, 0x22, 0xdf]; // mov %rdi, %cr3
    pub const CLTS: &[u8] = &[0x0f, 0x06];
    pub const FLUSH_TLB_SINGLE: &[u8] = &[0x0f, 0x01, 0x3f]; // invlpg (%rdi)
    pub const WBINVD: &[u8] = &[0x0f, 0x09];
    pub const MOV32: &[u8] = &[0x89, 0xf8]; // mov %edi, %eax
    pub const MOV64: &[u8] = &[0x48, 0x89, 0xf8]; // mov %rdi, %rax
}

struct PvTable {
    address: u64,
    size: u64,
}

pub struct ParavirtState {
    /// in `paravirt_patch_template` member order
    tables: Vec<PvTable>,

    nop_func: u64,
    ident32_func: u64,
    ident64_func: u64,

    /// template offset -> canonical native sequence
    native_sites: HashMap<u64, &'static [u8]>,
    /// template offsets patched with a direct jump instead of a call
    jmp_sites: Vec<u64>,
}

const TABLE_NAMES: [&str; 7] = [
    "pv_init_ops",
    "pv_time_ops",
    "pv_cpu_ops",
    "pv_irq_ops",
    "pv_apic_ops",
    "pv_mmu_ops",
    "pv_lock_ops",
];

impl ParavirtState {
    pub fn load(oracle: &dyn TypeOracle) -> Result<Self> {
        let mut tables = Vec::new();
        for name in TABLE_NAMES {
            let var = oracle.variable(name)?;
            let size = var
                .layout()
                .map(|layout| layout.size)
                .unwrap_or(var.size());
            tables.push(PvTable {
                address: var.address,
                size,
            });
        }

        let nop_func = oracle
            .function_address("_paravirt_nop")
            .ok_or_else(|| anyhow!("_paravirt_nop not found"))?;
        let ident32_func = oracle
            .function_address("_paravirt_ident_32")
            .ok_or_else(|| anyhow!("_paravirt_ident_32 not found"))?;
        let ident64_func = oracle
            .function_address("_paravirt_ident_64")
            .ok_or_else(|| anyhow!("_paravirt_ident_64 not found"))?;

        let template = oracle.base_type("paravirt_patch_template")?;
        let irq_base = template.member_offset("pv_irq_ops")?;
        let cpu_base = template.member_offset("pv_cpu_ops")?;
        let mmu_base = template.member_offset("pv_mmu_ops")?;

        let irq_ops = oracle.base_type("pv_irq_ops")?;
        let cpu_ops = oracle.base_type("pv_cpu_ops")?;
        let mmu_ops = oracle.base_type("pv_mmu_ops")?;

        let mut native_sites = HashMap::new();
        {
            let mut site = |base: u64,
                            layout: &crate::guest::types::StructLayout,
                            member: &str,
                            bytes: &'static [u8]| {
                if let Ok(offset) = layout.member_offset(member) {
                    native_sites.insert(base + offset, bytes);
                }
            };

            site(irq_base, &irq_ops, "restore_fl", native::RESTORE_FL);
            site(irq_base, &irq_ops, "save_fl", native::SAVE_FL);
            site(irq_base, &irq_ops, "irq_enable", native::IRQ_ENABLE);
            site(irq_base, &irq_ops, "irq_disable", native::IRQ_DISABLE);
            site(cpu_base, &cpu_ops, "irq_enable_sysexit", native::IRQ_ENABLE_SYSEXIT);
            site(cpu_base, &cpu_ops, "usergs_sysret32", native::USERGS_SYSRET32);
            site(cpu_base, &cpu_ops, "usergs_sysret64", native::USERGS_SYSRET64);
            site(cpu_base, &cpu_ops, "swapgs", native::SWAPGS);
            site(cpu_base, &cpu_ops, "clts", native::CLTS);
            site(cpu_base, &cpu_ops, "wbinvd", native::WBINVD);
            site(mmu_base, &mmu_ops, "read_cr2", native::READ_CR2);
            site(mmu_base, &mmu_ops, "read_cr3", native::READ_CR3);
            site(mmu_base, &mmu_ops, "write_cr3", native::WRITE_CR3);
            site(mmu_base, &mmu_ops, "flush_tlb_single", native::FLUSH_TLB_SINGLE);
        }

        let mut jmp_sites = Vec::new();
        for member in ["iret", "irq_enable_sysexit", "usergs_sysret32", "usergs_sysret64"] {
            if let Ok(offset) = cpu_ops.member_offset(member) {
                jmp_sites.push(cpu_base + offset);
            }
        }

        Ok(ParavirtState {
            tables,
            nop_func,
            ident32_func,
            ident64_func,
            native_sites,
            jmp_sites,
        })
    }

    /// The function pointer installed for a template offset. The offset is
    /// reduced modulo each table's size in member order; the tables behave
    /// like one contiguous array of slots.
    fn call_destination(&self, memory: &dyn GuestMemory, mut offset: u64) -> Result<u64> {
        for table in &self.tables {
            if offset < table.size {
                return memory.read_u64(table.address + offset, KERNEL_SPACE);
            }
            offset -= table.size;
        }
        Ok(0)
    }

    /// Emit up to `len` bytes for the site into `buf`, returning the number
    /// of bytes produced. The caller NOP-pads the remainder.
    pub fn patch_site(
        &self,
        memory: &dyn GuestMemory,
        type_offset: u64,
        clobbers: u16,
        site_addr: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let len = buf.len();

        if let Some(insns) = self.native_sites.get(&type_offset) {
            return Ok(patch_insns(buf, insns));
        }

        let opfunc = self.call_destination(memory, type_offset)?;

        if opfunc == 0 || opfunc == self.nop_func {
            // nop the whole callsite
            return Ok(0);
        }
        if opfunc == self.ident32_func {
            return Ok(patch_insns(buf, native::MOV32));
        }
        if opfunc == self.ident64_func {
            return Ok(patch_insns(buf, native::MOV64));
        }
        if self.jmp_sites.contains(&type_offset) {
            if len < 5 {
                return Ok(len);
            }
            let delta = opfunc.wrapping_sub(site_addr + 5) as u32;
            buf[0] = 0xe9;
            buf[1..5].copy_from_slice(&delta.to_le_bytes());
            return Ok(5);
        }

        // plain call; the target may clobber any caller-save register
        if CLBR_ANY & !clobbers != 0 {
            return Ok(len);
        }
        if len < 5 {
            return Ok(len);
        }
        let delta = opfunc.wrapping_sub(site_addr + 5) as u32;
        buf[0] = 0xe8;
        buf[1..5].copy_from_slice(&delta.to_le_bytes());
        Ok(5)
    }
}

/// Copy a canonical sequence into the site buffer; a sequence longer than
/// the site leaves the original bytes untouched.
fn patch_insns(buf: &mut [u8], insns: &[u8]) -> usize {
    if insns.len() > buf.len() {
        return buf.len();
    }
    buf[..insns.len()].copy_from_slice(insns);
    insns.len()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::guest::mock::MockGuest;
    use crate::guest::types::fake::FakeTypes;
    use crate::guest::types::{Member, MemberKind};

    pub(crate) fn pv_oracle() -> FakeTypes {
        let mut types = FakeTypes::new();
        let ptr = |name: &str, offset: u64| Member {
            name: name.into(),
            offset,
            size: 8,
            kind: MemberKind::Pointer(None),
        };

        types.add_struct("pv_init_ops", 0x10, vec![ptr("patch", 0)]);
        types.add_struct("pv_time_ops", 0x10, vec![ptr("sched_clock", 0)]);
        types.add_struct(
            "pv_cpu_ops",
            0x40,
            vec![
                ptr("iret", 0x00),
                ptr("irq_enable_sysexit", 0x08),
                ptr("usergs_sysret32", 0x10),
                ptr("usergs_sysret64", 0x18),
                ptr("swapgs", 0x20),
                ptr("clts", 0x28),
                ptr("wbinvd", 0x30),
                ptr("cpuid", 0x38),
            ],
        );
        types.add_struct(
            "pv_irq_ops",
            0x20,
            vec![
                ptr("save_fl", 0x00),
                ptr("restore_fl", 0x08),
                ptr("irq_disable", 0x10),
                ptr("irq_enable", 0x18),
            ],
        );
        types.add_struct("pv_apic_ops", 0x8, vec![ptr("apic_post_init", 0)]);
        types.add_struct(
            "pv_mmu_ops",
            0x30,
            vec![
                ptr("read_cr2", 0x00),
                ptr("read_cr3", 0x08),
                ptr("write_cr3", 0x10),
                ptr("flush_tlb_single", 0x18),
                ptr("set_pte", 0x20),
                ptr("make_pte", 0x28),
            ],
        );
        types.add_struct("pv_lock_ops", 0x8, vec![ptr("queued_spin_lock_slowpath", 0)]);
        types.add_struct(
            "paravirt_patch_template",
            0xc0,
            vec![
                Member {
                    name: "pv_init_ops".into(),
                    offset: 0x00,
                    size: 0x10,
                    kind: MemberKind::Struct("pv_init_ops".into()),
                },
                Member {
                    name: "pv_time_ops".into(),
                    offset: 0x10,
                    size: 0x10,
                    kind: MemberKind::Struct("pv_time_ops".into()),
                },
                Member {
                    name: "pv_cpu_ops".into(),
                    offset: 0x20,
                    size: 0x40,
                    kind: MemberKind::Struct("pv_cpu_ops".into()),
                },
                Member {
                    name: "pv_irq_ops".into(),
                    offset: 0x60,
                    size: 0x20,
                    kind: MemberKind::Struct("pv_irq_ops".into()),
                },
                Member {
                    name: "pv_apic_ops".into(),
                    offset: 0x80,
                    size: 0x8,
                    kind: MemberKind::Struct("pv_apic_ops".into()),
                },
                Member {
                    name: "pv_mmu_ops".into(),
                    offset: 0x88,
                    size: 0x30,
                    kind: MemberKind::Struct("pv_mmu_ops".into()),
                },
                Member {
                    name: "pv_lock_ops".into(),
                    offset: 0xb8,
                    size: 0x8,
                    kind: MemberKind::Struct("pv_lock_ops".into()),
                },
            ],
        );

        for (i, name) in TABLE_NAMES.iter().enumerate() {
            types.add_variable(name, 0xffffffff81e00000 + 0x100 * i as u64, Some(name));
        }
        types.add_function("_paravirt_nop", 0xffffffff81050000);
        types.add_function("_paravirt_ident_32", 0xffffffff81050010);
        types.add_function("_paravirt_ident_64", 0xffffffff81050020);
        types
    }

    pub(crate) fn pv_guest_with_tables() -> MockGuest {
        let mut guest = MockGuest::new();
        // one backing region for all seven tables
        guest.map_kernel(0xffffffff81e00000, vec![0u8; 0x700], false);
        guest
    }

    fn table_region(table_index: usize, slot: u64, value: u64) -> (u64, Vec<u8>) {
        let addr = 0xffffffff81e00000 + 0x100 * table_index as u64;
        (addr + slot, value.to_le_bytes().to_vec())
    }

    #[test]
    fn native_slot_gets_canonical_bytes() {
        let types = pv_oracle();
        let state = ParavirtState::load(&types).unwrap();
        let guest = pv_guest_with_tables();

        // pv_irq_ops.irq_disable lives at template offset 0x60 + 0x10
        let mut buf = [0x90u8; 4];
        let used = state
            .patch_site(&guest, 0x70, CLBR_ANY, 0xffffffff81001000, &mut buf)
            .unwrap();
        assert_eq!(used, 1);
        assert_eq!(buf[0], 0xfa); // cli
    }

    #[test]
    fn nop_function_slots_are_nopped_out() {
        let types = pv_oracle();
        let state = ParavirtState::load(&types).unwrap();
        let mut guest = MockGuest::new();
        let (addr, bytes) = table_region(4, 0, 0xffffffff81050000); // _paravirt_nop
        let mut region = vec![0u8; 0x700];
        region[(addr - 0xffffffff81e00000) as usize..(addr - 0xffffffff81e00000) as usize + 8]
            .copy_from_slice(&bytes);
        guest.map_kernel(0xffffffff81e00000, region, false);

        // pv_apic_ops slot 0 = template offset 0x80
        let mut buf = [0xaau8; 8];
        let used = state
            .patch_site(&guest, 0x80, CLBR_ANY, 0xffffffff81001000, &mut buf)
            .unwrap();
        assert_eq!(used, 0);
    }

    #[test]
    fn other_slots_become_direct_calls() {
        let types = pv_oracle();
        let state = ParavirtState::load(&types).unwrap();
        let mut guest = MockGuest::new();
        let mut region = vec![0u8; 0x700];
        // pv_mmu_ops.set_pte (template 0x88 + 0x20) -> some kernel function
        let target: u64 = 0xffffffff81234560;
        region[0x500 + 0x20..0x500 + 0x28].copy_from_slice(&target.to_le_bytes());
        guest.map_kernel(0xffffffff81e00000, region, false);

        let site = 0xffffffff81001000u64;
        let mut buf = [0u8; 8];
        let used = state
            .patch_site(&guest, 0xa8, CLBR_ANY, site, &mut buf)
            .unwrap();
        assert_eq!(used, 5);
        assert_eq!(buf[0], 0xe8);
        let delta = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        assert_eq!(delta, target.wrapping_sub(site + 5) as u32);
    }
}

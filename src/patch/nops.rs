//! Architectural NOP sequences.
//!
//! The kernel selects one family at boot (`ideal_nops`): multi-byte
//! `0F 1F` forms on Intel P6 and onwards, `66`-prefixed single-byte forms on
//! AMD K8. Index 1..=8 is the NOP of that byte length, index 9 the 5-byte
//! atomic variant.

use crate::guest::types::TypeOracle;
use crate::guest::{GuestMemory, KERNEL_SPACE};
use crate::prelude::*;

pub const ASM_NOP_MAX: usize = 8;

const P6_NOPS: [&[u8]; 10] = [
    &[],
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    // 5-byte atomic
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
];

const K8_NOPS: [&[u8]; 10] = [
    &[],
    &[0x90],
    &[0x66, 0x90],
    &[0x66, 0x66, 0x90],
    &[0x66, 0x66, 0x66, 0x90],
    &[0x66, 0x66, 0x90, 0x66, 0x90],
    &[0x66, 0x66, 0x90, 0x66, 0x66, 0x90],
    &[0x66, 0x66, 0x66, 0x90, 0x66, 0x66, 0x90],
    &[0x66, 0x66, 0x66, 0x90, 0x66, 0x66, 0x66, 0x90],
    // 5-byte atomic
    &[0x66, 0x66, 0x66, 0x66, 0x90],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NopFamily {
    P6,
    K8,
}

impl NopFamily {
    fn table(&self) -> &'static [&'static [u8]; 10] {
        match self {
            NopFamily::P6 => &P6_NOPS,
            NopFamily::K8 => &K8_NOPS,
        }
    }

    /// The NOP of exactly `len` bytes, 1..=8.
    pub fn nop(&self, len: usize) -> &'static [u8] {
        self.table()[len]
    }

    pub fn nop5(&self) -> &'static [u8] {
        self.table()[5]
    }

    /// The 5-byte atomic NOP (`ideal_nops[9]`).
    pub fn atomic5(&self) -> &'static [u8] {
        self.table()[9]
    }

    /// Detect the family active in the guest by comparing the `ideal_nops`
    /// pointer with the addresses of the `p6_nops` / `k8_nops` tables.
    pub fn detect(oracle: &dyn TypeOracle, memory: &dyn GuestMemory) -> Result<NopFamily> {
        let ideal = oracle.variable("ideal_nops")?;
        let p6 = oracle.variable("p6_nops")?.address;
        let k8 = oracle.variable("k8_nops")?.address;

        let active = ideal.value_u64(memory, KERNEL_SPACE)?;
        if active == p6 {
            Ok(NopFamily::P6)
        } else if active == k8 {
            Ok(NopFamily::K8)
        } else {
            bail!("ideal_nops points to neither p6_nops nor k8_nops: {active:#x}")
        }
    }
}

/// Fill `buf` entirely with NOPs, longest-first like the kernel's
/// `add_nops`.
pub fn add_nops(buf: &mut [u8], family: NopFamily) {
    let mut rest = buf;
    while !rest.is_empty() {
        let len = rest.len().min(ASM_NOP_MAX);
        rest[..len].copy_from_slice(family.nop(len));
        rest = &mut rest[len..];
    }
}

//! User address-space layout.
//!
//! Virtual addresses are 32-bit. The migration path walks `[UTEXT, UTOP)`;
//! the exception stack page at `UXSTACKTOP - PGSIZE` sits inside that range
//! and travels like any other page. The scratch pages the gateway protocol
//! uses live just above the user temp area and are below `UTEXT`, so they are
//! never shipped.

use crate::mem::PGSIZE;

/// Number of environment slots. Power of two; the slot index is the low bits
/// of an environment id.
pub const NENV: usize = 1024;

/// Top of the user-visible address space.
pub const UTOP: u32 = 0xeec0_0000;

/// Exception stack top; the page below it is part of the migrated range.
pub const UXSTACKTOP: u32 = UTOP;

/// Top of the ordinary user stack, one guard page under the exception stack.
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE as u32;

/// Start of program text; migration ships `[UTEXT, UTOP)`.
pub const UTEXT: u32 = 0x0080_0000;

/// Kernel-internal temporary window.
pub const UTEMP: u32 = 0x0040_0000;

/// Scratch page a suspending environment packs gateway arguments into.
pub const IPCSND: u32 = UTEMP + PGSIZE as u32;

/// Page the gateways receive request arguments at.
pub const IPCRCV: u32 = UTEMP + PGSIZE as u32;

pub fn page_aligned(va: u32) -> bool {
    va % PGSIZE as u32 == 0
}

//! Hypercall Interface
//!
//! The guest cannot write its own page tables. Every change goes through
//! one of three request shapes:
//! - MMU-update records (`{machine address of entry, new value}`), applied
//!   as a set by one `mmu_update` call
//! - extended MMU operations such as pinning a frame as a table node
//! - `update_va_mapping` (rewrite the leaf entry for a virtual address and
//!   invalidate its TLB entry), either alone or bundled into a multicall
//!
//! The record layouts are `repr(C)` and match the Xen ABI, so the same
//! buffers go to the hypervisor unchanged.

use core::fmt;

use crate::mm::address::{MachineAddr, Mfn, VirtAddr};
use crate::mm::paging::PageTableEntry;

#[cfg(target_arch = "x86_64")]
pub mod xen;

/// Hypercall numbers used by the page table code.
pub mod numbers {
    pub const MMU_UPDATE: u64 = 1;
    pub const MULTICALL: u64 = 13;
    pub const UPDATE_VA_MAPPING: u64 = 14;
    pub const MMUEXT_OP: u64 = 26;
    pub const SCHED_OP: u64 = 29;
}

/// Request type encoded in the low bits of an MMU-update pointer.
const MMU_NORMAL_PT_UPDATE: u64 = 0;

/// Domain id meaning "the calling domain".
pub const DOMID_SELF: u16 = 0x7FF0;

bitflags::bitflags! {
    /// TLB handling requested alongside `update_va_mapping`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UvmFlags: u64 {
        /// Flush the entire TLB.
        const TLB_FLUSH = 1;
        /// Invalidate the single entry for the address.
        const INVLPG    = 2;
        /// Apply the flush on every vCPU.
        const ALL       = 4;
    }
}

/// The hypercall a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypercall {
    MmuUpdate,
    MmuextOp,
    UpdateVaMapping,
    Multicall,
}

/// A hypercall reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypercallError {
    pub call: Hypercall,
    /// Negative errno returned by the hypervisor.
    pub code: i64,
}

impl HypercallError {
    pub const fn new(call: Hypercall, code: i64) -> Self {
        Self { call, code }
    }
}

impl fmt::Display for HypercallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.call {
            Hypercall::MmuUpdate => "mmu_update",
            Hypercall::MmuextOp => "mmuext_op",
            Hypercall::UpdateVaMapping => "update_va_mapping",
            Hypercall::Multicall => "multicall",
        };
        write!(f, "{} hypercall failed ({})", name, self.code)
    }
}

/// One MMU-update record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct MmuUpdate {
    /// Machine address of the entry, with the request type in the low bits.
    pub ptr: u64,
    /// New entry value.
    pub val: u64,
}

impl MmuUpdate {
    /// Record that writes `entry` to the table entry at machine address `slot`.
    #[inline]
    pub const fn normal(slot: MachineAddr, entry: PageTableEntry) -> Self {
        Self {
            ptr: slot.as_u64() | MMU_NORMAL_PT_UPDATE,
            val: entry.raw(),
        }
    }

    /// Machine address of the entry this record rewrites.
    #[inline]
    pub const fn slot(&self) -> MachineAddr {
        MachineAddr::new(self.ptr & !0b11)
    }

    #[inline]
    pub const fn entry(&self) -> PageTableEntry {
        PageTableEntry::from_raw(self.val)
    }
}

/// Extended MMU command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MmuExtCmd {
    PinL1Table = 0,
    PinL2Table = 1,
    PinL3Table = 2,
    PinL4Table = 3,
}

impl MmuExtCmd {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::PinL1Table),
            1 => Some(Self::PinL2Table),
            2 => Some(Self::PinL3Table),
            3 => Some(Self::PinL4Table),
            _ => None,
        }
    }
}

/// One extended MMU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MmuExtOp {
    pub cmd: u32,
    _pad: u32,
    /// Frame operand.
    pub arg1: u64,
    pub arg2: u64,
}

impl MmuExtOp {
    /// Operation applying `cmd` to the machine frame `mfn`.
    pub const fn new(cmd: MmuExtCmd, mfn: Mfn) -> Self {
        Self {
            cmd: cmd as u32,
            _pad: 0,
            arg1: mfn.as_u64(),
            arg2: 0,
        }
    }

    #[inline]
    pub const fn command(&self) -> Option<MmuExtCmd> {
        MmuExtCmd::from_raw(self.cmd)
    }

    #[inline]
    pub const fn mfn(&self) -> Mfn {
        Mfn::new(self.arg1)
    }
}

/// One entry of a multicall: a hypercall number and its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct MulticallEntry {
    pub op: u64,
    /// Filled in by the hypervisor.
    pub result: i64,
    pub args: [u64; 6],
}

impl MulticallEntry {
    /// A bundled `update_va_mapping` request.
    pub const fn update_va_mapping(virt: VirtAddr, entry: PageTableEntry, flags: UvmFlags) -> Self {
        Self {
            op: numbers::UPDATE_VA_MAPPING,
            result: 0,
            args: [virt.as_u64(), entry.raw(), flags.bits(), 0, 0, 0],
        }
    }
}

/// Request/response gate to the hypervisor.
///
/// Calls are synchronous and never yield. A returned error means nothing
/// can be assumed about how much of the request was applied.
pub trait Hypervisor {
    /// Apply a set of MMU-update records to the calling domain's tables.
    fn mmu_update(&self, updates: &[MmuUpdate]) -> Result<(), HypercallError>;

    /// Perform extended MMU operations (pinning).
    fn mmuext_op(&self, ops: &[MmuExtOp]) -> Result<(), HypercallError>;

    /// Rewrite the leaf entry mapping `virt` and apply `flags` TLB handling.
    fn update_va_mapping(
        &self,
        virt: VirtAddr,
        entry: PageTableEntry,
        flags: UvmFlags,
    ) -> Result<(), HypercallError>;

    /// Issue several hypercalls in one transition. Per-call results are
    /// written back into `calls`; any non-zero result is an error.
    fn multicall(&self, calls: &mut [MulticallEntry]) -> Result<(), HypercallError>;

    /// Ask the hypervisor to crash this domain.
    fn crash(&self) -> !;
}

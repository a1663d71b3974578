//! Xen Hypercall Page Transport (x86_64)
//!
//! Hypercalls are made by calling into the hypercall page the hypervisor
//! fills in at boot: entry `n` sits at `page + n * 32`. Arguments travel in
//! `rdi, rsi, rdx, r10, r8` and the result comes back in `rax`.

use core::arch::asm;

use super::{
    numbers, Hypercall, HypercallError, Hypervisor, MmuExtOp, MmuUpdate, MulticallEntry,
    UvmFlags, DOMID_SELF,
};
use crate::mm::address::VirtAddr;
use crate::mm::paging::PageTableEntry;

/// `SCHEDOP_shutdown`
const SCHEDOP_SHUTDOWN: u64 = 2;
/// `SHUTDOWN_crash`
const SHUTDOWN_CRASH: u32 = 3;

/// Size of one hypercall stub.
const STUB_SIZE: usize = 32;

#[repr(C)]
struct SchedShutdown {
    reason: u32,
}

/// Hypercalls through the Xen hypercall page.
pub struct HypercallPage {
    page: VirtAddr,
}

impl HypercallPage {
    /// Create a transport over the hypercall page at `page`.
    ///
    /// # Safety
    /// `page` must be the hypercall page registered with the hypervisor and
    /// remain mapped executable for the lifetime of the value.
    pub const unsafe fn new(page: VirtAddr) -> Self {
        Self { page }
    }

    /// # Safety
    /// The arguments must be valid for hypercall `op`; pointer arguments
    /// must reference live memory of the layout the hypervisor expects.
    unsafe fn call(&self, op: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
        let entry = self.page.as_usize() + op as usize * STUB_SIZE;
        let ret: i64;
        // SAFETY: The caller guarantees the arguments; the stub follows the
        // documented register convention and clobbers only what the C ABI allows.
        unsafe {
            asm!(
                "call {entry}",
                entry = in(reg) entry,
                inlateout("rdi") a1 => _,
                inlateout("rsi") a2 => _,
                inlateout("rdx") a3 => _,
                inlateout("r10") a4 => _,
                lateout("rax") ret,
                clobber_abi("C"),
            );
        }
        ret
    }
}

impl Hypervisor for HypercallPage {
    fn mmu_update(&self, updates: &[MmuUpdate]) -> Result<(), HypercallError> {
        // SAFETY: `updates` is a live slice of repr(C) records for the call.
        let ret = unsafe {
            self.call(
                numbers::MMU_UPDATE,
                updates.as_ptr() as u64,
                updates.len() as u64,
                0,
                u64::from(DOMID_SELF),
            )
        };
        check(Hypercall::MmuUpdate, ret)
    }

    fn mmuext_op(&self, ops: &[MmuExtOp]) -> Result<(), HypercallError> {
        // SAFETY: `ops` is a live slice of repr(C) records for the call.
        let ret = unsafe {
            self.call(
                numbers::MMUEXT_OP,
                ops.as_ptr() as u64,
                ops.len() as u64,
                0,
                u64::from(DOMID_SELF),
            )
        };
        check(Hypercall::MmuextOp, ret)
    }

    fn update_va_mapping(
        &self,
        virt: VirtAddr,
        entry: PageTableEntry,
        flags: UvmFlags,
    ) -> Result<(), HypercallError> {
        // SAFETY: Plain integer arguments.
        let ret = unsafe {
            self.call(numbers::UPDATE_VA_MAPPING, virt.as_u64(), entry.raw(), flags.bits(), 0)
        };
        check(Hypercall::UpdateVaMapping, ret)
    }

    fn multicall(&self, calls: &mut [MulticallEntry]) -> Result<(), HypercallError> {
        // SAFETY: `calls` is a live, writable slice; the hypervisor writes
        // each entry's result field.
        let ret = unsafe {
            self.call(numbers::MULTICALL, calls.as_mut_ptr() as u64, calls.len() as u64, 0, 0)
        };
        check(Hypercall::Multicall, ret)?;
        match calls.iter().find(|c| c.result != 0) {
            Some(failed) => Err(HypercallError::new(Hypercall::Multicall, failed.result)),
            None => Ok(()),
        }
    }

    fn crash(&self) -> ! {
        let shutdown = SchedShutdown { reason: SHUTDOWN_CRASH };
        loop {
            // SAFETY: `shutdown` outlives the call.
            unsafe {
                self.call(
                    numbers::SCHED_OP,
                    SCHEDOP_SHUTDOWN,
                    &shutdown as *const SchedShutdown as u64,
                    0,
                    0,
                );
            }
        }
    }
}

#[inline]
fn check(call: Hypercall, ret: i64) -> Result<(), HypercallError> {
    if ret < 0 {
        Err(HypercallError::new(call, ret))
    } else {
        Ok(())
    }
}

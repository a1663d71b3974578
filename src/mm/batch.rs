//! Hypercall Batches
//!
//! Every hypercall is a guest/hypervisor transition, so table updates are
//! collected in fixed-size buffers and submitted together. The buffers are
//! owned by the caller and passed into each operation; nothing here is
//! global.
//!
//! Capacity only changes how many calls are made, never the resulting
//! tables.

use crate::hypervisor::{HypercallError, Hypervisor, MmuUpdate, MulticallEntry};

/// Default MMU-update batch: one leaf table's worth of entries.
pub const MMU_BATCH_ENTRIES: usize = 512;

/// Default multicall batch.
pub const MULTICALL_BATCH_ENTRIES: usize = 1024;

/// Pending MMU-update records.
pub struct MmuBatch<const N: usize> {
    updates: [MmuUpdate; N],
    len: usize,
}

impl<const N: usize> MmuBatch<N> {
    pub const fn new() -> Self {
        assert!(N > 0, "batch capacity must be non-zero");
        Self {
            updates: [MmuUpdate { ptr: 0, val: 0 }; N],
            len: 0,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Queue `update`, submitting the batch once it is full.
    pub fn push<H: Hypervisor + ?Sized>(
        &mut self,
        hv: &H,
        update: MmuUpdate,
    ) -> Result<(), HypercallError> {
        self.updates[self.len] = update;
        self.len += 1;
        if self.len == N {
            self.flush(hv)?;
        }
        Ok(())
    }

    /// Submit all queued records in one `mmu_update` call.
    pub fn flush<H: Hypervisor + ?Sized>(&mut self, hv: &H) -> Result<(), HypercallError> {
        if self.len == 0 {
            return Ok(());
        }
        let pending = self.len;
        self.len = 0;
        hv.mmu_update(&self.updates[..pending])
    }
}

impl<const N: usize> Default for MmuBatch<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending multicall entries.
pub struct MulticallBatch<const N: usize> {
    calls: [MulticallEntry; N],
    len: usize,
}

impl<const N: usize> MulticallBatch<N> {
    pub const fn new() -> Self {
        assert!(N > 0, "batch capacity must be non-zero");
        Self {
            calls: [MulticallEntry { op: 0, result: 0, args: [0; 6] }; N],
            len: 0,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Queue `call`, submitting the batch once it is full.
    pub fn push<H: Hypervisor + ?Sized>(
        &mut self,
        hv: &H,
        call: MulticallEntry,
    ) -> Result<(), HypercallError> {
        self.calls[self.len] = call;
        self.len += 1;
        if self.len == N {
            self.flush(hv)?;
        }
        Ok(())
    }

    /// Submit every queued entry in one multicall.
    pub fn flush<H: Hypervisor + ?Sized>(&mut self, hv: &H) -> Result<(), HypercallError> {
        if self.len == 0 {
            return Ok(());
        }
        let pending = self.len;
        self.len = 0;
        hv.multicall(&mut self.calls[..pending])
    }
}

impl<const N: usize> Default for MulticallBatch<N> {
    fn default() -> Self {
        Self::new()
    }
}

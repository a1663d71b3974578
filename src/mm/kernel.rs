//! Kernel-Facing Page Table Interface
//!
//! Owns the tree handle and the hypercall batches, and turns every error
//! into domain termination. Callers get plain values back.

use super::address::{Mfn, Pfn, VirtAddr};
use super::alloc_env::FrameAllocEnv;
use super::batch::{MmuBatch, MulticallBatch, MMU_BATCH_ENTRIES, MULTICALL_BATCH_ENTRIES};
use super::boot::{self, BootFrames, StartInfo};
use super::mapper::PageTables;
use super::memory::TableMemory;
use super::p2m::FrameTranslation;
use super::paging::PageTableEntry;
use crate::fault::OrTerminate;
use crate::hypervisor::Hypervisor;

pub struct KernelMm<'a, H: ?Sized, M: ?Sized, T> {
    tables: PageTables<'a, H, M, T>,
    mmu: MmuBatch<MMU_BATCH_ENTRIES>,
    calls: MulticallBatch<MULTICALL_BATCH_ENTRIES>,
}

impl<'a, H, M, T> KernelMm<'a, H, M, T>
where
    H: Hypervisor + ?Sized,
    M: TableMemory + ?Sized,
    T: FrameTranslation,
{
    pub fn new(tables: PageTables<'a, H, M, T>) -> Self {
        Self {
            tables,
            mmu: MmuBatch::new(),
            calls: MulticallBatch::new(),
        }
    }

    #[inline]
    pub fn tables(&self) -> &PageTables<'a, H, M, T> {
        &self.tables
    }

    /// Map all guest memory 1:1.
    pub fn arch_init_mm(&mut self, info: &StartInfo) -> BootFrames {
        boot::arch_init_mm(&self.tables, info, &mut self.mmu).or_terminate(self.tables.hypervisor())
    }

    pub fn build_pagetable(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        target: &mut dyn FrameAllocEnv,
        nodes: &mut dyn FrameAllocEnv,
    ) {
        self.tables
            .build_pagetable(start, end, target, nodes, &mut self.mmu)
            .or_terminate(self.tables.hypervisor())
    }

    pub fn build_pagetable_large(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        target: &mut dyn FrameAllocEnv,
        nodes: &mut dyn FrameAllocEnv,
    ) {
        self.tables
            .build_pagetable_large(start, end, target, nodes, &mut self.mmu)
            .or_terminate(self.tables.hypervisor())
    }

    pub fn demolish_pagetable(&mut self, start: VirtAddr, end: VirtAddr) {
        self.tables
            .demolish_pagetable(start, end, &mut self.calls)
            .or_terminate(self.tables.hypervisor())
    }

    pub fn demolish_pagetable_large(&mut self, start: VirtAddr, end: VirtAddr) {
        self.tables
            .demolish_pagetable_large(start, end, &mut self.calls)
            .or_terminate(self.tables.hypervisor())
    }

    pub fn write_protect(&mut self, start: VirtAddr, end: VirtAddr) {
        self.tables
            .write_protect(start, end, &mut self.calls)
            .or_terminate(self.tables.hypervisor())
    }

    pub fn write_protect_large(&mut self, start: VirtAddr, end: VirtAddr) {
        self.tables
            .write_protect_large(start, end, &mut self.calls)
            .or_terminate(self.tables.hypervisor())
    }

    pub fn unmap_page_pfn(&self, virt: VirtAddr, pfn: Pfn) {
        self.tables
            .unmap_page_pfn(virt, pfn)
            .or_terminate(self.tables.hypervisor())
    }

    pub fn unmap_page(&self, virt: VirtAddr) {
        self.tables.unmap_page(virt).or_terminate(self.tables.hypervisor())
    }

    pub fn remap_page_pfn(&self, virt: VirtAddr, pfn: Pfn) {
        self.tables
            .remap_page_pfn(virt, pfn)
            .or_terminate(self.tables.hypervisor())
    }

    pub fn remap_page(&self, virt: VirtAddr) {
        self.tables.remap_page(virt).or_terminate(self.tables.hypervisor())
    }

    pub fn clear_pte(&self, virt: VirtAddr) {
        self.tables.clear_pte(virt).or_terminate(self.tables.hypervisor())
    }

    #[inline]
    pub fn validate(&self, virt: VirtAddr) -> bool {
        self.tables.validate(virt)
    }

    #[inline]
    pub fn translate(&self, virt: VirtAddr) -> Option<Pfn> {
        self.tables.translate(virt)
    }

    #[inline]
    pub fn walk_to_pfn(&self, virt: VirtAddr) -> Option<(Pfn, PageTableEntry)> {
        self.tables.walk_to_pfn(virt)
    }

    #[inline]
    pub fn pfn_to_mfn(&self, pfn: Pfn) -> Mfn {
        self.tables.pfn_to_mfn(pfn)
    }

    #[inline]
    pub fn mfn_to_pfn(&self, mfn: Mfn) -> Pfn {
        self.tables.mfn_to_pfn(mfn)
    }
}

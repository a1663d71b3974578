//! Unmapping and Write Protection
//!
//! Leaf changes to existing mappings go through `update_va_mapping`, which
//! also invalidates the TLB entry on every vCPU. Range operations bundle
//! those calls into multicalls; single-page operations issue them directly.
//!
//! Intermediate table nodes are left alone: ranges are cleared, never
//! reclaimed.

use super::address::{Pfn, VirtAddr};
use super::batch::MulticallBatch;
use super::mapper::{MappingSize, PageTables};
use super::memory::TableMemory;
use super::p2m::FrameTranslation;
use super::paging::{MmError, PageTableEntry, PteFlags};
use crate::hypervisor::{Hypervisor, MulticallEntry, UvmFlags};

/// TLB handling for every leaf rewrite: drop the entry on all vCPUs.
const INVALIDATE: UvmFlags = UvmFlags::INVLPG.union(UvmFlags::ALL);

impl<H, M, T> PageTables<'_, H, M, T>
where
    H: Hypervisor + ?Sized,
    M: TableMemory + ?Sized,
    T: FrameTranslation,
{
    /// Clear every 4 KiB leaf in `[start, end)`.
    pub fn demolish_pagetable<const N: usize>(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        batch: &mut MulticallBatch<N>,
    ) -> Result<(), MmError> {
        self.rewrite_leaves(start, end, MappingSize::Small, batch, |_| {
            Some(PageTableEntry::empty())
        })
    }

    /// Clear every large-page leaf in `[start, end)`.
    pub fn demolish_pagetable_large<const N: usize>(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        batch: &mut MulticallBatch<N>,
    ) -> Result<(), MmError> {
        self.rewrite_leaves(start, end, MappingSize::Large, batch, |_| {
            Some(PageTableEntry::empty())
        })
    }

    /// Clear the writable bit of every 4 KiB leaf in `[start, end)`,
    /// keeping the mapped frames.
    pub fn write_protect<const N: usize>(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        batch: &mut MulticallBatch<N>,
    ) -> Result<(), MmError> {
        self.rewrite_leaves(start, end, MappingSize::Small, batch, read_only)
    }

    /// Large-page variant of [`write_protect`](Self::write_protect).
    pub fn write_protect_large<const N: usize>(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        batch: &mut MulticallBatch<N>,
    ) -> Result<(), MmError> {
        self.rewrite_leaves(start, end, MappingSize::Large, batch, read_only)
    }

    /// Queue one `update_va_mapping` per stride whose leaf `rewrite` wants
    /// changed. Strides without intermediate tables are skipped.
    fn rewrite_leaves<const N: usize>(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        size: MappingSize,
        batch: &mut MulticallBatch<N>,
        rewrite: impl Fn(PageTableEntry) -> Option<PageTableEntry>,
    ) -> Result<(), MmError> {
        let stride = self.check_range(start, end, size)?;
        log::trace!("MM: rewriting leaves {}..{} ({:?})", start, end, size);

        let mut virt = start;
        while virt < end {
            let entry = self.walk(virt).map(|leaf| leaf.entry);
            if let Some(new) = entry.and_then(&rewrite) {
                batch.push(
                    self.hypervisor(),
                    MulticallEntry::update_va_mapping(virt, new, INVALIDATE),
                )?;
            }
            virt = virt.add(stride);
        }

        batch.flush(self.hypervisor())?;
        Ok(())
    }

    /// Unmap the page at `virt`, leaving `pfn`'s machine frame in the
    /// not-present entry.
    pub fn unmap_page_pfn(&self, virt: VirtAddr, pfn: Pfn) -> Result<(), MmError> {
        let entry = PageTableEntry::new(self.pfn_to_mfn(pfn), PteFlags::empty());
        self.hypervisor()
            .update_va_mapping(virt.align_down(), entry, INVALIDATE)?;
        Ok(())
    }

    /// Unmap a page of the direct map.
    pub fn unmap_page(&self, virt: VirtAddr) -> Result<(), MmError> {
        self.unmap_page_pfn(virt, self.layout().virt_to_pfn(virt))
    }

    /// Map `pfn` writable at `virt` again.
    pub fn remap_page_pfn(&self, virt: VirtAddr, pfn: Pfn) -> Result<(), MmError> {
        let entry = PageTableEntry::new(self.pfn_to_mfn(pfn), self.mode().leaf_prot());
        self.hypervisor()
            .update_va_mapping(virt.align_down(), entry, INVALIDATE)?;
        Ok(())
    }

    /// Restore the direct-map mapping of the page at `virt`.
    pub fn remap_page(&self, virt: VirtAddr) -> Result<(), MmError> {
        self.remap_page_pfn(virt, self.layout().virt_to_pfn(virt))
    }

    /// Zero the leaf entry for `virt`.
    pub fn clear_pte(&self, virt: VirtAddr) -> Result<(), MmError> {
        self.hypervisor()
            .update_va_mapping(virt.align_down(), PageTableEntry::empty(), INVALIDATE)?;
        Ok(())
    }
}

/// Present leaves lose their writable bit; absent ones are left alone.
fn read_only(entry: PageTableEntry) -> Option<PageTableEntry> {
    entry
        .is_present()
        .then(|| entry.without(PteFlags::RW))
}

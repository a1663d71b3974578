//! Memory Bootstrap
//!
//! The domain builder hands over a page table tree that maps the kernel
//! image, the tables themselves and a little slack. Everything from the
//! end of that initial mapping up to the last guest frame is mapped 1:1
//! here, taking new table nodes from the frames just past the builder's
//! tables.

use super::address::{Pfn, VirtAddr};
use super::alloc_env::LinearFrames;
use super::batch::MmuBatch;
use super::mapper::PageTables;
use super::memory::TableMemory;
use super::p2m::FrameTranslation;
use super::paging::{MmError, PagingMode};
use crate::hypervisor::Hypervisor;

/// Frames past the builder's page tables that are never handed out.
///
/// The builder leaves them in use; what for is not documented.
pub const BOOT_RESERVED_FRAMES: u64 = 3;

/// Boot information from the domain builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartInfo {
    /// Virtual address of the root table.
    pub pt_base: VirtAddr,
    /// Frames occupied by the initial page tables, starting at `pt_base`.
    pub nr_pt_frames: u64,
    /// Guest frames in the domain.
    pub nr_pages: u64,
    pub mode: PagingMode,
}

/// Free frame range after bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootFrames {
    /// First frame not used by the kernel image or any page table.
    pub free_pfn: Pfn,
    /// One past the last guest frame.
    pub max_pfn: Pfn,
}

impl BootFrames {
    /// Frames left for the allocator. Zero when the builder's tables and
    /// reserved frames already reach past the end of guest memory.
    #[inline]
    pub const fn free_frames(&self) -> u64 {
        self.max_pfn.as_u64().saturating_sub(self.free_pfn.as_u64())
    }
}

/// Map all guest memory 1:1 and report what remains free.
pub fn arch_init_mm<H, M, T, const N: usize>(
    tables: &PageTables<'_, H, M, T>,
    info: &StartInfo,
    batch: &mut MmuBatch<N>,
) -> Result<BootFrames, MmError>
where
    H: Hypervisor + ?Sized,
    M: TableMemory + ?Sized,
    T: FrameTranslation,
{
    let layout = tables.layout();
    let mode = info.mode;

    let free_pfn = layout
        .virt_to_phys(info.pt_base)
        .pfn_up()
        .add(info.nr_pt_frames + BOOT_RESERVED_FRAMES);
    let max_pfn = Pfn::new(info.nr_pages);

    // Each leaf table left by the builder maps one table's worth of frames
    // from frame 0.
    let mapped = info.nr_pt_frames.saturating_sub(mode.boot_non_leaf_frames())
        * mode.entries_per_table() as u64;
    let start_pfn = Pfn::new(mapped);

    log::debug!("  free_pfn:     {}", free_pfn);
    log::debug!("  max_pfn:      {}", max_pfn);
    log::debug!("  mapped up to: {}", start_pfn);

    // New nodes must come from frames the builder already mapped, so they
    // can be protected before use.
    let mut nodes = LinearFrames::bounded(free_pfn, start_pfn);
    if start_pfn < max_pfn {
        let mut target = LinearFrames::new(start_pfn);
        tables.build_pagetable(
            layout.pfn_to_virt(start_pfn),
            layout.pfn_to_virt(max_pfn),
            &mut target,
            &mut nodes,
            batch,
        )?;
    }

    let frames = BootFrames {
        free_pfn: nodes.cursor(),
        max_pfn,
    };
    log::debug!(
        "MM: found and mapped {}..{} ({} free frames)",
        frames.free_pfn,
        frames.max_pfn,
        frames.free_frames()
    );
    Ok(frames)
}

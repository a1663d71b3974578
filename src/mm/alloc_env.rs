//! Frame Allocation Environments
//!
//! Policies that decide which guest frame backs each virtual page a build
//! maps. Every build takes two of them: one for the mapped pages, one for
//! any table nodes the walk has to create.
//!
//! - [`LinearFrames`]: consecutive frames from a counter (1:1 layouts)
//! - [`OnDemandFrames`]: fresh pages from the physical allocator
//! - any `FnMut(VirtAddr) -> Result<Option<Pfn>, MmError>` closure

use super::address::{DirectMapLayout, Pfn, VirtAddr};
use super::frame::PageAllocator;
use super::paging::MmError;

/// A frame allocation policy.
pub trait FrameAllocEnv {
    /// Frame to back the page at `virt`.
    ///
    /// `Ok(None)` leaves the page unmapped. For large-page builds the
    /// returned frame is the first 4 KiB frame of the large region.
    fn next_frame(&mut self, virt: VirtAddr) -> Result<Option<Pfn>, MmError>;
}

impl<F> FrameAllocEnv for F
where
    F: FnMut(VirtAddr) -> Result<Option<Pfn>, MmError>,
{
    fn next_frame(&mut self, virt: VirtAddr) -> Result<Option<Pfn>, MmError> {
        self(virt)
    }
}

/// Hands out frames linearly, `step` frames apart.
#[derive(Debug, Clone)]
pub struct LinearFrames {
    next: Pfn,
    step: u64,
    limit: Option<Pfn>,
}

impl LinearFrames {
    /// Start handing out frames at `start`, without bound.
    pub const fn new(start: Pfn) -> Self {
        Self { next: start, step: 1, limit: None }
    }

    /// Start at `start` and fail once `limit` is reached.
    pub const fn bounded(start: Pfn, limit: Pfn) -> Self {
        Self { next: start, step: 1, limit: Some(limit) }
    }

    /// Hand out every `step`th frame from `start`. With `step` set to the
    /// frames per large page this backs a large-page build 1:1.
    pub const fn strided(start: Pfn, step: u64) -> Self {
        Self { next: start, step, limit: None }
    }

    /// The frame the next call will hand out.
    pub const fn cursor(&self) -> Pfn {
        self.next
    }
}

impl FrameAllocEnv for LinearFrames {
    fn next_frame(&mut self, _virt: VirtAddr) -> Result<Option<Pfn>, MmError> {
        if self.limit.is_some_and(|limit| self.next >= limit) {
            return Err(MmError::OutOfFrames);
        }
        let pfn = self.next;
        self.next = pfn.add(self.step);
        Ok(Some(pfn))
    }
}

/// Backs each page with a fresh, already-mapped page from the physical
/// allocator.
///
/// The resulting mapping is not 1:1, so translating such addresses
/// requires a table walk.
pub struct OnDemandFrames<'a, A: PageAllocator + ?Sized> {
    allocator: &'a A,
    layout: DirectMapLayout,
    allocated: usize,
}

impl<'a, A: PageAllocator + ?Sized> OnDemandFrames<'a, A> {
    pub fn new(allocator: &'a A, layout: DirectMapLayout) -> Self {
        Self {
            allocator,
            layout,
            allocated: 0,
        }
    }

    /// Frames handed out so far.
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl<A: PageAllocator + ?Sized> FrameAllocEnv for OnDemandFrames<'_, A> {
    fn next_frame(&mut self, _virt: VirtAddr) -> Result<Option<Pfn>, MmError> {
        let page = self.allocator.allocate_pages(1).ok_or(MmError::OutOfFrames)?;
        self.allocated += 1;
        Ok(Some(self.layout.virt_to_pfn(page)))
    }
}

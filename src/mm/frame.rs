//! Physical Frame Allocator
//!
//! Hands out guest frames, returned as their direct-map virtual address,
//! from the free range the bootstrap reports (`free_pfn..max_pfn`).
//!
//! # Design
//! - Each bit in the bitmap represents one 4KB frame, counted from `free_pfn`
//! - Bit = 0: frame is free
//! - Bit = 1: frame is allocated
//!
//! # Safety Properties
//! - Double-free is detected and causes a panic
//! - The allocator is protected by a spinlock

use spin::Mutex;

use super::address::{DirectMapLayout, Pfn, VirtAddr};

/// Size of the frame bitmap in bytes.
/// 2048 bytes = 16384 frames = 64MB of guest memory past `free_pfn`.
const BITMAP_SIZE: usize = 2048;

/// Number of frames we can track.
const MAX_FRAMES: usize = BITMAP_SIZE * 8;

/// Source of already-mapped pages.
///
/// This is the physical allocator the rest of the kernel builds its heap
/// on; the page table code only asks it for single frames.
pub trait PageAllocator {
    /// Allocate `count` contiguous pages, returning their virtual address.
    fn allocate_pages(&self, count: usize) -> Option<VirtAddr>;

    /// Return pages previously handed out by `allocate_pages`.
    fn free_pages(&self, virt: VirtAddr, count: usize);
}

/// Bitmap allocator state.
pub struct FrameBitmap {
    /// Bitmap tracking allocated frames (1 = allocated, 0 = free).
    bitmap: [u8; BITMAP_SIZE],
    /// First frame under management.
    base: Pfn,
    /// Number of free frames remaining.
    free_count: usize,
    /// Total frames under management.
    total_frames: usize,
    layout: DirectMapLayout,
    /// Whether the allocator has been initialized.
    initialized: bool,
}

impl FrameBitmap {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_SIZE],
            base: Pfn::new(0),
            free_count: 0,
            total_frames: 0,
            layout: DirectMapLayout::new(0),
            initialized: false,
        }
    }

    /// Take over frames `free_pfn..max_pfn`, capped at `MAX_FRAMES`.
    pub fn init(&mut self, free_pfn: Pfn, max_pfn: Pfn, layout: DirectMapLayout) {
        if self.initialized {
            return;
        }

        if max_pfn <= free_pfn {
            panic!("Invalid frame range for frame allocator: {}..{}", free_pfn, max_pfn);
        }

        let frames = (max_pfn.as_u64() - free_pfn.as_u64()) as usize;
        self.base = free_pfn;
        self.total_frames = frames.min(MAX_FRAMES);
        self.free_count = self.total_frames;
        self.layout = layout;

        // Frames past the managed range stay marked allocated
        for frame in self.total_frames..MAX_FRAMES {
            self.set_bit(frame, true);
        }

        self.initialized = true;
        log::debug!(
            "frame allocator: {} frames from pfn {}",
            self.total_frames,
            self.base
        );
    }

    /// Set a bit in the bitmap.
    #[inline]
    fn set_bit(&mut self, frame: usize, allocated: bool) {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;

        if byte_idx >= BITMAP_SIZE {
            return;
        }

        if allocated {
            self.bitmap[byte_idx] |= 1 << bit_idx;
        } else {
            self.bitmap[byte_idx] &= !(1 << bit_idx);
        }
    }

    /// Check if a frame is allocated.
    #[inline]
    fn is_allocated(&self, frame: usize) -> bool {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;

        if byte_idx >= BITMAP_SIZE {
            return true; // Out of range = allocated
        }

        (self.bitmap[byte_idx] >> bit_idx) & 1 == 1
    }

    /// Allocate `count` contiguous frames.
    pub fn alloc(&mut self, count: usize) -> Option<Pfn> {
        if !self.initialized || count == 0 || self.free_count < count {
            return None;
        }

        // First fit over the bitmap
        let mut run = 0;
        for frame in 0..self.total_frames {
            if self.is_allocated(frame) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = frame + 1 - count;
                for f in first..=frame {
                    self.set_bit(f, true);
                }
                self.free_count -= count;
                return Some(self.base.add(first as u64));
            }
        }

        None
    }

    /// Free `count` frames starting at `pfn`.
    pub fn free(&mut self, pfn: Pfn, count: usize) {
        if !self.initialized {
            return;
        }

        if pfn < self.base {
            panic!("Attempted to free frame below managed range: {:?}", pfn);
        }

        let first = (pfn.as_u64() - self.base.as_u64()) as usize;
        if first + count > self.total_frames {
            panic!("Attempted to free frame outside managed range: {:?}", pfn);
        }

        for frame in first..first + count {
            if !self.is_allocated(frame) {
                panic!("Double free detected for frame: {:?}", self.base.add(frame as u64));
            }
            self.set_bit(frame, false);
        }
        self.free_count += count;
    }

    /// Get the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_count
    }
}

impl Default for FrameBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Spin-locked frame bitmap, shareable between the heap and the page
/// table code.
pub struct LockedFrameBitmap(Mutex<FrameBitmap>);

impl LockedFrameBitmap {
    pub const fn new() -> Self {
        Self(Mutex::new(FrameBitmap::new()))
    }

    /// Initialize with the free range reported by the bootstrap.
    pub fn init(&self, free_pfn: Pfn, max_pfn: Pfn, layout: DirectMapLayout) {
        self.0.lock().init(free_pfn, max_pfn, layout);
    }

    /// Get the number of free frames remaining.
    pub fn free_frames(&self) -> usize {
        self.0.lock().free_frames()
    }
}

impl Default for LockedFrameBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for LockedFrameBitmap {
    fn allocate_pages(&self, count: usize) -> Option<VirtAddr> {
        let mut inner = self.0.lock();
        let pfn = inner.alloc(count)?;
        Some(inner.layout.pfn_to_virt(pfn))
    }

    fn free_pages(&self, virt: VirtAddr, count: usize) {
        let mut inner = self.0.lock();
        let pfn = inner.layout.virt_to_pfn(virt);
        inner.free(pfn, count);
    }
}

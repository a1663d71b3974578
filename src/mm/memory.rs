//! Guest Access to Table Memory
//!
//! Table nodes are mapped read-only once pinned, but the guest still reads
//! them directly to walk the tree. The only direct write is zeroing a fresh
//! frame before it is protected.

use core::ptr;

use super::address::{DirectMapLayout, Pfn, PAGE_SIZE};
use super::paging::{PageTableEntry, PagingMode};

/// Read access to table nodes and write access to not-yet-protected frames.
pub trait TableMemory {
    /// Read entry `index` of the table node in frame `pfn`.
    fn read_entry(&self, pfn: Pfn, index: usize) -> PageTableEntry;

    /// Fill frame `pfn` with zeros. The frame must still be writable.
    fn zero_frame(&self, pfn: Pfn);
}

/// Table memory reached through the kernel's direct map.
#[derive(Debug, Clone, Copy)]
pub struct DirectMap {
    layout: DirectMapLayout,
    mode: PagingMode,
}

impl DirectMap {
    /// # Safety
    /// Every frame later passed to `read_entry` or `zero_frame` must be
    /// mapped at `layout.pfn_to_virt(pfn)`.
    pub const unsafe fn new(layout: DirectMapLayout, mode: PagingMode) -> Self {
        Self { layout, mode }
    }
}

impl TableMemory for DirectMap {
    fn read_entry(&self, pfn: Pfn, index: usize) -> PageTableEntry {
        debug_assert!(index < self.mode.entries_per_table());
        let base = self.layout.pfn_to_virt(pfn);
        // SAFETY: `new` requires the frame to be direct-mapped and the index
        // stays within one page for the mode's entry width.
        let raw = unsafe {
            match self.mode.entry_size() {
                4 => u64::from(ptr::read_volatile(base.as_ptr::<u32>().add(index))),
                _ => ptr::read_volatile(base.as_ptr::<u64>().add(index)),
            }
        };
        PageTableEntry::from_raw(raw)
    }

    fn zero_frame(&self, pfn: Pfn) {
        let base = self.layout.pfn_to_virt(pfn);
        // SAFETY: `new` requires the frame to be direct-mapped; the caller
        // only zeroes frames it has just been handed and are still writable.
        unsafe {
            ptr::write_bytes(base.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::PAGE_SHIFT;

    #[repr(C, align(4096))]
    struct Frames([u8; 2 * PAGE_SIZE]);

    fn frames_layout(frames: &mut Frames) -> DirectMapLayout {
        DirectMapLayout::new(frames.0.as_mut_ptr() as usize)
    }

    #[test]
    fn test_read_entry_honours_entry_width() {
        let mut frames = Frames([0; 2 * PAGE_SIZE]);
        frames.0[PAGE_SIZE + 8..PAGE_SIZE + 16].copy_from_slice(&0x1234_5003u64.to_le_bytes());
        let layout = frames_layout(&mut frames);

        // SAFETY: Both frames live in `frames`, mapped at the layout base.
        let wide = unsafe { DirectMap::new(layout, PagingMode::FourLevel) };
        assert_eq!(wide.read_entry(Pfn::new(1), 1).raw(), 0x1234_5003);

        // Four-byte entries: the same bytes are entries 2 and 3.
        let narrow = unsafe { DirectMap::new(layout, PagingMode::TwoLevel) };
        assert_eq!(narrow.read_entry(Pfn::new(1), 2).raw(), 0x1234_5003);
        assert_eq!(narrow.read_entry(Pfn::new(1), 3).raw(), 0);
    }

    #[test]
    fn test_zero_frame_clears_one_page_only() {
        let mut frames = Frames([0xAB; 2 * PAGE_SIZE]);
        let layout = frames_layout(&mut frames);
        let memory = unsafe { DirectMap::new(layout, PagingMode::FourLevel) };

        memory.zero_frame(Pfn::new(1));
        assert!(frames.0[PAGE_SIZE..].iter().all(|&b| b == 0));
        assert!(frames.0[..PAGE_SIZE].iter().all(|&b| b == 0xAB));
        assert_eq!(layout.virt_to_pfn(layout.base().add(1 << PAGE_SHIFT)), Pfn::new(1));
    }
}

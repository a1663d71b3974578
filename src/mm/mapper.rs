//! Page Table Mapper
//!
//! Walks, extends and fills the guest's page table tree. The tree lives in
//! frames the hypervisor has pinned; the guest reads it directly but every
//! write is a hypercall.
//!
//! # Security Properties
//! - A new table node is zeroed while still writable, then mapped read-only,
//!   then pinned, and only then linked into its parent. At no point is a
//!   frame both writable by the guest and reachable as a table node.
//! - Leaf updates are queued in a caller-owned batch and submitted in as few
//!   `mmu_update` calls as the batch capacity allows.
//! - Intermediate nodes are never reclaimed.

use super::address::{DirectMapLayout, MachineAddr, Mfn, Pfn, VirtAddr, PAGE_SIZE};
use super::alloc_env::FrameAllocEnv;
use super::batch::MmuBatch;
use super::memory::TableMemory;
use super::p2m::FrameTranslation;
use super::paging::{MmError, PageTableEntry, PagingMode, PteFlags, TableLevel};
use crate::hypervisor::{Hypervisor, MmuExtOp, MmuUpdate};

/// Stride of a mapping operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingSize {
    /// One 4 KiB page per leaf entry.
    Small,
    /// One large page per L2 entry.
    Large,
}

impl MappingSize {
    /// Bytes covered by one stride in `mode`.
    #[inline]
    pub const fn bytes(self, mode: PagingMode) -> usize {
        match self {
            Self::Small => PAGE_SIZE,
            Self::Large => mode.large_page_size(),
        }
    }

    /// Level holding the leaf entries.
    #[inline]
    pub const fn leaf_level(self) -> TableLevel {
        match self {
            Self::Small => TableLevel::L1,
            Self::Large => TableLevel::L2,
        }
    }
}

/// Where a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    /// The entry itself, present or not.
    pub entry: PageTableEntry,
    /// Level of the table holding it.
    pub level: TableLevel,
    /// Machine address of the entry.
    pub slot: MachineAddr,
}

impl LeafEntry {
    /// Whether the entry maps a large page.
    #[inline]
    pub const fn is_large(&self) -> bool {
        matches!(self.level, TableLevel::L2) && self.entry.is_large()
    }
}

/// The guest's page table tree and the collaborators needed to change it.
pub struct PageTables<'a, H: ?Sized, M: ?Sized, T> {
    hv: &'a H,
    memory: &'a M,
    p2m: T,
    mode: PagingMode,
    layout: DirectMapLayout,
    root: Pfn,
}

impl<'a, H, M, T> PageTables<'a, H, M, T>
where
    H: Hypervisor + ?Sized,
    M: TableMemory + ?Sized,
    T: FrameTranslation,
{
    /// Tree rooted at the table mapped at `root` in the direct map.
    pub fn new(
        hv: &'a H,
        memory: &'a M,
        p2m: T,
        mode: PagingMode,
        layout: DirectMapLayout,
        root: VirtAddr,
    ) -> Self {
        Self {
            hv,
            memory,
            p2m,
            mode,
            layout,
            root: layout.virt_to_pfn(root),
        }
    }

    #[inline]
    pub fn hypervisor(&self) -> &'a H {
        self.hv
    }

    #[inline]
    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    #[inline]
    pub fn layout(&self) -> DirectMapLayout {
        self.layout
    }

    #[inline]
    pub fn pfn_to_mfn(&self, pfn: Pfn) -> Mfn {
        self.p2m.pfn_to_mfn(pfn)
    }

    #[inline]
    pub fn mfn_to_pfn(&self, mfn: Mfn) -> Pfn {
        self.p2m.mfn_to_pfn(mfn)
    }

    /// Machine frame of the root table.
    #[inline]
    pub fn root_mfn(&self) -> Mfn {
        self.pfn_to_mfn(self.root)
    }

    /// Read entry `index` of the table in machine frame `table`.
    #[inline]
    fn read(&self, table: Mfn, index: usize) -> PageTableEntry {
        self.memory.read_entry(self.mfn_to_pfn(table), index)
    }

    /// Machine address of entry `index` of the table in machine frame `table`.
    #[inline]
    fn entry_slot(&self, table: Mfn, index: usize) -> MachineAddr {
        table.machine_addr().add((index * self.mode.entry_size()) as u64)
    }

    /// Walk from the root towards the leaf for `virt`.
    ///
    /// Stops early at a large-page entry. Returns `None` if an
    /// intermediate level is absent.
    pub fn walk(&self, virt: VirtAddr) -> Option<LeafEntry> {
        let mut table = self.root_mfn();
        let mut level = self.mode.root_level();
        loop {
            let index = self.mode.index(virt, level);
            let entry = self.read(table, index);
            let leaf = LeafEntry {
                entry,
                level,
                slot: self.entry_slot(table, index),
            };
            let below = match level.below() {
                Some(below) if !leaf.is_large() => below,
                _ => return Some(leaf),
            };
            if !entry.is_present() {
                return None;
            }
            table = entry.mfn();
            level = below;
        }
    }

    /// Frame number and raw leaf entry for `virt`, found by walking the
    /// tree. Works for addresses that are not 1:1 mapped.
    ///
    /// For a large page the frame is the one containing `virt`.
    pub fn walk_to_pfn(&self, virt: VirtAddr) -> Option<(Pfn, PageTableEntry)> {
        let leaf = self.walk(virt)?;
        let mut mfn = leaf.entry.mfn();
        if leaf.is_large() {
            let within = virt.as_usize() & (self.mode.large_page_size() - 1);
            mfn = Mfn::new(mfn.as_u64() + (within / PAGE_SIZE) as u64);
        }
        Some((self.mfn_to_pfn(mfn), leaf.entry))
    }

    /// Guest frame mapped at `virt`, if any. A present mapping of a machine
    /// frame outside the guest's P2M gives `None`.
    pub fn translate(&self, virt: VirtAddr) -> Option<Pfn> {
        self.walk_to_pfn(virt)
            .filter(|(pfn, entry)| entry.is_present() && pfn.is_valid())
            .map(|(pfn, _)| pfn)
    }

    /// Whether `virt` is mapped.
    pub fn validate(&self, virt: VirtAddr) -> bool {
        self.walk_to_pfn(virt)
            .is_some_and(|(_, entry)| entry.is_present())
    }

    /// Turn the fresh frame `pfn` into a table node at `level` and link it
    /// into slot `index` of the table in machine frame `parent`.
    ///
    /// `pfn` must be allocated, not referenced by any table, and mapped
    /// writable in the direct map by a 4 KiB leaf. A frame covered by a
    /// large-page mapping cannot be protected on its own and gives
    /// `NotMapped`; split the large page first.
    pub fn new_pt_frame(
        &self,
        pfn: Pfn,
        parent: Mfn,
        index: usize,
        level: TableLevel,
    ) -> Result<(), MmError> {
        log::trace!(
            "MM: allocating new L{} pt frame, pt_pfn={}, offset={:#x}",
            level.number(),
            pfn,
            index
        );

        // A node must never hold stale entries once linked, and this is the
        // last point at which the guest can still write it.
        self.memory.zero_frame(pfn);

        let prot = self.mode.node_protection(level)?;
        let mfn = self.pfn_to_mfn(pfn);

        let virt = self.layout.pfn_to_virt(pfn);
        let mapping = self
            .walk(virt)
            .filter(|leaf| leaf.level == TableLevel::L1 && leaf.entry.is_present())
            .ok_or(MmError::NotMapped(virt))?;
        let read_only = PageTableEntry::new(mfn, prot.entries.difference(PteFlags::RW));
        self.hv.mmu_update(&[MmuUpdate::normal(mapping.slot, read_only)])?;

        self.hv.mmuext_op(&[MmuExtOp::new(prot.pin, mfn)])?;

        let link = PageTableEntry::new(mfn, prot.link);
        self.hv
            .mmu_update(&[MmuUpdate::normal(self.entry_slot(parent, index), link)])?;
        Ok(())
    }

    /// Map `[start, end)` with 4 KiB pages.
    ///
    /// `target` supplies the frame for each page, `nodes` the frames for
    /// any table nodes that have to be created.
    pub fn build_pagetable<const N: usize>(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        target: &mut dyn FrameAllocEnv,
        nodes: &mut dyn FrameAllocEnv,
        batch: &mut MmuBatch<N>,
    ) -> Result<(), MmError> {
        self.build(start, end, MappingSize::Small, target, nodes, batch)
    }

    /// Map `[start, end)` with large pages.
    ///
    /// `target` hands out the first 4 KiB frame of each large page, so a
    /// linear target strides by [`PagingMode::frames_per_large_page`]. That
    /// frame's machine frame must be aligned to the large page size.
    pub fn build_pagetable_large<const N: usize>(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        target: &mut dyn FrameAllocEnv,
        nodes: &mut dyn FrameAllocEnv,
        batch: &mut MmuBatch<N>,
    ) -> Result<(), MmError> {
        self.build(start, end, MappingSize::Large, target, nodes, batch)
    }

    fn build<const N: usize>(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        size: MappingSize,
        target: &mut dyn FrameAllocEnv,
        nodes: &mut dyn FrameAllocEnv,
        batch: &mut MmuBatch<N>,
    ) -> Result<(), MmError> {
        let stride = self.check_range(start, end, size)?;
        let leaf_level = size.leaf_level();
        log::trace!("MM: mapping memory range {}..{} ({:?})", start, end, size);

        let mut virt = start;
        while virt < end {
            let mut table = self.root_mfn();
            let mut level = self.mode.root_level();
            while level > leaf_level {
                let Some(below) = level.below() else { break };
                let index = self.mode.index(virt, level);
                let mut entry = self.read(table, index);
                if !entry.is_present() {
                    let pfn = nodes.next_frame(virt)?.ok_or(MmError::OutOfFrames)?;
                    self.new_pt_frame(pfn, table, index, below)?;
                    entry = self.read(table, index);
                } else if entry.is_large() {
                    return Err(MmError::LargePageConflict(virt));
                }
                table = entry.mfn();
                level = below;
            }

            if let Some(pfn) = target.next_frame(virt)? {
                let entry = self.leaf_entry(self.pfn_to_mfn(pfn), size);
                let slot = self.entry_slot(table, self.mode.index(virt, leaf_level));
                batch.push(self.hv, MmuUpdate::normal(slot, entry))?;
            }
            virt = virt.add(stride);
        }

        batch.flush(self.hv)?;
        log::trace!("MM: page tables setup");
        Ok(())
    }

    fn leaf_entry(&self, mfn: Mfn, size: MappingSize) -> PageTableEntry {
        let prot = self.mode.leaf_prot();
        match size {
            MappingSize::Small => PageTableEntry::new(mfn, prot),
            MappingSize::Large => PageTableEntry::new(mfn, prot.union(PteFlags::PSE)),
        }
    }

    /// Stride for `size`, after checking both bounds are aligned to it.
    pub(super) fn check_range(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        size: MappingSize,
    ) -> Result<usize, MmError> {
        let stride = size.bytes(self.mode);
        for bound in [start, end] {
            if !bound.is_aligned_to(stride) {
                return Err(MmError::Misaligned(bound));
            }
        }
        Ok(stride)
    }
}

//! x86 Paravirtualized Page Table Types
//!
//! Entry layout, paging modes and error type shared by the table walker,
//! builder and demolisher.
//!
//! # Page Table Structure
//! - Two-level (32-bit): L2 (1024 entries, 4 MiB each), L1 (1024 entries, 4 KiB each)
//! - Three-level (32-bit PAE): L3 (4 entries, 1 GiB each), L2, L1 (512 entries)
//! - Four-level (64-bit): L4, L3, L2, L1 (512 entries each)
//!
//! # Safety Properties
//! - Entries hold *machine* frame numbers; the guest only reads them
//! - Every table node linked into the tree is pinned and mapped read-only,
//!   so writes always go through the hypervisor

use core::fmt;

use super::address::{MachineAddr, Mfn, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use crate::hypervisor::{HypercallError, MmuExtCmd};

bitflags::bitflags! {
    /// Protection and attribute bits of an x86 page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Entry is present.
        const PRESENT  = 1 << 0;
        /// Writable.
        const RW       = 1 << 1;
        /// Accessible from ring 3 (the 64-bit PV kernel runs there too).
        const USER     = 1 << 2;
        /// Write-through caching.
        const PWT      = 1 << 3;
        /// Caching disabled.
        const PCD      = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED = 1 << 5;
        /// Set by the CPU on write.
        const DIRTY    = 1 << 6;
        /// Page size: the L2 entry maps a large page.
        const PSE      = 1 << 7;
        /// Global mapping.
        const GLOBAL   = 1 << 8;
    }
}

/// A table level, counted from the leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TableLevel {
    /// Leaf table: entries map 4 KiB pages.
    L1 = 1,
    /// Entries reference L1 tables or map large pages.
    L2 = 2,
    L3 = 3,
    L4 = 4,
}

impl TableLevel {
    #[inline]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// The level directly below this one, if any.
    #[inline]
    pub const fn below(self) -> Option<Self> {
        match self {
            Self::L1 => None,
            Self::L2 => Some(Self::L1),
            Self::L3 => Some(Self::L2),
            Self::L4 => Some(Self::L3),
        }
    }

    /// The level directly above this one, if any.
    #[inline]
    pub const fn above(self) -> Option<Self> {
        match self {
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => Some(Self::L4),
            Self::L4 => None,
        }
    }
}

/// A single page table entry.
///
/// Stored as 64 bits regardless of mode; the two-level mode only ever
/// uses the low 32.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Address mask for page table entries (bits [51:12]).
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// An absent entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create from a raw entry value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Entry referencing the machine frame `mfn`.
    #[inline]
    pub const fn new(mfn: Mfn, flags: PteFlags) -> Self {
        Self::at(mfn.machine_addr(), flags)
    }

    /// Entry referencing the machine address `addr`.
    #[inline]
    pub const fn at(addr: MachineAddr, flags: PteFlags) -> Self {
        Self((addr.as_u64() & Self::ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & !Self::ADDR_MASK)
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & PteFlags::RW.bits() != 0
    }

    #[inline]
    pub const fn is_large(self) -> bool {
        self.0 & PteFlags::PSE.bits() != 0
    }

    /// Machine address the entry points at.
    #[inline]
    pub const fn machine_addr(self) -> MachineAddr {
        MachineAddr::new(self.0 & Self::ADDR_MASK)
    }

    /// Machine frame the entry points at.
    #[inline]
    pub const fn mfn(self) -> Mfn {
        Mfn::new((self.0 & Self::ADDR_MASK) >> PAGE_SHIFT)
    }

    /// The same entry with `flags` cleared.
    #[inline]
    pub const fn without(self, flags: PteFlags) -> Self {
        Self(self.0 & !flags.bits())
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_present() {
            write!(f, "PTE(mfn={}, flags={:?})", self.mfn(), self.flags())
        } else {
            write!(f, "PTE({:#x}, not present)", self.0)
        }
    }
}

/// How a table node must be protected, linked and pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeProtection {
    /// Protection for entries *within* the node (and for its own mapping).
    pub entries: PteFlags,
    /// Protection of the parent entry that links the node.
    pub link: PteFlags,
    /// Pin command that tells the hypervisor the node's level.
    pub pin: MmuExtCmd,
}

/// Paging mode of the guest, fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// 32-bit, two levels of 1024 four-byte entries.
    TwoLevel,
    /// 32-bit with physical address extension.
    ThreeLevelPae,
    /// 64-bit, four levels.
    FourLevel,
}

impl PagingMode {
    /// Level of the root table.
    #[inline]
    pub const fn root_level(self) -> TableLevel {
        match self {
            Self::TwoLevel => TableLevel::L2,
            Self::ThreeLevelPae => TableLevel::L3,
            Self::FourLevel => TableLevel::L4,
        }
    }

    /// Number of levels in the tree.
    #[inline]
    pub const fn depth(self) -> u8 {
        self.root_level().number()
    }

    /// Entries in a (non-root PAE) table node.
    #[inline]
    pub const fn entries_per_table(self) -> usize {
        match self {
            Self::TwoLevel => 1024,
            Self::ThreeLevelPae | Self::FourLevel => 512,
        }
    }

    /// Entries in a table at `level`.
    #[inline]
    pub const fn entries_at(self, level: TableLevel) -> usize {
        match (self, level) {
            (Self::ThreeLevelPae, TableLevel::L3) => 4,
            _ => self.entries_per_table(),
        }
    }

    /// Size of one entry in bytes.
    #[inline]
    pub const fn entry_size(self) -> usize {
        match self {
            Self::TwoLevel => 4,
            Self::ThreeLevelPae | Self::FourLevel => 8,
        }
    }

    /// Shift of the virtual address bits that index a table at `level`.
    #[inline]
    pub const fn shift(self, level: TableLevel) -> usize {
        match self {
            Self::TwoLevel => PAGE_SHIFT + 10 * (level.number() as usize - 1),
            Self::ThreeLevelPae | Self::FourLevel => PAGE_SHIFT + 9 * (level.number() as usize - 1),
        }
    }

    /// Index of `virt` in a table at `level`.
    #[inline]
    pub const fn index(self, virt: VirtAddr, level: TableLevel) -> usize {
        ((virt.as_u64() >> self.shift(level)) as usize) & (self.entries_at(level) - 1)
    }

    /// Size of the region a large-page entry maps.
    #[inline]
    pub const fn large_page_size(self) -> usize {
        1 << self.shift(TableLevel::L2)
    }

    /// Number of 4 KiB frames behind one large-page entry.
    #[inline]
    pub const fn frames_per_large_page(self) -> u64 {
        (self.large_page_size() / PAGE_SIZE) as u64
    }

    /// Protection bits used for entries of a table at `level`.
    ///
    /// The 64-bit kernel runs in ring 3, so its leaf entries carry `USER`.
    pub const fn prot(self, level: TableLevel) -> PteFlags {
        let leaf = PteFlags::PRESENT.union(PteFlags::RW).union(PteFlags::ACCESSED);
        let upper = leaf.union(PteFlags::DIRTY).union(PteFlags::USER);
        match (self, level) {
            (Self::FourLevel, TableLevel::L1) => leaf.union(PteFlags::USER),
            (_, TableLevel::L1) => leaf,
            (Self::ThreeLevelPae, TableLevel::L3) => PteFlags::PRESENT,
            _ => upper,
        }
    }

    /// Protection of leaf mappings.
    #[inline]
    pub const fn leaf_prot(self) -> PteFlags {
        self.prot(TableLevel::L1)
    }

    /// Protection, link bits and pin command for a new node at `level`.
    ///
    /// Only levels strictly below the root can be materialized; the root
    /// itself comes from the domain builder.
    pub fn node_protection(self, level: TableLevel) -> Result<NodeProtection, MmError> {
        let pin = match level {
            TableLevel::L1 => MmuExtCmd::PinL1Table,
            TableLevel::L2 => MmuExtCmd::PinL2Table,
            TableLevel::L3 => MmuExtCmd::PinL3Table,
            TableLevel::L4 => return Err(MmError::UnsupportedLevel(level.number())),
        };
        let parent = match level.above() {
            Some(parent) if parent <= self.root_level() => parent,
            _ => return Err(MmError::UnsupportedLevel(level.number())),
        };
        Ok(NodeProtection {
            entries: self.prot(level),
            link: self.prot(parent),
            pin,
        })
    }

    /// Table frames the domain builder always provides besides L1 tables.
    ///
    /// What remains of `nr_pt_frames` after these are L1 tables, each
    /// mapping `entries_per_table()` frames starting at frame 0.
    #[inline]
    pub const fn boot_non_leaf_frames(self) -> u64 {
        match self {
            Self::TwoLevel => 1,
            Self::ThreeLevelPae | Self::FourLevel => 3,
        }
    }
}

/// Error type for page table operations.
///
/// None of these are recoverable for the guest; they travel up to the
/// fault handler, which terminates the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// A table node was requested at a level the paging mode lacks.
    UnsupportedLevel(u8),
    /// The hypervisor rejected a request.
    Hypercall(HypercallError),
    /// A frame allocation environment ran dry.
    OutOfFrames,
    /// A frame that must become a table node has no mapping to protect.
    NotMapped(VirtAddr),
    /// A small-page walk ran into an existing large-page mapping.
    LargePageConflict(VirtAddr),
    /// A range bound is not aligned to the stride.
    Misaligned(VirtAddr),
}

impl From<HypercallError> for MmError {
    fn from(err: HypercallError) -> Self {
        Self::Hypercall(err)
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedLevel(level) => {
                write!(f, "new page table frame requested at invalid level {}", level)
            }
            Self::Hypercall(err) => write!(f, "{}", err),
            Self::OutOfFrames => write!(f, "failed to allocate page frame"),
            Self::NotMapped(virt) => write!(f, "no mapping for page table frame at {}", virt),
            Self::LargePageConflict(virt) => {
                write!(f, "large page already mapped at {}", virt)
            }
            Self::Misaligned(virt) => write!(f, "range bound {} not aligned to stride", virt),
        }
    }
}

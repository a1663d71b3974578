//! Address and Frame Number Types
//!
//! Type-safe wrappers that keep the three address spaces a paravirtualized
//! guest deals with apart:
//! - `VirtAddr`: guest virtual addresses
//! - `PhysAddr` / `Pfn`: guest "pseudo-physical" memory, as the guest numbers it
//! - `Mfn` / `MachineAddr`: machine memory, as the hypervisor numbers it
//!
//! # Safety Properties
//! - A `Pfn` cannot be used where an `Mfn` is expected (and vice versa);
//!   the only conversion is through the translation tables in `p2m`
//! - Machine addresses are never dereferenced by the guest, they only
//!   travel inside hypercall records

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// A guest virtual address.
///
/// Canonicalized the x86_64 way (sign-extended from bit 47). Addresses
/// below 4 GiB, which is all the 32-bit paging modes can express, are
/// left untouched by canonicalization.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a new virtual address in canonical form.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(Self::make_canonical(addr))
    }

    /// Create a virtual address without canonicalization.
    #[inline]
    pub const fn new_unchecked(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    const fn make_canonical(addr: usize) -> usize {
        let addr = addr as u64;
        let bit47 = (addr >> 47) & 1;
        let canonical = if bit47 == 1 {
            addr | 0xFFFF_0000_0000_0000
        } else {
            addr & 0x0000_FFFF_FFFF_FFFF
        };
        canonical as usize
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Get the raw address as u64 (for hypercall arguments).
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Check if the address is aligned to `align` bytes (a power of two).
    #[inline]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.is_aligned_to(PAGE_SIZE)
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self::new(self.0 & !PAGE_MASK)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self::new(self.0.wrapping_add(offset))
    }

    /// Convert to a raw pointer.
    ///
    /// # Safety
    /// The caller must ensure the address is valid and properly mapped.
    #[inline]
    pub const unsafe fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Convert to a mutable raw pointer.
    ///
    /// # Safety
    /// The caller must ensure the address is valid, properly mapped,
    /// and that mutable access is safe.
    #[inline]
    pub const unsafe fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A guest pseudo-physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Frame number of the page containing this address.
    #[inline]
    pub const fn pfn(self) -> Pfn {
        Pfn::new(self.0 >> PAGE_SHIFT)
    }

    /// Frame number of the first page at or above this address.
    #[inline]
    pub const fn pfn_up(self) -> Pfn {
        Pfn::new((self.0 + PAGE_MASK as u64) >> PAGE_SHIFT)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#018x})", self.0)
    }
}

/// A guest page frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pfn(u64);

impl Pfn {
    /// Sentinel the translation tables use for "no such frame".
    pub const INVALID: Self = Self(u64::MAX);

    #[inline]
    pub const fn new(pfn: u64) -> Self {
        Self(pfn)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// The guest physical address of the start of this frame.
    #[inline]
    pub const fn phys_addr(self) -> PhysAddr {
        PhysAddr::new(self.0 << PAGE_SHIFT)
    }

    /// The frame `count` frames after this one.
    #[inline]
    pub const fn add(self, count: u64) -> Self {
        Self(self.0 + count)
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A machine (hypervisor) frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Mfn(u64);

impl Mfn {
    /// Sentinel the translation tables use for "no such frame".
    pub const INVALID: Self = Self(u64::MAX);

    #[inline]
    pub const fn new(mfn: u64) -> Self {
        Self(mfn)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Machine address of the start of this frame.
    #[inline]
    pub const fn machine_addr(self) -> MachineAddr {
        MachineAddr(self.0 << PAGE_SHIFT)
    }
}

impl fmt::Debug for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mfn({:#x})", self.0)
    }
}

impl fmt::Display for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A byte address in machine memory.
///
/// Used as the target of MMU-update records: the hypervisor locates the
/// table entry to rewrite by its machine address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MachineAddr(u64);

impl MachineAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Frame containing this address.
    #[inline]
    pub const fn mfn(self) -> Mfn {
        Mfn(self.0 >> PAGE_SHIFT)
    }

    /// Offset of this address within its frame.
    #[inline]
    pub const fn frame_offset(self) -> u64 {
        self.0 & PAGE_MASK as u64
    }
}

impl fmt::Debug for MachineAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineAddr({:#018x})", self.0)
    }
}

/// The region where guest pseudo-physical memory is mapped 1:1.
///
/// The domain builder maps the first frames of the guest at `base`; the
/// bootstrap extends that mapping to cover every frame the guest owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMapLayout {
    base: usize,
}

impl DirectMapLayout {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    #[inline]
    pub const fn base(self) -> VirtAddr {
        VirtAddr::new(self.base)
    }

    /// Virtual address at which `pfn` is mapped in the direct map.
    #[inline]
    pub const fn pfn_to_virt(self, pfn: Pfn) -> VirtAddr {
        VirtAddr::new(self.base + ((pfn.as_u64() as usize) << PAGE_SHIFT))
    }

    /// Frame number of a direct-mapped virtual address.
    #[inline]
    pub const fn virt_to_pfn(self, virt: VirtAddr) -> Pfn {
        Pfn::new(((virt.as_usize() - self.base) >> PAGE_SHIFT) as u64)
    }

    /// Guest physical address of a direct-mapped virtual address.
    #[inline]
    pub const fn virt_to_phys(self, virt: VirtAddr) -> PhysAddr {
        PhysAddr::new((virt.as_usize() - self.base) as u64)
    }
}

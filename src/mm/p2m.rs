//! Pseudo-physical ↔ Machine Frame Translation
//!
//! The hypervisor publishes two tables:
//! - P2M: indexed by guest frame, gives the machine frame backing it
//! - M2P: indexed by machine frame, gives the guest frame it backs
//!
//! Both are built outside the guest's page table code and only read here.

use super::address::{Mfn, Pfn};

/// Translation between guest and machine frame numbers.
///
/// Both directions are total: input outside the tables yields the
/// tables' own sentinel (`Mfn::INVALID` / `Pfn::INVALID`).
pub trait FrameTranslation {
    fn pfn_to_mfn(&self, pfn: Pfn) -> Mfn;
    fn mfn_to_pfn(&self, mfn: Mfn) -> Pfn;
}

/// Translation backed by the hypervisor-provided lookup arrays.
#[derive(Debug, Clone, Copy)]
pub struct P2mTables<'a> {
    p2m: &'a [u64],
    m2p: &'a [u64],
}

impl<'a> P2mTables<'a> {
    /// Wrap the P2M list handed over at boot and the machine-to-phys table.
    pub const fn new(p2m: &'a [u64], m2p: &'a [u64]) -> Self {
        Self { p2m, m2p }
    }

    /// Number of guest frames the P2M list covers.
    pub fn nr_pages(&self) -> u64 {
        self.p2m.len() as u64
    }
}

impl FrameTranslation for P2mTables<'_> {
    #[inline]
    fn pfn_to_mfn(&self, pfn: Pfn) -> Mfn {
        usize::try_from(pfn.as_u64())
            .ok()
            .and_then(|i| self.p2m.get(i))
            .map_or(Mfn::INVALID, |&mfn| Mfn::new(mfn))
    }

    #[inline]
    fn mfn_to_pfn(&self, mfn: Mfn) -> Pfn {
        usize::try_from(mfn.as_u64())
            .ok()
            .and_then(|i| self.m2p.get(i))
            .map_or(Pfn::INVALID, |&pfn| Pfn::new(pfn))
    }
}

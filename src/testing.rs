//! Simulated Machine for Host Tests
//!
//! A small model of a PV domain: machine frames, the P2M/M2P pair, the
//! domain builder's initial tables and the hypervisor's checks on table
//! updates. Updates the real hypervisor would refuse are refused here too:
//! - writes to frames that are not pinned tables
//! - writable mappings of table frames
//! - links to frames that are not tables of the level below
//! - pinning frames that are mapped writable or were never initialised

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};

use crate::hypervisor::{
    numbers, Hypercall, HypercallError, Hypervisor, MmuExtCmd, MmuExtOp, MmuUpdate,
    MulticallEntry, UvmFlags,
};
use crate::mm::address::{DirectMapLayout, MachineAddr, Mfn, Pfn, VirtAddr, PAGE_SIZE};
use crate::mm::boot::StartInfo;
use crate::mm::mapper::PageTables;
use crate::mm::memory::TableMemory;
use crate::mm::p2m::P2mTables;
use crate::mm::paging::{PageTableEntry, PagingMode, PteFlags, TableLevel};

/// Guest frames backed by the simulated machine.
pub(crate) const SIM_FRAMES: u64 = 8192;

/// Frame holding the root table.
pub(crate) const PT_BASE_PFN: u64 = 4;

/// Machine frames sit at a fixed offset from guest frames, so mixing the
/// two up never goes unnoticed.
const MFN_OFFSET: u64 = 0x800;

/// What an uninitialised frame reads as. Not present, never zero.
const GARBAGE: u64 = 0xDEAD_0000_0000_0000;

const EPERM: i64 = -1;
const EIO: i64 = -5;
const EINVAL: i64 = -22;
const ENOSYS: i64 = -38;

/// Slots kept per frame, enough for any mode.
const SLOTS: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SimStats {
    pub mmu_update_calls: usize,
    pub mmu_updates: usize,
    pub pins: usize,
    pub multicalls: usize,
    pub va_updates: usize,
    pub invalidations: usize,
}

/// Guest-visible side effects, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Zero(Pfn),
    Update { slot: MachineAddr, entry: PageTableEntry },
    Pin { cmd: MmuExtCmd, mfn: Mfn },
    VaUpdate { virt: VirtAddr, entry: PageTableEntry, flags: UvmFlags },
}

#[derive(Default)]
struct State {
    frames: HashMap<u64, Vec<u64>>,
    tables: HashMap<u64, TableLevel>,
    stats: SimStats,
    events: Vec<Event>,
}

pub(crate) struct SimMachine {
    mode: PagingMode,
    layout: DirectMapLayout,
    p2m: Vec<u64>,
    m2p: Vec<u64>,
    nr_pt_frames: u64,
    nr_pages: u64,
    state: RefCell<State>,
    fail_next: Cell<bool>,
}

impl SimMachine {
    /// Domain as the domain builder leaves it: the root at `PT_BASE_PFN`,
    /// the non-leaf frames after it, then `l1_frames` leaf tables mapping
    /// guest frames from 0 upwards. Table frames are mapped read-only.
    pub fn boot(mode: PagingMode, l1_frames: u64) -> Self {
        let p2m = (0..SIM_FRAMES).map(|pfn| pfn + MFN_OFFSET).collect();
        let mut m2p = vec![Pfn::INVALID.as_u64(); (SIM_FRAMES + MFN_OFFSET) as usize];
        for pfn in 0..SIM_FRAMES {
            m2p[(pfn + MFN_OFFSET) as usize] = pfn;
        }

        let non_leaf = mode.boot_non_leaf_frames();
        let sim = Self {
            mode,
            layout: DirectMapLayout::new(0),
            p2m,
            m2p,
            nr_pt_frames: non_leaf + l1_frames,
            nr_pages: SIM_FRAMES,
            state: RefCell::new(State::default()),
            fail_next: Cell::new(false),
        };

        let mut state = State::default();
        let mut next = PT_BASE_PFN;
        let mut level = mode.root_level();
        let mut parent: Option<(u64, TableLevel)> = None;
        // One chain of non-leaf tables down to L2, all at index 0.
        loop {
            let mfn = sim.mfn_of(next).as_u64();
            state.frames.insert(mfn, vec![0; SLOTS]);
            state.tables.insert(mfn, level);
            if let Some((parent_mfn, parent_level)) = parent {
                state.frames.get_mut(&parent_mfn).unwrap()[0] =
                    PageTableEntry::new(Mfn::new(mfn), mode.prot(parent_level)).raw();
            }
            next += 1;
            if level == TableLevel::L2 {
                break;
            }
            parent = Some((mfn, level));
            level = level.below().unwrap();
        }
        let l2 = sim.mfn_of(next - 1).as_u64();
        // Padding up to the builder's fixed count of non-leaf frames.
        while next < PT_BASE_PFN + non_leaf {
            state.frames.insert(sim.mfn_of(next).as_u64(), vec![0; SLOTS]);
            next += 1;
        }

        let pt_end = PT_BASE_PFN + sim.nr_pt_frames;
        let per_table = mode.entries_per_table() as u64;
        for i in 0..l1_frames {
            let l1 = sim.mfn_of(next + i).as_u64();
            let mut entries = vec![0; SLOTS];
            for (j, slot) in entries.iter_mut().take(per_table as usize).enumerate() {
                let pfn = i * per_table + j as u64;
                let mut prot = mode.leaf_prot();
                if (PT_BASE_PFN..pt_end).contains(&pfn) {
                    prot.remove(PteFlags::RW);
                }
                *slot = PageTableEntry::new(sim.mfn_of(pfn), prot).raw();
            }
            state.frames.insert(l1, entries);
            state.tables.insert(l1, TableLevel::L1);
            state.frames.get_mut(&l2).unwrap()[i as usize] =
                PageTableEntry::new(Mfn::new(l1), mode.prot(TableLevel::L2)).raw();
        }

        *sim.state.borrow_mut() = state;
        sim
    }

    /// Report `nr_pages` frames of guest memory in the start info.
    pub fn with_nr_pages(mut self, nr_pages: u64) -> Self {
        assert!(nr_pages <= SIM_FRAMES);
        self.nr_pages = nr_pages;
        self
    }

    pub fn four_level() -> Self {
        Self::boot(PagingMode::FourLevel, 1)
    }

    pub fn pae() -> Self {
        Self::boot(PagingMode::ThreeLevelPae, 1)
    }

    pub fn two_level() -> Self {
        Self::boot(PagingMode::TwoLevel, 2)
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    pub fn layout(&self) -> DirectMapLayout {
        self.layout
    }

    pub fn mfn_of(&self, pfn: u64) -> Mfn {
        Mfn::new(self.p2m[pfn as usize])
    }

    pub fn translation(&self) -> P2mTables<'_> {
        P2mTables::new(&self.p2m, &self.m2p)
    }

    pub fn start_info(&self) -> StartInfo {
        StartInfo {
            pt_base: self.layout.pfn_to_virt(Pfn::new(PT_BASE_PFN)),
            nr_pt_frames: self.nr_pt_frames,
            nr_pages: self.nr_pages,
            mode: self.mode,
        }
    }

    /// The domain's tables, seen through the simulated machine.
    pub fn page_tables(&self) -> PageTables<'_, Self, Self, P2mTables<'_>> {
        let info = self.start_info();
        PageTables::new(self, self, self.translation(), self.mode, self.layout, info.pt_base)
    }

    pub fn stats(&self) -> SimStats {
        self.state.borrow().stats
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    /// Make the next hypercall of any kind fail without effect.
    pub fn fail_next_call(&self) {
        self.fail_next.set(true);
    }

    pub fn table_count(&self) -> usize {
        self.state.borrow().tables.len()
    }

    pub fn table_level(&self, mfn: Mfn) -> Option<TableLevel> {
        self.state.borrow().tables.get(&mfn.as_u64()).copied()
    }

    /// Contents of every initialised frame.
    pub fn snapshot(&self) -> BTreeMap<u64, Vec<u64>> {
        self.state
            .borrow()
            .frames
            .iter()
            .map(|(&mfn, entries)| (mfn, entries.clone()))
            .collect()
    }

    /// Machine address of the entry that maps `virt`. Panics if the walk
    /// does not reach a leaf slot.
    pub fn leaf_slot(&self, virt: VirtAddr) -> MachineAddr {
        let state = self.state.borrow();
        let (table, _, index) = self.locate(&state, virt).expect("no leaf slot");
        Mfn::new(table)
            .machine_addr()
            .add((index * self.mode.entry_size()) as u64)
    }

    /// Leaf entry that maps `virt`, if the tables reach that far.
    pub fn entry_for(&self, virt: VirtAddr) -> Option<PageTableEntry> {
        let state = self.state.borrow();
        let (table, _, index) = self.locate(&state, virt).ok()?;
        Some(PageTableEntry::from_raw(state.frames[&table][index]))
    }

    fn take_failure(&self, call: Hypercall) -> Result<(), HypercallError> {
        if self.fail_next.replace(false) {
            return Err(HypercallError::new(call, EIO));
        }
        Ok(())
    }

    /// Table, level and index of the leaf slot for `virt`.
    fn locate(&self, state: &State, virt: VirtAddr) -> Result<(u64, TableLevel, usize), i64> {
        let mut table = self.mfn_of(PT_BASE_PFN).as_u64();
        let mut level = self.mode.root_level();
        loop {
            let index = self.mode.index(virt, level);
            let Some(below) = level.below() else {
                return Ok((table, level, index));
            };
            let entry = PageTableEntry::from_raw(state.frames[&table][index]);
            if level == TableLevel::L2 && entry.is_present() && entry.is_large() {
                return Ok((table, level, index));
            }
            if !entry.is_present() {
                return Err(EINVAL);
            }
            table = entry.mfn().as_u64();
            level = below;
        }
    }

    /// Frames `entry` maps writable, if it is a leaf at `level`.
    fn writable_range(&self, entry: PageTableEntry, level: TableLevel) -> Option<(u64, u64)> {
        if !entry.is_present() || !entry.is_writable() {
            return None;
        }
        match level {
            TableLevel::L1 => Some((entry.mfn().as_u64(), 1)),
            TableLevel::L2 if entry.is_large() => {
                Some((entry.mfn().as_u64(), (self.mode.large_page_size() / PAGE_SIZE) as u64))
            }
            _ => None,
        }
    }

    fn check_entry(&self, state: &State, entry: PageTableEntry, level: TableLevel) -> Result<(), i64> {
        if !entry.is_present() {
            return Ok(());
        }
        if let Some((first, count)) = self.writable_range(entry, level) {
            if state.tables.keys().any(|&t| t >= first && t < first + count) {
                return Err(EPERM);
            }
            return Ok(());
        }
        if level == TableLevel::L1 || (level == TableLevel::L2 && entry.is_large()) {
            return Ok(());
        }
        match state.tables.get(&entry.mfn().as_u64()) {
            Some(&child) if Some(child) == level.below() => Ok(()),
            _ => Err(EINVAL),
        }
    }

    fn write_slot(&self, state: &mut State, slot: MachineAddr, entry: PageTableEntry) -> Result<(), i64> {
        let table = slot.mfn().as_u64();
        let level = *state.tables.get(&table).ok_or(EINVAL)?;
        let index = slot.frame_offset() as usize / self.mode.entry_size();
        if index >= self.mode.entries_at(level) {
            return Err(EINVAL);
        }
        self.check_entry(state, entry, level)?;
        state.frames.get_mut(&table).ok_or(EINVAL)?[index] = entry.raw();
        Ok(())
    }

    fn pin(&self, state: &mut State, op: &MmuExtOp) -> Result<(), i64> {
        let cmd = op.command().ok_or(ENOSYS)?;
        let level = match cmd {
            MmuExtCmd::PinL1Table => TableLevel::L1,
            MmuExtCmd::PinL2Table => TableLevel::L2,
            MmuExtCmd::PinL3Table => TableLevel::L3,
            MmuExtCmd::PinL4Table => TableLevel::L4,
        };
        let mfn = op.mfn().as_u64();
        if state.tables.contains_key(&mfn) {
            return Err(EINVAL);
        }
        let contents = state.frames.get(&mfn).ok_or(EINVAL)?;
        for &raw in contents.iter().take(self.mode.entries_at(level)) {
            self.check_entry(state, PageTableEntry::from_raw(raw), level)?;
        }
        let mapped_writable = state.tables.iter().any(|(table, &table_level)| {
            state.frames[table].iter().any(|&raw| {
                self.writable_range(PageTableEntry::from_raw(raw), table_level)
                    .is_some_and(|(first, count)| mfn >= first && mfn < first + count)
            })
        });
        if mapped_writable {
            return Err(EPERM);
        }
        state.tables.insert(mfn, level);
        state.stats.pins += 1;
        state.events.push(Event::Pin { cmd, mfn: Mfn::new(mfn) });
        Ok(())
    }

    fn update_va(
        &self,
        state: &mut State,
        virt: VirtAddr,
        entry: PageTableEntry,
        flags: UvmFlags,
    ) -> Result<(), i64> {
        let (table, _, index) = self.locate(state, virt)?;
        let slot = Mfn::new(table)
            .machine_addr()
            .add((index * self.mode.entry_size()) as u64);
        self.write_slot(state, slot, entry)?;
        state.stats.va_updates += 1;
        if flags.intersects(UvmFlags::INVLPG | UvmFlags::TLB_FLUSH) {
            state.stats.invalidations += 1;
        }
        state.events.push(Event::VaUpdate { virt, entry, flags });
        Ok(())
    }
}

impl Hypervisor for SimMachine {
    fn mmu_update(&self, updates: &[MmuUpdate]) -> Result<(), HypercallError> {
        self.take_failure(Hypercall::MmuUpdate)?;
        let mut state = self.state.borrow_mut();
        state.stats.mmu_update_calls += 1;
        for update in updates {
            self.write_slot(&mut state, update.slot(), update.entry())
                .map_err(|code| HypercallError::new(Hypercall::MmuUpdate, code))?;
            state.stats.mmu_updates += 1;
            state.events.push(Event::Update {
                slot: update.slot(),
                entry: update.entry(),
            });
        }
        Ok(())
    }

    fn mmuext_op(&self, ops: &[MmuExtOp]) -> Result<(), HypercallError> {
        self.take_failure(Hypercall::MmuextOp)?;
        let mut state = self.state.borrow_mut();
        for op in ops {
            self.pin(&mut state, op)
                .map_err(|code| HypercallError::new(Hypercall::MmuextOp, code))?;
        }
        Ok(())
    }

    fn update_va_mapping(
        &self,
        virt: VirtAddr,
        entry: PageTableEntry,
        flags: UvmFlags,
    ) -> Result<(), HypercallError> {
        self.take_failure(Hypercall::UpdateVaMapping)?;
        let mut state = self.state.borrow_mut();
        self.update_va(&mut state, virt, entry, flags)
            .map_err(|code| HypercallError::new(Hypercall::UpdateVaMapping, code))
    }

    fn multicall(&self, calls: &mut [MulticallEntry]) -> Result<(), HypercallError> {
        self.take_failure(Hypercall::Multicall)?;
        let mut state = self.state.borrow_mut();
        state.stats.multicalls += 1;
        let mut failure = None;
        for call in calls.iter_mut() {
            let result = if call.op == numbers::UPDATE_VA_MAPPING {
                self.update_va(
                    &mut state,
                    VirtAddr::new(call.args[0] as usize),
                    PageTableEntry::from_raw(call.args[1]),
                    UvmFlags::from_bits_truncate(call.args[2]),
                )
            } else {
                Err(ENOSYS)
            };
            call.result = result.err().unwrap_or(0);
            if call.result != 0 && failure.is_none() {
                failure = Some(call.result);
            }
        }
        match failure {
            Some(code) => Err(HypercallError::new(Hypercall::Multicall, code)),
            None => Ok(()),
        }
    }

    fn crash(&self) -> ! {
        panic!("domain crashed");
    }
}

impl TableMemory for SimMachine {
    fn read_entry(&self, pfn: Pfn, index: usize) -> PageTableEntry {
        let mfn = self.mfn_of(pfn.as_u64()).as_u64();
        let raw = self
            .state
            .borrow()
            .frames
            .get(&mfn)
            .map_or(GARBAGE, |entries| entries[index]);
        PageTableEntry::from_raw(raw)
    }

    fn zero_frame(&self, pfn: Pfn) {
        let mfn = self.mfn_of(pfn.as_u64()).as_u64();
        let mut state = self.state.borrow_mut();
        assert!(
            !state.tables.contains_key(&mfn),
            "guest wrote to table frame {:#x}",
            mfn
        );
        state.frames.insert(mfn, vec![0; SLOTS]);
        state.events.push(Event::Zero(pfn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_tables_are_consistent() {
        for sim in [SimMachine::four_level(), SimMachine::pae(), SimMachine::two_level()] {
            let tables = sim.page_tables();
            assert_eq!(tables.translate(VirtAddr::new(3 * PAGE_SIZE)), Some(Pfn::new(3)));
            let root = sim.mfn_of(PT_BASE_PFN);
            assert_eq!(sim.table_level(root), Some(sim.mode().root_level()));
        }
    }

    #[test]
    fn test_writable_mapping_of_table_is_refused() {
        let sim = SimMachine::four_level();
        let slot = sim.leaf_slot(VirtAddr::new(PT_BASE_PFN as usize * PAGE_SIZE));
        let entry = PageTableEntry::new(sim.mfn_of(PT_BASE_PFN), sim.mode().leaf_prot());
        let err = sim.mmu_update(&[MmuUpdate::normal(slot, entry)]).unwrap_err();
        assert_eq!(err.code, EPERM);
    }

    #[test]
    fn test_pinning_uninitialised_frame_is_refused() {
        let sim = SimMachine::four_level();
        let op = MmuExtOp::new(MmuExtCmd::PinL1Table, sim.mfn_of(40));
        assert!(sim.mmuext_op(&[op]).is_err());
        assert_eq!(sim.stats().pins, 0);
    }
}

//! Memory management for a paravirtualized guest
//!
//! Provides:
//! - Typed guest, machine and virtual addresses
//! - Pseudo-physical ↔ machine frame translation
//! - Page table construction, demolition and write protection through
//!   hypercalls
//! - The 1:1 memory bootstrap and a physical frame allocator
//!
//! # Security Principles
//! - A frame is never writable by the guest while it is a table node
//! - Table nodes are zeroed before they become reachable
//! - Every failure reaches the fault handler; nothing is silently retried

pub mod address;
pub mod alloc_env;
pub mod batch;
pub mod boot;
pub mod frame;
pub mod kernel;
pub mod mapper;
pub mod memory;
pub mod p2m;
pub mod paging;
mod protect;

pub use address::{DirectMapLayout, MachineAddr, Mfn, PhysAddr, Pfn, VirtAddr, PAGE_SIZE};
pub use alloc_env::{FrameAllocEnv, LinearFrames, OnDemandFrames};
pub use batch::{MmuBatch, MulticallBatch, MMU_BATCH_ENTRIES, MULTICALL_BATCH_ENTRIES};
pub use boot::{arch_init_mm, BootFrames, StartInfo, BOOT_RESERVED_FRAMES};
pub use frame::{LockedFrameBitmap, PageAllocator};
pub use kernel::KernelMm;
pub use mapper::{LeafEntry, MappingSize, PageTables};
pub use memory::{DirectMap, TableMemory};
pub use p2m::{FrameTranslation, P2mTables};
pub use paging::{MmError, PageTableEntry, PagingMode, PteFlags, TableLevel};

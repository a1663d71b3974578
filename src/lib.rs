//! PantherOS PV-MMU - Page Tables for Paravirtualized Guests
//!
//! A guest running under Xen without direct write access to its own page
//! tables. Every mapping change is a request to the hypervisor, and every
//! frame used as a table node is pinned so the hypervisor can check the
//! guest never forges a translation.
//!
//! # Security Features
//! - Strict zero → protect → pin → link ordering for new table nodes
//! - Type-safe guest frame / machine frame / address handling
//! - Caller-owned hypercall batches, no global mutable state
//! - Errors propagate to a single fault handler that crashes the domain
//!
//! # Architecture
//! - Hypervisor: Xen PV (`mmu_update`, `mmuext_op`, `update_va_mapping`,
//!   `multicall`)
//! - Paging: 2-level, 3-level PAE and 4-level x86 trees
//! - Host builds run the table logic against a simulated hypervisor

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod fault;
pub mod hypervisor;
pub mod mm;

#[cfg(test)]
mod testing;

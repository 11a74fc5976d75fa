//! vm_region - Region / VMObject virtual memory core
//!
//! This crate provides the part of a kernel's memory manager that binds
//! virtual address ranges to shared, demand-paged, copy-on-write backing
//! objects and resolves page faults against them.
//!
//! ## Layout
//!
//! - [`vm::Region`]: a virtual range bound to a [`vm::VmObject`] at some offset
//! - [`vm::VmObject`]: anonymous or inode-backed page array shared by regions
//! - [`vm::PageDirectory`]: per-address-space page tables and range allocators
//! - [`vm::MemoryManager`]: physical page facade, TLB flushing, global lock
//!
//! The crate is `no_std` + `alloc`; the `std` feature only exists for hosted
//! builds and the unit tests.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Counters and lock trackers are const-constructed and have no Default
#![allow(clippy::new_without_default)]

extern crate alloc;

#[macro_use]
mod macros;

pub mod config;
pub mod error;
pub mod sync;
pub mod vm;

#[cfg(test)]
mod testing;

pub use error::{InodeError, VmError};
pub use vm::{
    Access, AllocationStrategy, Cacheable, HeapPhysicalMemory, HostedPlatform, Inode,
    MemoryManager, MemoryManagerConfig, PageDirectory, PageFault, PageFaultAccess,
    PageFaultResponse, PageFaultType, PhysicalAddress, PhysicalMemory, PhysicalPage, Platform,
    Range, RangeAllocator, Region, RegionHandle, ShouldDeallocateVirtualMemoryRange,
    ShouldFlushTlb, ShouldZeroFill, VirtualAddress, VmObject,
};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

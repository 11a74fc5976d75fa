//! Virtual Memory Subsystem
//!
//! Provides the Region / VMObject core and the collaborators it consumes:
//! - address: virtual/physical addresses and page-aligned ranges
//! - range_allocator: per-address-space virtual range allocation
//! - physical_memory: frame storage and platform hooks (TLB, NX)
//! - physical_page: refcounted frame handles and the user frame pool
//! - memory_manager: global facade and ordering lock
//! - page_directory: per-address-space page tables
//! - vm_object / anonymous / inode: backing objects
//! - region_arena: stable handles for back-references from objects to regions
//! - region: mapping, unmapping, cloning and accounting
//! - vm_fault: the page-fault state machine

pub mod address;
pub mod anonymous;
pub mod inode;
pub mod memory_manager;
pub mod page_directory;
pub mod physical_memory;
pub mod physical_page;
pub mod range_allocator;
pub mod region;
pub mod region_arena;
pub mod vm_fault;
pub mod vm_object;

pub use address::{PhysicalAddress, Range, VirtualAddress};
pub use anonymous::AllocationStrategy;
pub use inode::Inode;
pub use memory_manager::{MemoryManager, MemoryManagerConfig, MemoryStats, MmGuard};
pub use page_directory::{PageDirectory, PageDirectoryGuard, PageDirectoryId, PageTableEntry, PteFlags};
pub use physical_memory::{HeapPhysicalMemory, HostedPlatform, PhysicalMemory, Platform};
pub use physical_page::{PageKind, PhysicalPage, ShouldZeroFill};
pub use range_allocator::RangeAllocator;
pub use region::{
    Access, Cacheable, Region, RegionName, ShouldDeallocateVirtualMemoryRange, ShouldFlushTlb,
};
pub use region_arena::RegionHandle;
pub use vm_fault::{FaultStats, PageFault, PageFaultAccess, PageFaultResponse, PageFaultType};
pub use vm_object::{VmObject, VmObjectGuard, VmObjectId};

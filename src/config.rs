//! Compile-time configuration of the VM core
//!
//! Address space layout and page geometry. Runtime knobs live in
//! [`crate::vm::MemoryManagerConfig`].

use crate::vm::VirtualAddress;

// ============================================================================
// Page Geometry
// ============================================================================

/// Page size (4KB on every supported platform)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Entries in one leaf page table
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Bytes covered by one leaf page table
pub const PAGE_TABLE_SPAN: usize = PAGE_SIZE * PAGE_TABLE_ENTRIES;

// ============================================================================
// Address Space Layout
// ============================================================================

/// Lowest address a user mapping may occupy.
///
/// Everything below is the identity-mapped low kernel region.
pub const USER_RANGE_BASE: usize = 0x0080_0000;

/// First address that belongs to the kernel half of the address space
pub const USER_RANGE_CEILING: usize = 0xc000_0000;

/// Maximum length of a region name in bytes
pub const REGION_NAME_CAPACITY: usize = 64;

/// Is `vaddr` below the kernel half of the address space?
pub const fn is_user_address(vaddr: VirtualAddress) -> bool {
    vaddr.get() < USER_RANGE_CEILING
}

/// Round address down to page boundary
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round address up to page boundary
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

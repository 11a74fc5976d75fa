//! Addresses and Ranges
//!
//! Newtypes for virtual and physical addresses plus the half-open,
//! page-granular [`Range`] every region and allocator works in.

use alloc::vec::Vec;
use core::fmt;

use crate::config::{PAGE_SIZE, PAGE_SHIFT};

// ============================================================================
// Virtual Address
// ============================================================================

/// A virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    /// Create from a raw address
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Raw address
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Address `bytes` further on
    pub const fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Containing page's base address
    pub const fn page_base(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Offset within the containing page
    pub const fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:#010x}", self.0)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// ============================================================================
// Physical Address
// ============================================================================

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    /// Create from a raw address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw address
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Address `bytes` further on
    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Page frame number
    pub const fn frame_number(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{:#010x}", self.0)
    }
}

// ============================================================================
// Range
// ============================================================================

/// Half-open virtual interval `[base, base + size)`
///
/// `size` is always a multiple of the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    base: VirtualAddress,
    size: usize,
}

impl Range {
    /// Create a range.
    ///
    /// Callers pass page multiples; see [`Range::try_new`] for untrusted input.
    pub const fn new(base: VirtualAddress, size: usize) -> Self {
        debug_assert!(size % PAGE_SIZE == 0);
        Self { base, size }
    }

    /// Create a range, rejecting unaligned bases and sizes
    pub fn try_new(base: VirtualAddress, size: usize) -> Option<Self> {
        if !base.is_page_aligned() || size % PAGE_SIZE != 0 {
            return None;
        }
        base.get().checked_add(size)?;
        Some(Self { base, size })
    }

    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte
    pub const fn end(&self) -> VirtualAddress {
        self.base.offset(self.size)
    }

    pub const fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Does the range contain `vaddr`?
    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.base && vaddr < self.end()
    }

    /// Does the range fully contain `other`?
    pub fn contains_range(&self, other: &Range) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    /// Do the two ranges share at least one byte?
    pub fn intersects(&self, other: &Range) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Remove `taken` from this range, returning what is left on either side.
    ///
    /// `taken` must be contained in `self`.
    pub fn carve(&self, taken: &Range) -> Vec<Range> {
        debug_assert!(self.contains_range(taken));
        let mut parts = Vec::with_capacity(2);
        if taken.base > self.base {
            parts.push(Range::new(self.base, taken.base.get() - self.base.get()));
        }
        if taken.end() < self.end() {
            parts.push(Range::new(taken.end(), self.end().get() - taken.end().get()));
        }
        parts
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.end())
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two)
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

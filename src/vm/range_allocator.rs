//! Range Allocator - Virtual Range Allocation
//!
//! Hands out page-granular virtual ranges from one total range, keeping a
//! sorted free list that is coalesced on deallocation. Each page directory
//! owns two of these: one for the user range and one for identity-mapped
//! low kernel ranges.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::vm::address::{align_up, Range, VirtualAddress};

/// First-fit allocator over a fixed virtual range
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    /// Everything this allocator manages
    total_range: Range,
    /// Free ranges, sorted by base, never adjacent
    available_ranges: Vec<Range>,
}

impl RangeAllocator {
    /// Create an allocator with `[base, base + size)` entirely free
    pub fn new(base: VirtualAddress, size: usize) -> Self {
        let total_range = Range::new(base, size);
        Self {
            total_range,
            available_ranges: vec![total_range],
        }
    }

    pub fn total_range(&self) -> Range {
        self.total_range
    }

    /// Free ranges in address order
    pub fn available(&self) -> &[Range] {
        &self.available_ranges
    }

    /// Bytes currently free
    pub fn available_bytes(&self) -> usize {
        self.available_ranges.iter().map(Range::size).sum()
    }

    /// Is `range` inside what this allocator manages?
    pub fn contains(&self, range: &Range) -> bool {
        self.total_range.contains_range(range)
    }

    /// Allocate `size` bytes anywhere, with the base aligned to `alignment`
    pub fn allocate_anywhere(&mut self, size: usize, alignment: usize) -> Option<Range> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return None;
        }
        let alignment = alignment.max(PAGE_SIZE);
        debug_assert!(alignment.is_power_of_two());

        for index in 0..self.available_ranges.len() {
            let available = self.available_ranges[index];
            let aligned_base = align_up(available.base().get(), alignment);
            let padding = aligned_base - available.base().get();
            if available.size() < padding + size {
                continue;
            }
            let allocated = Range::new(VirtualAddress::new(aligned_base), size);
            self.carve_at_index(index, &allocated);
            return Some(allocated);
        }

        log::warn!(
            "RangeAllocator: failed to allocate anywhere: size={:#x}, alignment={:#x}",
            size,
            alignment
        );
        None
    }

    /// Allocate exactly `[base, base + size)` if it is free
    pub fn allocate_specific(&mut self, base: VirtualAddress, size: usize) -> Option<Range> {
        let allocated = Range::try_new(base, size)?;
        if allocated.is_empty() || !self.total_range.contains_range(&allocated) {
            return None;
        }
        let index = self
            .available_ranges
            .iter()
            .position(|available| available.contains_range(&allocated))?;
        self.carve_at_index(index, &allocated);
        Some(allocated)
    }

    /// Return `range` to the free list, merging with free neighbours
    pub fn deallocate(&mut self, range: Range) {
        assert!(
            self.total_range.contains_range(&range),
            "RangeAllocator: deallocating {} outside {}",
            range,
            self.total_range
        );
        debug_assert!(
            !self.available_ranges.iter().any(|free| free.intersects(&range)),
            "RangeAllocator: double deallocation of {}",
            range
        );
        if range.is_empty() {
            return;
        }

        let index = self
            .available_ranges
            .partition_point(|free| free.base() < range.base());

        let mut merged = range;
        let mut insert_at = index;

        // Merge with the previous free range
        if index > 0 {
            let previous = self.available_ranges[index - 1];
            if previous.end() == merged.base() {
                merged = Range::new(previous.base(), previous.size() + merged.size());
                insert_at = index - 1;
                self.available_ranges.remove(index - 1);
            }
        }

        // Merge with the next free range
        if insert_at < self.available_ranges.len() {
            let next = self.available_ranges[insert_at];
            if merged.end() == next.base() {
                merged = Range::new(merged.base(), merged.size() + next.size());
                self.available_ranges.remove(insert_at);
            }
        }

        self.available_ranges.insert(insert_at, merged);
    }

    fn carve_at_index(&mut self, index: usize, range: &Range) {
        let remaining = self.available_ranges[index].carve(range);
        match remaining.as_slice() {
            [] => {
                self.available_ranges.remove(index);
            }
            [only] => {
                self.available_ranges[index] = *only;
            }
            [before, after] => {
                self.available_ranges[index] = *before;
                self.available_ranges.insert(index + 1, *after);
            }
            _ => unreachable!("carving one range leaves at most two parts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x0080_0000;

    fn allocator(pages: usize) -> RangeAllocator {
        RangeAllocator::new(VirtualAddress::new(BASE), pages * PAGE_SIZE)
    }

    #[test]
    fn test_allocate_anywhere_first_fit() {
        let mut ra = allocator(16);
        let a = ra.allocate_anywhere(2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let b = ra.allocate_anywhere(3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(a.base(), VirtualAddress::new(BASE));
        assert_eq!(b.base(), a.end());
        assert_eq!(ra.available_bytes(), 11 * PAGE_SIZE);
    }

    #[test]
    fn test_allocate_anywhere_respects_alignment() {
        let mut ra = allocator(64);
        let _ = ra.allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        let aligned = ra.allocate_anywhere(PAGE_SIZE, 16 * PAGE_SIZE).unwrap();
        assert_eq!(aligned.base().get() % (16 * PAGE_SIZE), 0);
    }

    #[test]
    fn test_allocate_specific() {
        let mut ra = allocator(16);
        let wanted = VirtualAddress::new(BASE + 4 * PAGE_SIZE);
        let r = ra.allocate_specific(wanted, 2 * PAGE_SIZE).unwrap();
        assert_eq!(r.base(), wanted);
        assert_eq!(ra.available().len(), 2);
        // Already taken
        assert!(ra.allocate_specific(wanted, PAGE_SIZE).is_none());
        // Outside the total range
        assert!(ra
            .allocate_specific(VirtualAddress::new(BASE - PAGE_SIZE), PAGE_SIZE)
            .is_none());
    }

    #[test]
    fn test_deallocate_coalesces() {
        let mut ra = allocator(16);
        let a = ra.allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        let b = ra.allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        let c = ra.allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        ra.deallocate(a);
        ra.deallocate(c);
        assert_eq!(ra.available().len(), 2);
        ra.deallocate(b);
        assert_eq!(ra.available(), [ra.total_range()]);
    }

    #[test]
    fn test_exhaustion() {
        let mut ra = allocator(2);
        assert!(ra.allocate_anywhere(3 * PAGE_SIZE, PAGE_SIZE).is_none());
        assert!(ra.allocate_anywhere(2 * PAGE_SIZE, PAGE_SIZE).is_some());
        assert!(ra.allocate_anywhere(PAGE_SIZE, PAGE_SIZE).is_none());
    }

    #[test]
    fn test_rejects_unaligned_size() {
        let mut ra = allocator(4);
        assert!(ra.allocate_anywhere(100, PAGE_SIZE).is_none());
        assert!(ra.allocate_anywhere(0, PAGE_SIZE).is_none());
    }
}

//! Lock Ordering
//!
//! The VM core uses three nested lock classes, always acquired in this order:
//!
//! 1. the global memory manager lock ([`crate::vm::MmGuard`])
//! 2. a VMObject lock ([`crate::vm::VmObjectGuard`])
//! 3. a PageDirectory lock ([`crate::vm::PageDirectoryGuard`])
//!
//! Ranks 2 and 3 can only be taken by presenting an `MmGuard`, so "MM first"
//! is checked by the compiler. The `LockOrder` tracker carried inside each
//! `MmGuard` checks the remaining VMObject -> PageDirectory edge at runtime
//! in debug builds (or always with the `lock_order_check` feature).
//!
//! Every other lock in the crate (frame pool accounting, region arena, range
//! allocators, per-region fields) is a leaf: nothing is acquired while it is
//! held, so it cannot take part in a cycle.

use core::cell::Cell;

/// Whether the runtime checker is active
pub const LOCK_ORDER_CHECK: bool = cfg!(any(debug_assertions, feature = "lock_order_check"));

/// Lock classes below the global MM lock, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockRank {
    /// A VMObject's page array / CoW state
    VmObject = 1,
    /// A PageDirectory's page tables
    PageDirectory = 2,
}

impl LockRank {
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Ranks currently held by the owner of one MM lock acquisition
#[derive(Debug)]
pub struct LockOrder {
    held: Cell<u8>,
}

impl LockOrder {
    /// Tracker with nothing held
    pub const fn new() -> Self {
        Self { held: Cell::new(0) }
    }

    /// Record acquisition of `rank`.
    ///
    /// Panics (when checking is enabled) if `rank` or any later rank is
    /// already held.
    pub fn acquire(&self, rank: LockRank) {
        let held = self.held.get();
        if LOCK_ORDER_CHECK {
            let same_or_later = !(rank.bit() - 1);
            assert!(
                held & same_or_later == 0,
                "lock order violation: {:?} acquired while holding {:#04b}",
                rank,
                held
            );
        }
        self.held.set(held | rank.bit());
    }

    /// Record release of `rank`
    pub fn release(&self, rank: LockRank) {
        self.held.set(self.held.get() & !rank.bit());
    }

    /// Is `rank` currently held?
    pub fn holds(&self, rank: LockRank) -> bool {
        self.held.get() & rank.bit() != 0
    }
}

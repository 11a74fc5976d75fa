//! Physical Pages - Refcounted Frame Handles
//!
//! A [`PhysicalPage`] is a shared handle to one frame. VMObjects hold them in
//! their page arrays; the frame goes back to the [`FramePool`] when the last
//! handle is dropped.
//!
//! Two sentinel pages exist per pool and are never written through a user
//! mapping:
//!
//! - the shared zero page, installed read-only for untouched overcommitted
//!   anonymous memory
//! - the lazy-committed page, installed read-only for memory whose physical
//!   page is already reserved but not yet realized

use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

use crate::vm::address::PhysicalAddress;
use crate::vm::physical_memory::PhysicalMemory;

/// What a physical page stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// An ordinary frame with private content
    Private,
    /// The global zero-filled page
    SharedZero,
    /// Placeholder for a reserved but unrealized page
    LazyCommitted,
}

/// Should a freshly allocated page be zero-filled?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldZeroFill {
    No,
    Yes,
}

// ============================================================================
// Physical Page
// ============================================================================

struct Frame {
    paddr: PhysicalAddress,
    kind: PageKind,
    pool: Arc<FramePool>,
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.pool.return_frame(self.paddr, self.kind);
    }
}

/// Shared handle to one physical frame
#[derive(Clone)]
pub struct PhysicalPage(Arc<Frame>);

impl PhysicalPage {
    /// Physical address of the frame
    pub fn paddr(&self) -> PhysicalAddress {
        self.0.paddr
    }

    pub fn kind(&self) -> PageKind {
        self.0.kind
    }

    /// Number of handles to this frame, this one included
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn is_shared_zero_page(&self) -> bool {
        self.0.kind == PageKind::SharedZero
    }

    pub fn is_lazy_committed_page(&self) -> bool {
        self.0.kind == PageKind::LazyCommitted
    }

    /// Is this one of the two placeholder pages?
    pub fn is_sentinel(&self) -> bool {
        self.0.kind != PageKind::Private
    }
}

impl PartialEq for PhysicalPage {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for PhysicalPage {}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("paddr", &self.0.paddr)
            .field("kind", &self.0.kind)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage({})", self.0.paddr)
    }
}

// ============================================================================
// Frame Pool
// ============================================================================

/// Usage counters of a frame pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageAccounting {
    /// Frames available to user allocations
    pub total: usize,
    /// Frames currently backing private pages or page tables
    pub used: usize,
    /// Frames promised to committed (reserved) allocations
    pub committed: usize,
}

impl PageAccounting {
    /// Frames neither used nor promised
    pub fn uncommitted_free(&self) -> usize {
        self.total - self.used - self.committed
    }
}

/// User physical page allocator with commit accounting.
///
/// The accounting lock is a leaf: it is taken under any other lock and
/// nothing is acquired while it is held.
pub struct FramePool {
    memory: Arc<dyn PhysicalMemory>,
    accounting: Mutex<PageAccounting>,
}

impl FramePool {
    pub(crate) fn new(memory: Arc<dyn PhysicalMemory>) -> Arc<Self> {
        let total = memory.total_frames();
        Arc::new(Self {
            memory,
            accounting: Mutex::new(PageAccounting {
                total,
                used: 0,
                committed: 0,
            }),
        })
    }

    pub fn memory(&self) -> &dyn PhysicalMemory {
        &*self.memory
    }

    pub fn accounting(&self) -> PageAccounting {
        *self.accounting.lock()
    }

    /// Allocate one of the two sentinel pages. Sentinels are excluded from
    /// the user total so they never show up as used memory.
    pub(crate) fn allocate_sentinel(self: &Arc<Self>, kind: PageKind) -> Option<PhysicalPage> {
        debug_assert!(kind != PageKind::Private);
        let paddr = self.memory.allocate_frame()?;
        self.memory.fill_frame(paddr, 0);
        self.accounting.lock().total -= 1;
        Some(self.wrap(paddr, kind))
    }

    /// Allocate an uncommitted page; fails when only committed frames remain
    pub fn allocate(self: &Arc<Self>, zero_fill: ShouldZeroFill) -> Option<PhysicalPage> {
        {
            let mut accounting = self.accounting.lock();
            if accounting.uncommitted_free() == 0 {
                return None;
            }
            accounting.used += 1;
        }
        self.take_frame(zero_fill)
    }

    /// Reserve `page_count` frames for later `allocate_committed` calls
    pub fn commit(&self, page_count: usize) -> bool {
        let mut accounting = self.accounting.lock();
        if accounting.uncommitted_free() < page_count {
            return false;
        }
        accounting.committed += page_count;
        true
    }

    /// Drop a reservation made with `commit`
    pub fn uncommit(&self, page_count: usize) {
        let mut accounting = self.accounting.lock();
        debug_assert!(accounting.committed >= page_count);
        accounting.committed -= page_count.min(accounting.committed);
    }

    /// Realize one page out of a previous `commit`
    pub fn allocate_committed(self: &Arc<Self>, zero_fill: ShouldZeroFill) -> Option<PhysicalPage> {
        {
            let mut accounting = self.accounting.lock();
            debug_assert!(accounting.committed > 0);
            if accounting.committed == 0 {
                return None;
            }
            accounting.committed -= 1;
            accounting.used += 1;
        }
        let page = self.take_frame(zero_fill);
        if page.is_none() {
            // The commitment still stands
            self.accounting.lock().committed += 1;
        }
        page
    }

    fn take_frame(self: &Arc<Self>, zero_fill: ShouldZeroFill) -> Option<PhysicalPage> {
        let Some(paddr) = self.memory.allocate_frame() else {
            log::error!("FramePool: accounting allows a frame but physical memory has none");
            self.accounting.lock().used -= 1;
            return None;
        };
        if zero_fill == ShouldZeroFill::Yes {
            self.memory.fill_frame(paddr, 0);
        }
        Some(self.wrap(paddr, PageKind::Private))
    }

    fn wrap(self: &Arc<Self>, paddr: PhysicalAddress, kind: PageKind) -> PhysicalPage {
        PhysicalPage(Arc::new(Frame {
            paddr,
            kind,
            pool: Arc::clone(self),
        }))
    }

    fn return_frame(&self, paddr: PhysicalAddress, kind: PageKind) {
        self.memory.free_frame(paddr);
        let mut accounting = self.accounting.lock();
        match kind {
            PageKind::Private => accounting.used -= 1,
            _ => accounting.total += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::physical_memory::HeapPhysicalMemory;

    fn pool(frames: usize) -> Arc<FramePool> {
        FramePool::new(Arc::new(HeapPhysicalMemory::new(frames)))
    }

    #[test]
    fn test_refcount_and_release() {
        let pool = pool(4);
        let page = pool.allocate(ShouldZeroFill::Yes).unwrap();
        assert_eq!(page.ref_count(), 1);
        let other = page.clone();
        assert_eq!(page.ref_count(), 2);
        assert_eq!(page, other);
        assert_eq!(pool.accounting().used, 1);
        drop(page);
        drop(other);
        assert_eq!(pool.accounting().used, 0);
    }

    #[test]
    fn test_commit_reserves_frames() {
        let pool = pool(3);
        assert!(pool.commit(2));
        assert!(!pool.commit(2));
        // One uncommitted frame left
        let loose = pool.allocate(ShouldZeroFill::No).unwrap();
        assert!(pool.allocate(ShouldZeroFill::No).is_none());
        // Committed frames are still there
        let a = pool.allocate_committed(ShouldZeroFill::Yes).unwrap();
        let b = pool.allocate_committed(ShouldZeroFill::Yes).unwrap();
        assert_eq!(pool.accounting().committed, 0);
        assert_eq!(pool.accounting().used, 3);
        drop((loose, a, b));
        assert_eq!(pool.accounting().used, 0);
    }

    #[test]
    fn test_failed_committed_allocation_keeps_commitment() {
        let memory = crate::testing::FailingPhysicalMemory::new(2);
        let pool = FramePool::new(memory.clone());
        assert!(pool.commit(1));
        memory.set_failing(true);
        assert!(pool.allocate_committed(ShouldZeroFill::No).is_none());
        assert_eq!(pool.accounting().committed, 1);
        assert_eq!(pool.accounting().used, 0);
        memory.set_failing(false);
        assert!(pool.allocate_committed(ShouldZeroFill::No).is_some());
    }

    #[test]
    fn test_uncommit() {
        let pool = pool(2);
        assert!(pool.commit(2));
        pool.uncommit(2);
        assert!(pool.allocate(ShouldZeroFill::No).is_some());
    }

    #[test]
    fn test_sentinels_are_not_user_memory() {
        let pool = pool(3);
        let zero = pool.allocate_sentinel(PageKind::SharedZero).unwrap();
        assert!(zero.is_shared_zero_page());
        assert!(zero.is_sentinel());
        assert_eq!(pool.accounting().total, 2);
        assert_eq!(pool.accounting().used, 0);
    }

    #[test]
    fn test_zero_fill() {
        let pool = pool(1);
        let page = pool.allocate(ShouldZeroFill::Yes).unwrap();
        let mut buf = [0xffu8; 16];
        pool.memory().read_frame(page.paddr(), 100, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }
}

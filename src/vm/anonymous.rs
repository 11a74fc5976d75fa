//! Anonymous VM Objects
//!
//! Memory with no backing file. Pages start out as one of the sentinel pages
//! and are realized on the first write:
//!
//! - `Reserve`: every page is committed up front and the slots hold the
//!   lazy-committed page until touched
//! - `AllocateNow`: every page is committed and allocated immediately
//! - `None`: nothing is committed, slots hold the shared zero page
//!
//! ## Copy-on-write
//!
//! Cloning a private object for fork shares every physical page between the
//! two objects and marks all of them copy-on-write in both. A shared
//! [`CommittedCowPages`] reserve, sized for the whole object, guarantees the
//! later copies can be satisfied. The first writer to a shared page copies
//! it out of that page's reservation; once a page is no longer shared its
//! remaining owner just drops the CoW bit and hands the reservation back if
//! nobody spent it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitvec::vec::BitVec;
use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::error::{Result, VmError};
use crate::vm::address::VirtualAddress;
use crate::vm::memory_manager::MemoryManager;
use crate::vm::physical_page::{FramePool, PhysicalPage, ShouldZeroFill};
use crate::vm::vm_fault::PageFaultResponse;
use crate::vm::vm_object::{VmObject, VmObjectGuard, VmObjectKind, VmObjectState};

/// How an anonymous object backs its pages at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Commit now, allocate on first write
    Reserve,
    /// Commit and allocate now
    AllocateNow,
    /// Overcommit: map the shared zero page, allocate on first write
    None,
}

// ============================================================================
// Committed CoW Pages
// ============================================================================

/// Pages committed at fork time for CoW copies, shared by an object and its
/// clones.
///
/// One page is reserved per object page. A page's reservation is spent by
/// whichever side first needs a fresh frame for it, or handed back when the
/// last holder of the shared frame stops needing a copy. Either happens at
/// most once per page.
pub struct CommittedCowPages {
    pool: Arc<FramePool>,
    /// Pages whose reservation is still outstanding
    pending: Mutex<BitVec>,
}

impl CommittedCowPages {
    fn new(pool: Arc<FramePool>, page_count: usize) -> Self {
        Self {
            pool,
            pending: Mutex::new(BitVec::repeat(true, page_count)),
        }
    }

    /// Clear the reservation of `page_index`. False if it was already gone.
    fn take(&self, page_index: usize) -> bool {
        let mut pending = self.pending.lock();
        let outstanding = pending.get(page_index).is_some_and(|bit| *bit);
        if outstanding {
            pending.set(page_index, false);
        }
        outstanding
    }

    /// Realize the page reserved for `page_index`; `None` when that
    /// reservation was already used or returned
    pub fn allocate_one(&self, page_index: usize, zero_fill: ShouldZeroFill) -> Option<PhysicalPage> {
        if !self.take(page_index) {
            return None;
        }
        let page = self.pool.allocate_committed(zero_fill);
        if page.is_none() {
            self.pending.lock().set(page_index, true);
        }
        page
    }

    /// Give the reservation of `page_index` back if it is still outstanding.
    /// Returns true when no reservation is left.
    pub fn return_one(&self, page_index: usize) -> bool {
        if self.take(page_index) {
            self.pool.uncommit(1);
        }
        self.is_empty()
    }

    pub fn is_pending(&self, page_index: usize) -> bool {
        self.pending.lock().get(page_index).is_some_and(|bit| *bit)
    }

    pub fn remaining(&self) -> usize {
        self.pending.lock().count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

impl Drop for CommittedCowPages {
    fn drop(&mut self) {
        let remaining = self.pending.get_mut().count_ones();
        if remaining > 0 {
            self.pool.uncommit(remaining);
        }
    }
}

impl core::fmt::Debug for CommittedCowPages {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommittedCowPages")
            .field("remaining", &self.remaining())
            .finish()
    }
}

// ============================================================================
// Construction
// ============================================================================

impl VmObject {
    /// Create an anonymous object of `size` bytes (rounded up to pages)
    pub fn create_anonymous(
        mm: &MemoryManager,
        size: usize,
        strategy: AllocationStrategy,
    ) -> Result<Arc<VmObject>> {
        let page_count = size.div_ceil(PAGE_SIZE);
        if page_count == 0 {
            return Err(VmError::MisalignedRange);
        }
        if strategy != AllocationStrategy::None && !mm.commit_user_physical_pages(page_count) {
            log::warn!(
                "VmObject: unable to commit {} pages for anonymous object",
                page_count
            );
            return Err(VmError::CommitFailed { pages: page_count });
        }

        let mut physical_pages = Vec::with_capacity(page_count);
        let mut unused_committed_pages = 0;
        match strategy {
            AllocationStrategy::AllocateNow => {
                for allocated in 0..page_count {
                    match mm.allocate_committed_user_physical_page(ShouldZeroFill::Yes) {
                        Some(page) => physical_pages.push(Some(page)),
                        None => {
                            mm.uncommit_user_physical_pages(page_count - allocated);
                            return Err(VmError::OutOfMemory);
                        }
                    }
                }
            }
            AllocationStrategy::Reserve => {
                physical_pages.resize(page_count, Some(mm.lazy_committed_page()));
                unused_committed_pages = page_count;
            }
            AllocationStrategy::None => {
                physical_pages.resize(page_count, Some(mm.shared_zero_page()));
            }
        }

        let mut state = VmObjectState::new(physical_pages);
        state.unused_committed_pages = unused_committed_pages;
        Ok(VmObject::from_parts(mm, VmObjectKind::Anonymous, state))
    }

    /// Create an anonymous object over existing pages
    pub fn create_with_physical_pages(
        mm: &MemoryManager,
        pages: &[PhysicalPage],
    ) -> Result<Arc<VmObject>> {
        if pages.is_empty() {
            return Err(VmError::MisalignedRange);
        }
        let physical_pages = pages.iter().cloned().map(Some).collect();
        Ok(VmObject::from_parts(
            mm,
            VmObjectKind::Anonymous,
            VmObjectState::new(physical_pages),
        ))
    }

    /// Clone this object for fork. Takes the MM and object locks.
    pub fn try_clone(&self, mm: &MemoryManager) -> Result<Arc<VmObject>> {
        let guard = mm.lock();
        let mut locked = self.lock(&guard);
        locked.try_clone()
    }
}

// ============================================================================
// Locked Anonymous Operations
// ============================================================================

impl VmObjectGuard<'_> {
    /// Clone the object: the new object shares every physical page, and both
    /// treat every page as copy-on-write from now on.
    pub fn try_clone(&mut self) -> Result<Arc<VmObject>> {
        let mm = self.memory_manager();
        let object = self.object();
        let page_count = object.page_count();

        match object.kind() {
            VmObjectKind::Anonymous => {}
            VmObjectKind::Inode { inode, shared } => {
                // Private inode clones share the resident pages as they are
                let state = VmObjectState {
                    dirty_pages: self.state.dirty_pages.clone(),
                    ..VmObjectState::new(self.state.physical_pages.clone())
                };
                let kind = VmObjectKind::Inode {
                    inode: Arc::clone(inode),
                    shared: *shared,
                };
                return Ok(VmObject::from_parts(mm, kind, state));
            }
        }

        if !mm.commit_user_physical_pages(page_count) {
            log::warn!(
                "VmObject {:?}: unable to commit {} CoW pages for clone",
                object.id(),
                page_count
            );
            return Err(VmError::CommitFailed { pages: page_count });
        }
        let cow_pages = Arc::new(CommittedCowPages::new(
            Arc::clone(object.pool()),
            page_count,
        ));
        self.state.shared_committed_cow_pages = Some(Arc::clone(&cow_pages));
        self.state.cow_map = Some(BitVec::repeat(true, page_count));

        // Unrealized lazy pages become overcommitted zero pages in both
        // objects; the CoW reserve covers them from here on.
        if self.state.unused_committed_pages > 0 {
            let shared_zero_page = mm.shared_zero_page();
            let mut released = 0;
            for slot in self.state.physical_pages.iter_mut() {
                if matches!(slot, Some(page) if page.is_lazy_committed_page()) {
                    *slot = Some(shared_zero_page.clone());
                    released += 1;
                }
            }
            debug_assert_eq!(released, self.state.unused_committed_pages);
            mm.uncommit_user_physical_pages(self.state.unused_committed_pages);
            self.state.unused_committed_pages = 0;
        }

        let state = VmObjectState {
            cow_map: Some(BitVec::repeat(true, page_count)),
            shared_committed_cow_pages: Some(cow_pages),
            ..VmObjectState::new(self.state.physical_pages.clone())
        };
        fault_trace!(
            "VmObject {:?}: cloned {} pages with a shared CoW reserve",
            object.id(),
            page_count
        );
        Ok(VmObject::from_parts(mm, VmObjectKind::Anonymous, state))
    }

    /// Mark or unmark `page_index` as copy-on-write
    pub fn set_should_cow(&mut self, page_index: usize, cow: bool) {
        if !self.object().is_anonymous() {
            return;
        }
        let page_count = self.object().page_count();
        let map = self
            .state
            .cow_map
            .get_or_insert_with(|| BitVec::repeat(false, page_count));
        map.set(page_index, cow);
    }

    pub fn cow_pages(&self) -> usize {
        self.state.cow_map.as_ref().map_or(0, |map| map.count_ones())
    }

    /// Realize one of the pages committed at creation.
    ///
    /// Only valid while the object still has unrealized committed pages.
    pub fn allocate_committed_page(&mut self) -> Option<PhysicalPage> {
        debug_assert!(self.state.unused_committed_pages > 0);
        if self.state.unused_committed_pages == 0 {
            return None;
        }
        let page = self
            .memory_manager()
            .allocate_committed_user_physical_page(ShouldZeroFill::Yes)?;
        self.state.unused_committed_pages -= 1;
        Some(page)
    }

    /// Take a zero-filled page from the fork-time reservation of
    /// `page_index`, if it is still outstanding
    pub fn allocate_from_cow_reserve(&mut self, page_index: usize) -> Option<PhysicalPage> {
        let reserve = self.state.shared_committed_cow_pages.as_ref()?;
        let page = reserve.allocate_one(page_index, ShouldZeroFill::Yes);
        if reserve.is_empty() {
            self.state.shared_committed_cow_pages = None;
        }
        page
    }

    /// Resolve a write to a CoW page: duplicate it privately unless nobody
    /// else holds it any more.
    pub fn handle_cow_fault(&mut self, page_index: usize, vaddr: VirtualAddress) -> PageFaultResponse {
        let mm = self.memory_manager();
        let Some((current, ref_count)) = self
            .physical_page(page_index)
            .map(|page| (page.paddr(), page.ref_count()))
        else {
            log::error!("VmObject: CoW fault on empty slot {} at {}", page_index, vaddr);
            return PageFaultResponse::ShouldCrash;
        };

        if ref_count == 1 {
            fault_trace!("    >> CoW page {} is no longer shared, remap r/w", page_index);
            self.set_should_cow(page_index, false);
            if let Some(reserve) = &self.state.shared_committed_cow_pages {
                if reserve.return_one(page_index) {
                    self.state.shared_committed_cow_pages = None;
                }
            }
            return PageFaultResponse::Continue;
        }

        let reserved = self
            .state
            .shared_committed_cow_pages
            .as_ref()
            .and_then(|reserve| reserve.allocate_one(page_index, ShouldZeroFill::No));
        let page = match reserved {
            Some(page) => page,
            None => match mm.allocate_user_physical_page(ShouldZeroFill::No) {
                Some(page) => page,
                None => {
                    log::warn!("MM: handle_cow_fault was unable to allocate a physical page");
                    return PageFaultResponse::OutOfMemory;
                }
            },
        };

        fault_trace!("      >> COW {} <- {} at {}", page.paddr(), current, vaddr);
        mm.physical_memory().copy_frame(page.paddr(), current);
        self.set_physical_page(page_index, Some(page));
        self.set_should_cow(page_index, false);
        PageFaultResponse::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_reserve_commits_and_fills_with_lazy_pages() {
        let mm = MemoryManager::hosted(10);
        let object = VmObject::create_anonymous(&mm, 3 * PAGE_SIZE, AllocationStrategy::Reserve).unwrap();
        assert_eq!(mm.stats().physical.committed, 3);
        assert_eq!(object.unused_committed_pages(), 3);
        assert!(object.physical_page(1).unwrap().is_lazy_committed_page());
        drop(object);
        assert_eq!(mm.stats().physical.committed, 0);
    }

    #[test]
    fn test_allocate_now() {
        let mm = MemoryManager::hosted(10);
        let object = VmObject::create_anonymous(&mm, 2 * PAGE_SIZE, AllocationStrategy::AllocateNow).unwrap();
        assert_eq!(mm.stats().physical.used, 2);
        assert_eq!(mm.stats().physical.committed, 0);
        assert!(!object.physical_page(0).unwrap().is_sentinel());
        drop(object);
        assert_eq!(mm.stats().physical.used, 0);
    }

    #[test]
    fn test_overcommit_uses_shared_zero_page() {
        let mm = MemoryManager::hosted(4);
        // Far more than physical memory
        let object = VmObject::create_anonymous(&mm, 100 * PAGE_SIZE, AllocationStrategy::None).unwrap();
        assert!(object.physical_page(99).unwrap().is_shared_zero_page());
        assert_eq!(mm.stats().physical.committed, 0);
    }

    #[test]
    fn test_commit_failure() {
        let mm = MemoryManager::hosted(4);
        let result = VmObject::create_anonymous(&mm, 3 * PAGE_SIZE, AllocationStrategy::Reserve);
        assert_eq!(result.err(), Some(VmError::CommitFailed { pages: 3 }));
        assert_eq!(mm.stats().physical.committed, 0);
    }

    #[test]
    fn test_create_with_physical_pages() {
        let mm = MemoryManager::hosted(4);
        let page = mm.allocate_user_physical_page(ShouldZeroFill::Yes).unwrap();
        let object = VmObject::create_with_physical_pages(&mm, &[page.clone()]).unwrap();
        assert_eq!(object.physical_page(0), Some(page));
        assert!(!object.should_cow(0, false));
    }

    #[test]
    fn test_clone_shares_pages_and_marks_cow() {
        let mm = MemoryManager::hosted(16);
        let parent = VmObject::create_anonymous(&mm, 2 * PAGE_SIZE, AllocationStrategy::AllocateNow).unwrap();
        let child = parent.try_clone(&mm).unwrap();
        assert_eq!(parent.physical_page(0), child.physical_page(0));
        assert_eq!(parent.cow_pages(), 2);
        assert_eq!(child.cow_pages(), 2);
        assert!(parent.should_cow(1, false));
        // Shared mappings never copy
        assert!(!parent.should_cow(1, true));
        assert_eq!(mm.stats().physical.committed, 2);
    }

    #[test]
    fn test_clone_turns_lazy_pages_into_zero_pages() {
        let mm = MemoryManager::hosted(16);
        let parent = VmObject::create_anonymous(&mm, 2 * PAGE_SIZE, AllocationStrategy::Reserve).unwrap();
        let child = parent.try_clone(&mm).unwrap();
        assert!(parent.physical_page(0).unwrap().is_shared_zero_page());
        assert!(child.physical_page(1).unwrap().is_shared_zero_page());
        assert_eq!(parent.unused_committed_pages(), 0);
        // Only the CoW reserve stays committed
        assert_eq!(mm.stats().physical.committed, 2);
        drop(parent);
        drop(child);
        assert_eq!(mm.stats().physical.committed, 0);
    }

    #[test]
    fn test_clone_commit_failure() {
        let mm = MemoryManager::hosted(5);
        let parent = VmObject::create_anonymous(&mm, 2 * PAGE_SIZE, AllocationStrategy::AllocateNow).unwrap();
        let result = parent.try_clone(&mm);
        assert_eq!(result.err(), Some(VmError::CommitFailed { pages: 2 }));
    }

    #[test]
    fn test_cow_fault_copies_shared_page() {
        let mm = MemoryManager::hosted(16);
        let parent = VmObject::create_anonymous(&mm, PAGE_SIZE, AllocationStrategy::AllocateNow).unwrap();
        let original = parent.physical_page(0).unwrap();
        mm.physical_memory().write_frame(original.paddr(), 0, b"parent");
        let child = parent.try_clone(&mm).unwrap();

        let guard = mm.lock();
        let mut locked = child.lock(&guard);
        let response = locked.handle_cow_fault(0, VirtualAddress::new(0x0080_0000));
        assert_eq!(response, PageFaultResponse::Continue);
        let copy = locked.physical_page(0).cloned().unwrap();
        assert_ne!(copy, original);
        assert!(!locked.should_cow(0, false));
        drop(locked);
        drop(guard);

        let mut buf = [0u8; 6];
        mm.physical_memory().read_frame(copy.paddr(), 0, &mut buf);
        assert_eq!(&buf, b"parent");
        // Parent keeps the original and is still cow until it writes
        assert_eq!(parent.physical_page(0), Some(original));
        assert!(parent.should_cow(0, false));
    }

    #[test]
    fn test_cow_fault_on_unshared_page_just_clears_bit() {
        let mm = MemoryManager::hosted(16);
        let parent = VmObject::create_anonymous(&mm, PAGE_SIZE, AllocationStrategy::AllocateNow).unwrap();
        let child = parent.try_clone(&mm).unwrap();
        drop(child);
        let original = parent.physical_page(0).unwrap().paddr();
        let guard = mm.lock();
        let mut locked = parent.lock(&guard);
        assert_eq!(
            locked.handle_cow_fault(0, VirtualAddress::new(0x0080_0000)),
            PageFaultResponse::Continue
        );
        assert_eq!(locked.physical_page(0).unwrap().paddr(), original);
        assert_eq!(locked.cow_pages(), 0);
        drop(locked);
        drop(guard);
        // The reserve page went back
        assert_eq!(mm.stats().physical.committed, 0);
    }

    #[test]
    fn test_committed_cow_pages_reserve() {
        let mm = MemoryManager::hosted(8);
        assert!(mm.commit_user_physical_pages(2));
        let reserve = CommittedCowPages::new(Arc::clone(mm.pool()), 2);
        let page = reserve.allocate_one(0, ShouldZeroFill::Yes);
        assert!(page.is_some());
        // Page 0's reservation is spent
        assert!(reserve.allocate_one(0, ShouldZeroFill::Yes).is_none());
        assert!(!reserve.return_one(0));
        assert_eq!(reserve.remaining(), 1);
        assert!(reserve.is_pending(1));
        assert!(reserve.return_one(1));
        assert!(!reserve.return_one(1));
        assert!(reserve.is_empty());
        assert!(reserve.allocate_one(1, ShouldZeroFill::Yes).is_none());
        assert_eq!(mm.stats().physical.committed, 0);
    }

    #[test]
    fn test_sole_owner_after_sibling_copied_every_page() {
        let mm = MemoryManager::hosted(16);
        let parent = VmObject::create_anonymous(&mm, 2 * PAGE_SIZE, AllocationStrategy::AllocateNow).unwrap();
        let child = parent.try_clone(&mm).unwrap();
        let vaddr = VirtualAddress::new(0x0080_0000);
        let guard = mm.lock();
        {
            let mut locked = child.lock(&guard);
            assert_eq!(locked.handle_cow_fault(0, vaddr), PageFaultResponse::Continue);
            assert_eq!(locked.handle_cow_fault(1, vaddr), PageFaultResponse::Continue);
        }
        assert_eq!(mm.stats().physical.committed, 0);

        // Both of the parent's pages are unshared now, and their
        // reservations were spent by the child
        let mut locked = parent.lock(&guard);
        assert_eq!(locked.handle_cow_fault(0, vaddr), PageFaultResponse::Continue);
        assert_eq!(locked.handle_cow_fault(1, vaddr), PageFaultResponse::Continue);
        assert_eq!(locked.cow_pages(), 0);
        drop(locked);
        drop(guard);
        assert_eq!(mm.stats().physical.committed, 0);
        assert_ne!(parent.physical_page(0), child.physical_page(0));
    }

    #[test]
    fn test_zero_fill_takes_one_reservation_per_page() {
        let mm = MemoryManager::hosted(16);
        let parent = VmObject::create_anonymous(&mm, PAGE_SIZE, AllocationStrategy::None).unwrap();
        let child = parent.try_clone(&mm).unwrap();
        assert_eq!(mm.stats().physical.committed, 1);
        let guard = mm.lock();
        let from_child = child.lock(&guard).allocate_from_cow_reserve(0);
        assert!(from_child.is_some());
        assert_eq!(mm.stats().physical.committed, 0);
        // The parent's zero fill of the same page has no reservation left
        let mut locked = parent.lock(&guard);
        assert!(locked.allocate_from_cow_reserve(0).is_none());
        assert!(locked.state.shared_committed_cow_pages.is_none());
    }

    #[test]
    fn test_allocate_committed_page_keeps_commitment_on_failure() {
        let memory = testing::FailingPhysicalMemory::new(8);
        let mm = testing::failing_memory_manager(Arc::clone(&memory));
        let object = VmObject::create_anonymous(&mm, PAGE_SIZE, AllocationStrategy::Reserve).unwrap();
        memory.set_failing(true);
        {
            let guard = mm.lock();
            let mut locked = object.lock(&guard);
            assert!(locked.allocate_committed_page().is_none());
        }
        assert_eq!(object.unused_committed_pages(), 1);
        assert_eq!(mm.stats().physical.committed, 1);
        assert_eq!(mm.stats().physical.used, 0);

        memory.set_failing(false);
        {
            let guard = mm.lock();
            assert!(object.lock(&guard).allocate_committed_page().is_some());
        }
        assert_eq!(object.unused_committed_pages(), 0);
        drop(object);
        assert_eq!(mm.stats().physical.committed, 0);
    }

    #[test]
    fn test_failed_cow_reserve_allocation_keeps_reservation() {
        let memory = testing::FailingPhysicalMemory::new(8);
        let mm = testing::failing_memory_manager(Arc::clone(&memory));
        let parent = VmObject::create_anonymous(&mm, PAGE_SIZE, AllocationStrategy::None).unwrap();
        let child = parent.try_clone(&mm).unwrap();
        memory.set_failing(true);
        let guard = mm.lock();
        let mut locked = child.lock(&guard);
        assert!(locked.allocate_from_cow_reserve(0).is_none());
        let reserve = locked.state.shared_committed_cow_pages.clone().unwrap();
        assert!(reserve.is_pending(0));
        assert_eq!(mm.stats().physical.committed, 1);
    }
}

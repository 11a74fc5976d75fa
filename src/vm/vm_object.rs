//! VM Object - Backing Store of Regions
//!
//! A VMObject owns an array of physical page slots indexed by page number
//! within the object. Any number of regions may map (a window of) the same
//! object; the object remembers them by [`RegionHandle`] so that replacing a
//! page can be broadcast to every mapping.
//!
//! Objects come in two flavours:
//! - Anonymous (see `anonymous`): per-page CoW bitmap and a committed page
//!   budget
//! - Inode-backed (see `inode`): pages read through an [`Inode`], dirty
//!   tracking, shared or private
//!
//! ## Locking
//!
//! The page array, CoW state and dirty bitmap sit behind the object lock,
//! which ranks between the global MM lock and the PageDirectory locks. Locked
//! access goes through a [`VmObjectGuard`]. Short read-only queries may take
//! the same lock on its own as long as nothing else is acquired under it.
//! The region handle set has its own leaf lock.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitvec::vec::BitVec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::config::PAGE_SIZE;
use crate::sync::LockRank;
use crate::vm::anonymous::CommittedCowPages;
use crate::vm::inode::Inode;
use crate::vm::memory_manager::{MemoryManager, MmGuard};
use crate::vm::physical_page::{FramePool, PhysicalPage};
use crate::vm::region_arena::RegionHandle;

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

impl VmObjectId {
    fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// What backs the object
pub(crate) enum VmObjectKind {
    Anonymous,
    Inode { inode: Arc<dyn Inode>, shared: bool },
}

/// Mutable state guarded by the object lock
pub(crate) struct VmObjectState {
    pub(crate) physical_pages: Vec<Option<PhysicalPage>>,
    /// Pages that must be copied before the next write (anonymous only)
    pub(crate) cow_map: Option<BitVec>,
    /// Committed pages not yet realized (anonymous only)
    pub(crate) unused_committed_pages: usize,
    /// Reserve shared with clones for CoW copies (anonymous only)
    pub(crate) shared_committed_cow_pages: Option<Arc<CommittedCowPages>>,
    /// Pages written since they were read in (inode only)
    pub(crate) dirty_pages: BitVec,
}

impl VmObjectState {
    pub(crate) fn new(physical_pages: Vec<Option<PhysicalPage>>) -> Self {
        Self {
            physical_pages,
            cow_map: None,
            unused_committed_pages: 0,
            shared_committed_cow_pages: None,
            dirty_pages: BitVec::new(),
        }
    }
}

// ============================================================================
// VM Object
// ============================================================================

/// Page array shared by every region mapping it
pub struct VmObject {
    id: VmObjectId,
    kind: VmObjectKind,
    page_count: usize,
    pool: Arc<FramePool>,
    state: Mutex<VmObjectState>,
    regions: Mutex<BTreeSet<RegionHandle>>,
}

impl VmObject {
    pub(crate) fn from_parts(
        mm: &MemoryManager,
        kind: VmObjectKind,
        state: VmObjectState,
    ) -> Arc<Self> {
        let object = Arc::new(Self {
            id: VmObjectId::next(),
            kind,
            page_count: state.physical_pages.len(),
            pool: Arc::clone(mm.pool()),
            state: Mutex::new(state),
            regions: Mutex::new(BTreeSet::new()),
        });
        fault_trace!(
            "VmObject {:?}: created with {} pages",
            object.id,
            object.page_count
        );
        object
    }

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.kind, VmObjectKind::Anonymous)
    }

    pub fn is_inode(&self) -> bool {
        matches!(self.kind, VmObjectKind::Inode { .. })
    }

    pub fn is_shared_inode(&self) -> bool {
        matches!(self.kind, VmObjectKind::Inode { shared: true, .. })
    }

    pub fn is_private_inode(&self) -> bool {
        matches!(self.kind, VmObjectKind::Inode { shared: false, .. })
    }

    /// The backing inode of an inode object
    pub fn inode(&self) -> Option<&Arc<dyn Inode>> {
        match &self.kind {
            VmObjectKind::Inode { inode, .. } => Some(inode),
            VmObjectKind::Anonymous => None,
        }
    }

    /// Lock the page array. Requires the global MM lock.
    pub fn lock<'a>(&'a self, mm: &'a MmGuard<'a>) -> VmObjectGuard<'a> {
        mm.order().acquire(LockRank::VmObject);
        VmObjectGuard {
            object: self,
            state: self.state.lock(),
            mm,
        }
    }

    // ------------------------------------------------------------------------
    // Region back-references
    // ------------------------------------------------------------------------

    pub(crate) fn add_region(&self, handle: RegionHandle) {
        let inserted = self.regions.lock().insert(handle);
        debug_assert!(inserted, "region {:?} added twice", handle);
    }

    pub(crate) fn remove_region(&self, handle: RegionHandle) {
        self.regions.lock().remove(&handle);
    }

    /// Handles of every region currently mapping this object
    pub fn regions(&self) -> Vec<RegionHandle> {
        self.regions.lock().iter().copied().collect()
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    // ------------------------------------------------------------------------
    // Unlocked queries
    // ------------------------------------------------------------------------

    /// Current content of slot `page_index`
    pub fn physical_page(&self, page_index: usize) -> Option<PhysicalPage> {
        self.state.lock().physical_pages.get(page_index)?.clone()
    }

    /// Number of pages still marked copy-on-write
    pub fn cow_pages(&self) -> usize {
        self.state
            .lock()
            .cow_map
            .as_ref()
            .map_or(0, |map| map.count_ones())
    }

    /// Would a write to `page_index` through a mapping with the given
    /// sharing mode have to copy or realize the page first?
    pub fn should_cow(&self, page_index: usize, is_shared: bool) -> bool {
        let state = self.state.lock();
        should_cow_in(&self.kind, &state, page_index, is_shared)
    }

    /// Committed pages this object has not realized yet
    pub fn unused_committed_pages(&self) -> usize {
        self.state.lock().unused_committed_pages
    }

    /// Run `f` on the object state under the object lock alone
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&VmObjectState) -> R) -> R {
        f(&self.state.lock())
    }

    pub(crate) fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub(crate) fn kind(&self) -> &VmObjectKind {
        &self.kind
    }
}

pub(crate) fn should_cow_in(
    kind: &VmObjectKind,
    state: &VmObjectState,
    page_index: usize,
    is_shared: bool,
) -> bool {
    if !matches!(kind, VmObjectKind::Anonymous) {
        return false;
    }
    if let Some(Some(page)) = state.physical_pages.get(page_index) {
        if page.is_sentinel() {
            return true;
        }
    }
    if is_shared {
        return false;
    }
    state
        .cow_map
        .as_ref()
        .and_then(|map| map.get(page_index).map(|bit| *bit))
        .unwrap_or(false)
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.unused_committed_pages > 0 {
            self.pool.uncommit(state.unused_committed_pages);
            state.unused_committed_pages = 0;
        }
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self.kind {
            VmObjectKind::Anonymous => "anonymous",
            VmObjectKind::Inode { shared: true, .. } => "shared-inode",
            VmObjectKind::Inode { shared: false, .. } => "private-inode",
        };
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("page_count", &self.page_count)
            .finish()
    }
}

// ============================================================================
// Object Lock Guard
// ============================================================================

/// Locked access to an object's pages
pub struct VmObjectGuard<'a> {
    object: &'a VmObject,
    pub(crate) state: MutexGuard<'a, VmObjectState>,
    mm: &'a MmGuard<'a>,
}

impl<'a> VmObjectGuard<'a> {
    pub fn object(&self) -> &'a VmObject {
        self.object
    }

    /// The MM lock this guard was taken under
    pub fn mm_guard(&self) -> &'a MmGuard<'a> {
        self.mm
    }

    pub fn memory_manager(&self) -> &'a MemoryManager {
        self.mm.memory_manager()
    }

    pub fn physical_pages(&self) -> &[Option<PhysicalPage>] {
        &self.state.physical_pages
    }

    pub fn physical_pages_mut(&mut self) -> &mut [Option<PhysicalPage>] {
        &mut self.state.physical_pages
    }

    pub fn physical_page(&self, page_index: usize) -> Option<&PhysicalPage> {
        self.state.physical_pages.get(page_index)?.as_ref()
    }

    /// Replace slot `page_index`, returning what it held
    pub fn set_physical_page(
        &mut self,
        page_index: usize,
        page: Option<PhysicalPage>,
    ) -> Option<PhysicalPage> {
        core::mem::replace(&mut self.state.physical_pages[page_index], page)
    }

    pub fn should_cow(&self, page_index: usize, is_shared: bool) -> bool {
        should_cow_in(&self.object.kind, &self.state, page_index, is_shared)
    }

    /// Run `f` for every region mapping this object
    pub fn for_each_region(&self, mut f: impl FnMut(RegionHandle)) {
        for handle in self.object.regions() {
            f(handle);
        }
    }
}

impl Drop for VmObjectGuard<'_> {
    fn drop(&mut self) {
        self.mm.order().release(LockRank::VmObject);
    }
}

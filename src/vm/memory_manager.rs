//! Memory Manager - Global VM Facade
//!
//! The memory manager ties the collaborators of the region code together:
//!
//! - the user frame pool with commit accounting
//! - the shared zero page and the lazy-committed page
//! - TLB invalidation through the [`Platform`]
//! - page directory creation
//! - the region arena used for VMObject back-references
//! - the global ordering lock
//!
//! ## Global Lock
//!
//! [`MemoryManager::lock`] returns an [`MmGuard`]. It is the first lock of the
//! total order (MM -> VMObject -> PageDirectory) and the token both
//! [`crate::vm::VmObject::lock`] and [`PageDirectory::lock`] require.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::config::{PAGE_SIZE, USER_RANGE_BASE, USER_RANGE_CEILING};
use crate::error::{Result, VmError};
use crate::sync::LockOrder;
use crate::vm::address::{Range, VirtualAddress};
use crate::vm::page_directory::{PageDirectory, PageDirectoryId};
use crate::vm::physical_memory::{HeapPhysicalMemory, HostedPlatform, PhysicalMemory, Platform};
use crate::vm::physical_page::{FramePool, PageAccounting, PageKind, PhysicalPage, ShouldZeroFill};
use crate::vm::region_arena::RegionArena;
use crate::vm::vm_fault::FaultStats;

// ============================================================================
// Configuration
// ============================================================================

/// Runtime layout of new address spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryManagerConfig {
    /// Range handed out by each directory's range allocator
    pub user_range: Range,
    /// Range handed out by each directory's identity range allocator
    pub identity_range: Range,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            user_range: Range::new(
                VirtualAddress::new(USER_RANGE_BASE),
                USER_RANGE_CEILING - USER_RANGE_BASE,
            ),
            // Page 0 stays unmapped to catch null dereferences
            identity_range: Range::new(VirtualAddress::new(PAGE_SIZE), USER_RANGE_BASE - PAGE_SIZE),
        }
    }
}

/// Snapshot of memory manager usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// User frame accounting
    pub physical: PageAccounting,
    /// Live regions
    pub regions: usize,
}

// ============================================================================
// Memory Manager
// ============================================================================

/// Global facade for physical pages, TLB flushing and the ordering lock
pub struct MemoryManager {
    lock: Mutex<()>,
    config: MemoryManagerConfig,
    pool: Arc<FramePool>,
    platform: Arc<dyn Platform>,
    shared_zero_page: PhysicalPage,
    lazy_committed_page: PhysicalPage,
    regions: RegionArena,
    next_directory_id: AtomicU64,
    fault_stats: FaultStats,
}

impl MemoryManager {
    /// Create a memory manager over `memory`.
    ///
    /// Fails when the two sentinel pages cannot be allocated.
    pub fn new(
        config: MemoryManagerConfig,
        memory: Arc<dyn PhysicalMemory>,
        platform: Arc<dyn Platform>,
    ) -> Result<Arc<Self>> {
        let pool = FramePool::new(memory);
        let shared_zero_page = pool
            .allocate_sentinel(PageKind::SharedZero)
            .ok_or(VmError::OutOfMemory)?;
        let lazy_committed_page = pool
            .allocate_sentinel(PageKind::LazyCommitted)
            .ok_or(VmError::OutOfMemory)?;

        log::info!(
            "MM: {} user physical pages available, zero page at {}, lazy page at {}",
            pool.accounting().total,
            shared_zero_page.paddr(),
            lazy_committed_page.paddr()
        );

        Ok(Arc::new(Self {
            lock: Mutex::new(()),
            config,
            pool,
            platform,
            shared_zero_page,
            lazy_committed_page,
            regions: RegionArena::new(),
            // PageDirectoryId::KERNEL is reserved
            next_directory_id: AtomicU64::new(PageDirectoryId::KERNEL.0 + 1),
            fault_stats: FaultStats::new(),
        }))
    }

    /// Hosted memory manager with `frame_count` heap frames and NX support
    pub fn hosted(frame_count: usize) -> Arc<Self> {
        let memory = Arc::new(HeapPhysicalMemory::new(frame_count));
        let platform = Arc::new(HostedPlatform::new(true));
        match Self::new(MemoryManagerConfig::default(), memory, platform) {
            Ok(mm) => mm,
            Err(e) => panic!("hosted memory manager needs at least two frames: {}", e),
        }
    }

    /// Acquire the global ordering lock
    pub fn lock(&self) -> MmGuard<'_> {
        MmGuard {
            mm: self,
            _guard: self.lock.lock(),
            order: LockOrder::new(),
        }
    }

    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    /// Frame contents access (physmap)
    pub fn physical_memory(&self) -> &dyn PhysicalMemory {
        self.pool.memory()
    }

    pub(crate) fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub(crate) fn regions(&self) -> &RegionArena {
        &self.regions
    }

    pub fn fault_stats(&self) -> &FaultStats {
        &self.fault_stats
    }

    // ------------------------------------------------------------------------
    // Physical pages
    // ------------------------------------------------------------------------

    /// Allocate a page outside any commitment. Never blocks; `None` on OOM.
    pub fn allocate_user_physical_page(&self, zero_fill: ShouldZeroFill) -> Option<PhysicalPage> {
        self.pool.allocate(zero_fill)
    }

    /// Reserve `page_count` pages for later committed allocations
    pub fn commit_user_physical_pages(&self, page_count: usize) -> bool {
        self.pool.commit(page_count)
    }

    /// Drop a reservation
    pub fn uncommit_user_physical_pages(&self, page_count: usize) {
        self.pool.uncommit(page_count)
    }

    /// Realize one previously committed page
    pub fn allocate_committed_user_physical_page(
        &self,
        zero_fill: ShouldZeroFill,
    ) -> Option<PhysicalPage> {
        self.pool.allocate_committed(zero_fill)
    }

    pub fn shared_zero_page(&self) -> PhysicalPage {
        self.shared_zero_page.clone()
    }

    pub fn lazy_committed_page(&self) -> PhysicalPage {
        self.lazy_committed_page.clone()
    }

    // ------------------------------------------------------------------------
    // Address spaces
    // ------------------------------------------------------------------------

    /// Create an empty address space
    pub fn create_page_directory(&self) -> Arc<PageDirectory> {
        let id = PageDirectoryId(self.next_directory_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(PageDirectory::new(id, &self.config))
    }

    /// Create the address space of a forked child. Its range allocators
    /// start as copies of `parent`'s, so ranges of cloned regions are
    /// already allocated there.
    pub fn create_page_directory_from(&self, parent: &PageDirectory) -> Arc<PageDirectory> {
        let id = PageDirectoryId(self.next_directory_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(PageDirectory::new_from_parent(id, parent))
    }

    /// Invalidate `page_count` translations starting at `vaddr`
    pub fn flush_tlb(&self, directory: &PageDirectory, vaddr: VirtualAddress, page_count: usize) {
        self.platform.flush_tlb(directory.id(), vaddr, page_count);
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            physical: self.pool.accounting(),
            regions: self.regions.len(),
        }
    }
}

impl core::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// MM Lock Guard
// ============================================================================

/// Proof that the global MM lock is held
pub struct MmGuard<'a> {
    mm: &'a MemoryManager,
    _guard: MutexGuard<'a, ()>,
    order: LockOrder,
}

impl<'a> MmGuard<'a> {
    pub fn memory_manager(&self) -> &'a MemoryManager {
        self.mm
    }

    /// Lock ranks taken under this acquisition
    pub(crate) fn order(&self) -> &LockOrder {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        let mm = MemoryManager::hosted(8);
        assert!(mm.shared_zero_page().is_shared_zero_page());
        assert!(mm.lazy_committed_page().is_lazy_committed_page());
        assert_ne!(mm.shared_zero_page().paddr(), mm.lazy_committed_page().paddr());
        assert_eq!(mm.stats().physical.total, 6);
    }

    #[test]
    fn test_new_fails_without_sentinel_frames() {
        let memory = Arc::new(HeapPhysicalMemory::new(1));
        let platform = Arc::new(HostedPlatform::new(false));
        let result = MemoryManager::new(MemoryManagerConfig::default(), memory, platform);
        assert_eq!(result.err(), Some(VmError::OutOfMemory));
    }

    #[test]
    fn test_allocation_until_exhausted() {
        let mm = MemoryManager::hosted(4);
        let a = mm.allocate_user_physical_page(ShouldZeroFill::Yes);
        let b = mm.allocate_user_physical_page(ShouldZeroFill::No);
        assert!(a.is_some() && b.is_some());
        assert!(mm.allocate_user_physical_page(ShouldZeroFill::Yes).is_none());
        drop(a);
        assert!(mm.allocate_user_physical_page(ShouldZeroFill::Yes).is_some());
    }

    #[test]
    fn test_commit_accounting() {
        let mm = MemoryManager::hosted(6);
        assert!(mm.commit_user_physical_pages(3));
        assert_eq!(mm.stats().physical.committed, 3);
        let page = mm
            .allocate_committed_user_physical_page(ShouldZeroFill::Yes)
            .unwrap();
        assert_eq!(mm.stats().physical.committed, 2);
        assert_eq!(mm.stats().physical.used, 1);
        mm.uncommit_user_physical_pages(2);
        drop(page);
        assert_eq!(mm.stats().physical, PageAccounting { total: 4, used: 0, committed: 0 });
    }

    #[test]
    fn test_page_directories_get_distinct_ids() {
        let mm = MemoryManager::hosted(4);
        let a = mm.create_page_directory();
        let b = mm.create_page_directory();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), PageDirectoryId::KERNEL);
        assert!(a.range_allocator().contains(&mm.config().user_range));
    }
}

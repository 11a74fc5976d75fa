//! Region - Virtual Range Bound to a VMObject
//!
//! A region maps `[vaddr, vaddr + size)` of one address space onto a window
//! of a [`VmObject`] starting at `offset_in_vmobject`. It owns no pages: the
//! object does, and many regions (threads of one process, or processes that
//! share memory or were forked) may map the same object.
//!
//! ## Install Rule
//!
//! For page `i` the PTE is cleared when the object slot is empty or the
//! region is neither readable nor writable. Otherwise it points at the page
//! with:
//! - writable only if the region is writable, the page is not a sentinel
//!   and the page is not copy-on-write for this region
//! - execute-disable when the CPU supports NX and the region is not
//!   executable
//! - cache-disable when the region is not cacheable
//! - user access only for user regions above [`USER_RANGE_BASE`]
//!
//! ## Broadcast Remap
//!
//! Whenever an object slot changes, [`remap_vmobject_page`] rewrites the PTE
//! of that page in every region mapping the object and flushes each affected
//! TLB entry, all while the object lock is held.

use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use spin::Mutex;

use crate::config::{
    is_user_address, PAGE_SIZE, PAGE_TABLE_SPAN, REGION_NAME_CAPACITY, USER_RANGE_BASE,
};
use crate::error::{Result, VmError};
use crate::vm::address::{Range, VirtualAddress};
use crate::vm::memory_manager::{MemoryManager, MmGuard};
use crate::vm::page_directory::{PageDirectory, PageDirectoryGuard};
use crate::vm::physical_page::PhysicalPage;
use crate::vm::region_arena::RegionHandle;
use crate::vm::vm_object::{VmObject, VmObjectGuard};

bitflags! {
    /// Region access rights
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
    }
}

/// Human-readable region name, truncated to [`REGION_NAME_CAPACITY`] bytes
pub type RegionName = heapless::String<REGION_NAME_CAPACITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheable {
    No,
    Yes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldFlushTlb {
    No,
    Yes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldDeallocateVirtualMemoryRange {
    No,
    Yes,
}

fn region_name(name: &str) -> RegionName {
    let mut truncated = RegionName::new();
    for c in name.chars() {
        if truncated.push(c).is_err() {
            break;
        }
    }
    truncated
}

// ============================================================================
// Region State
// ============================================================================

/// Mutable region fields. The lock is a leaf.
struct RegionState {
    vmobject: Arc<VmObject>,
    access: Access,
    cacheable: bool,
    shared: bool,
    stack: bool,
    mmap: bool,
    name: RegionName,
    page_directory: Option<Arc<PageDirectory>>,
}

/// Snapshot of the fields the install rule reads
#[derive(Debug, Clone, Copy)]
pub(crate) struct MappingAttributes {
    pub(crate) access: Access,
    pub(crate) cacheable: bool,
    pub(crate) shared: bool,
    pub(crate) mmap: bool,
}

/// The part of a region reachable from the arena
pub(crate) struct RegionInner {
    range: Range,
    offset_in_vmobject: usize,
    user: bool,
    state: Mutex<RegionState>,
}

impl RegionInner {
    pub(crate) fn attributes(&self) -> MappingAttributes {
        let state = self.state.lock();
        MappingAttributes {
            access: state.access,
            cacheable: state.cacheable,
            shared: state.shared,
            mmap: state.mmap,
        }
    }

    pub(crate) fn vmobject(&self) -> Arc<VmObject> {
        Arc::clone(&self.state.lock().vmobject)
    }

    pub(crate) fn page_directory(&self) -> Option<Arc<PageDirectory>> {
        self.state.lock().page_directory.clone()
    }

    pub(crate) fn page_count(&self) -> usize {
        self.range.page_count()
    }

    pub(crate) fn first_page_index(&self) -> usize {
        self.offset_in_vmobject / PAGE_SIZE
    }

    pub(crate) fn vaddr_from_page_index(&self, page_index: usize) -> VirtualAddress {
        self.range.base().offset(page_index * PAGE_SIZE)
    }

    pub(crate) fn page_index_from_address(&self, vaddr: VirtualAddress) -> usize {
        (vaddr.get() - self.range.base().get()) / PAGE_SIZE
    }

    pub(crate) fn translate_to_vmobject_page(&self, page_index: usize) -> usize {
        self.first_page_index() + page_index
    }

    /// Page index in this region of object page `vmobject_page_index`, if
    /// the region's window covers it
    pub(crate) fn translate_vmobject_page(&self, vmobject_page_index: usize) -> Option<usize> {
        let page_index = vmobject_page_index.checked_sub(self.first_page_index())?;
        (page_index < self.page_count()).then_some(page_index)
    }

    /// Install the PTE of one page according to the install rule
    fn map_individual_page(
        &self,
        object: &VmObjectGuard<'_>,
        tables: &mut PageDirectoryGuard<'_>,
        page_index: usize,
    ) -> Result<()> {
        let attributes = self.attributes();
        let page_vaddr = self.vaddr_from_page_index(page_index);
        let user_allowed =
            self.user && page_vaddr.get() >= USER_RANGE_BASE && is_user_address(page_vaddr);
        if attributes.mmap && !user_allowed {
            log::error!("Region: about to map mmap'ed page at kernel address {}", page_vaddr);
            return Err(VmError::KernelAddressInUserMapping {
                vaddr: page_vaddr.get(),
            });
        }
        let has_nx = tables.memory_manager().platform().has_nx();
        let vmobject_page_index = self.translate_to_vmobject_page(page_index);
        let page = object.physical_page(vmobject_page_index);
        let readable_or_writable = attributes.access.intersects(Access::READ | Access::WRITE);
        let cow = object.should_cow(vmobject_page_index, attributes.shared);

        let Some(pte) = tables.ensure_pte(page_vaddr) else {
            log::warn!("Region: unable to allocate a page table to map {}", page_vaddr);
            return Err(VmError::OutOfMemory);
        };
        match page {
            Some(page) if readable_or_writable => {
                pte.set_cache_disabled(!attributes.cacheable);
                pte.set_physical_page_base(page.paddr());
                pte.set_present(true);
                pte.set_writable(
                    attributes.access.contains(Access::WRITE) && !page.is_sentinel() && !cow,
                );
                if has_nx {
                    pte.set_execute_disabled(!attributes.access.contains(Access::EXECUTE));
                }
                pte.set_user_allowed(user_allowed);
            }
            _ => pte.clear(),
        }
        Ok(())
    }

    /// Install every page into `tables`, stopping at the first failure
    fn map_pages(
        &self,
        object: &VmObjectGuard<'_>,
        tables: &mut PageDirectoryGuard<'_>,
        should_flush_tlb: ShouldFlushTlb,
    ) -> Result<()> {
        let count = self.page_count();
        let mut mapped = 0;
        let mut result = Ok(());
        while mapped < count {
            if let Err(e) = self.map_individual_page(object, tables, mapped) {
                result = Err(e);
                break;
            }
            mapped += 1;
        }
        if mapped > 0 && should_flush_tlb == ShouldFlushTlb::Yes {
            tables
                .memory_manager()
                .flush_tlb(tables.directory(), self.range.base(), mapped);
        }
        result
    }

    /// Rewrite the PTE of object page `vmobject_page_index` if this region
    /// is mapped and covers it
    fn remap_vmobject_page_locked(&self, object: &VmObjectGuard<'_>, vmobject_page_index: usize) -> bool {
        let Some(directory) = self.page_directory() else {
            return true;
        };
        let Some(page_index) = self.translate_vmobject_page(vmobject_page_index) else {
            return true;
        };
        let success = {
            let mut tables = directory.lock(object.mm_guard());
            self.map_individual_page(object, &mut tables, page_index).is_ok()
        };
        object
            .memory_manager()
            .flush_tlb(&directory, self.vaddr_from_page_index(page_index), 1);
        success
    }

    /// Rewrite every PTE of this region if it is mapped
    fn remap_locked(&self, object: &VmObjectGuard<'_>) -> Result<()> {
        let Some(directory) = self.page_directory() else {
            return Ok(());
        };
        let mut tables = directory.lock(object.mm_guard());
        self.map_pages(object, &mut tables, ShouldFlushTlb::Yes)
    }

    fn unmap_locked(&self, mm: &MmGuard<'_>, deallocate_range: ShouldDeallocateVirtualMemoryRange) {
        let Some(directory) = self.page_directory() else {
            return;
        };
        let count = self.page_count();
        {
            let mut tables = directory.lock(mm);
            for page_index in 0..count {
                let vaddr = self.vaddr_from_page_index(page_index);
                let table_end = (vaddr.get() + PAGE_SIZE) % PAGE_TABLE_SPAN == 0;
                tables.release_pte(vaddr, table_end || page_index == count - 1);
            }
        }
        mm.memory_manager()
            .flush_tlb(&directory, self.range.base(), count);

        if deallocate_range == ShouldDeallocateVirtualMemoryRange::Yes {
            let in_range_allocator = directory.range_allocator().contains(&self.range);
            let in_identity_range_allocator =
                !in_range_allocator && directory.identity_range_allocator().contains(&self.range);
            if in_range_allocator {
                directory.range_allocator().deallocate(self.range);
            } else if in_identity_range_allocator {
                directory.identity_range_allocator().deallocate(self.range);
            }
        }
        self.state.lock().page_directory = None;
    }
}

// ============================================================================
// Broadcast
// ============================================================================

/// Re-install object page `vmobject_page_index` in every region mapping the
/// object. Returns false if any region failed to map it.
pub(crate) fn remap_vmobject_page(object: &VmObjectGuard<'_>, vmobject_page_index: usize) -> bool {
    let regions = object.memory_manager().regions();
    let mut success = true;
    object.for_each_region(|handle| {
        if let Some(region) = regions.get(handle) {
            if !region.remap_vmobject_page_locked(object, vmobject_page_index) {
                success = false;
            }
        }
    });
    success
}

/// Re-install every page of every region mapping the object
pub(crate) fn remap_all_regions(object: &VmObjectGuard<'_>) {
    let regions = object.memory_manager().regions();
    object.for_each_region(|handle| {
        if let Some(region) = regions.get(handle) {
            if let Err(e) = region.remap_locked(object) {
                log::warn!("Region {}: remap failed: {}", region.range, e);
            }
        }
    });
}

// ============================================================================
// Region
// ============================================================================

/// A virtual range of one address space backed by a VMObject.
///
/// Owned by exactly one address space. Dropping a region that is still
/// mapped unmaps it and returns its range.
pub struct Region {
    handle: RegionHandle,
    inner: Arc<RegionInner>,
    mm: Arc<MemoryManager>,
}

impl Region {
    /// Create a region user code can access (subject to the user range)
    #[allow(clippy::too_many_arguments)]
    pub fn create_user_accessible(
        mm: &Arc<MemoryManager>,
        range: Range,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: usize,
        name: &str,
        access: Access,
        cacheable: Cacheable,
        shared: bool,
    ) -> Result<Region> {
        let state = RegionState {
            vmobject,
            access,
            cacheable: cacheable == Cacheable::Yes,
            shared,
            stack: false,
            mmap: false,
            name: region_name(name),
            page_directory: None,
        };
        Self::create(mm, range, offset_in_vmobject, true, state)
    }

    /// Create a region only the kernel can access
    pub fn create_kernel_only(
        mm: &Arc<MemoryManager>,
        range: Range,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: usize,
        name: &str,
        access: Access,
        cacheable: Cacheable,
    ) -> Result<Region> {
        let state = RegionState {
            vmobject,
            access,
            cacheable: cacheable == Cacheable::Yes,
            shared: false,
            stack: false,
            mmap: false,
            name: region_name(name),
            page_directory: None,
        };
        Self::create(mm, range, offset_in_vmobject, false, state)
    }

    fn create(
        mm: &Arc<MemoryManager>,
        range: Range,
        offset_in_vmobject: usize,
        user: bool,
        state: RegionState,
    ) -> Result<Region> {
        if range.is_empty() || !range.base().is_page_aligned() || offset_in_vmobject % PAGE_SIZE != 0 {
            return Err(VmError::MisalignedRange);
        }
        let end_in_vmobject = offset_in_vmobject
            .checked_add(range.size())
            .ok_or(VmError::OutOfBounds)?;
        if end_in_vmobject > state.vmobject.size() {
            return Err(VmError::OutOfBounds);
        }

        let vmobject = Arc::clone(&state.vmobject);
        let inner = Arc::new(RegionInner {
            range,
            offset_in_vmobject,
            user,
            state: Mutex::new(state),
        });
        let handle = mm.regions().insert(Arc::clone(&inner));
        vmobject.add_region(handle);
        Ok(Region {
            handle,
            inner,
            mm: Arc::clone(mm),
        })
    }

    pub fn handle(&self) -> RegionHandle {
        self.handle
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.mm
    }

    // ------------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------------

    pub fn range(&self) -> Range {
        self.inner.range
    }

    pub fn vaddr(&self) -> VirtualAddress {
        self.inner.range.base()
    }

    pub fn size(&self) -> usize {
        self.inner.range.size()
    }

    pub fn page_count(&self) -> usize {
        self.inner.page_count()
    }

    pub fn offset_in_vmobject(&self) -> usize {
        self.inner.offset_in_vmobject
    }

    /// Index of the region's first page within its object
    pub fn first_page_index(&self) -> usize {
        self.inner.first_page_index()
    }

    pub fn last_page_index(&self) -> usize {
        self.first_page_index() + self.page_count() - 1
    }

    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        self.inner.range.contains(vaddr)
    }

    pub fn contains_range(&self, range: &Range) -> bool {
        self.inner.range.contains_range(range)
    }

    pub fn page_index_from_address(&self, vaddr: VirtualAddress) -> usize {
        self.inner.page_index_from_address(vaddr)
    }

    pub fn vaddr_from_page_index(&self, page_index: usize) -> VirtualAddress {
        self.inner.vaddr_from_page_index(page_index)
    }

    pub fn translate_to_vmobject_page(&self, page_index: usize) -> usize {
        self.inner.translate_to_vmobject_page(page_index)
    }

    pub fn translate_vmobject_page(&self, vmobject_page_index: usize) -> Option<usize> {
        self.inner.translate_vmobject_page(vmobject_page_index)
    }

    // ------------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------------

    pub fn access(&self) -> Access {
        self.inner.state.lock().access
    }

    pub fn is_readable(&self) -> bool {
        self.access().contains(Access::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.access().contains(Access::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.access().contains(Access::EXECUTE)
    }

    /// Takes effect on the next `map` or `remap`
    pub fn set_readable(&self, b: bool) {
        self.inner.state.lock().access.set(Access::READ, b);
    }

    /// Takes effect on the next `map` or `remap`
    pub fn set_writable(&self, b: bool) {
        self.inner.state.lock().access.set(Access::WRITE, b);
    }

    /// Takes effect on the next `map` or `remap`
    pub fn set_executable(&self, b: bool) {
        self.inner.state.lock().access.set(Access::EXECUTE, b);
    }

    pub fn is_cacheable(&self) -> bool {
        self.inner.state.lock().cacheable
    }

    pub fn is_shared(&self) -> bool {
        self.inner.state.lock().shared
    }

    pub fn set_shared(&self, shared: bool) {
        self.inner.state.lock().shared = shared;
    }

    pub fn is_user(&self) -> bool {
        self.inner.user
    }

    pub fn is_kernel(&self) -> bool {
        !self.inner.user
    }

    pub fn is_stack(&self) -> bool {
        self.inner.state.lock().stack
    }

    pub fn set_stack(&self, stack: bool) {
        self.inner.state.lock().stack = stack;
    }

    pub fn is_mmap(&self) -> bool {
        self.inner.state.lock().mmap
    }

    pub fn set_mmap(&self, mmap: bool) {
        self.inner.state.lock().mmap = mmap;
    }

    pub fn name(&self) -> RegionName {
        self.inner.state.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.inner.state.lock().name = region_name(name);
    }

    // ------------------------------------------------------------------------
    // Backing object
    // ------------------------------------------------------------------------

    pub fn vmobject(&self) -> Arc<VmObject> {
        self.inner.vmobject()
    }

    /// Rebind the region to another object covering its window
    pub fn set_vmobject(&self, vmobject: Arc<VmObject>) -> Result<()> {
        let old = self.vmobject();
        if Arc::ptr_eq(&old, &vmobject) {
            return Ok(());
        }
        if self.inner.offset_in_vmobject + self.size() > vmobject.size() {
            return Err(VmError::OutOfBounds);
        }
        old.remove_region(self.handle);
        vmobject.add_region(self.handle);
        self.inner.state.lock().vmobject = vmobject;
        Ok(())
    }

    pub fn physical_page(&self, page_index: usize) -> Option<PhysicalPage> {
        self.vmobject()
            .physical_page(self.translate_to_vmobject_page(page_index))
    }

    pub fn should_cow(&self, page_index: usize) -> bool {
        self.vmobject()
            .should_cow(self.translate_to_vmobject_page(page_index), self.is_shared())
    }

    /// Mark or unmark a page copy-on-write. Only anonymous objects track CoW.
    pub fn set_should_cow(&self, page_index: usize, cow: bool) -> Result<()> {
        debug_assert!(!self.is_shared());
        let vmobject = self.vmobject();
        if !vmobject.is_anonymous() {
            return Err(VmError::NotAnonymous);
        }
        if page_index >= self.page_count() {
            return Err(VmError::OutOfBounds);
        }
        let guard = self.mm.lock();
        let mut locked = vmobject.lock(&guard);
        locked.set_should_cow(self.translate_to_vmobject_page(page_index), cow);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------------

    /// Bytes of the window backed by real (non-sentinel) pages
    pub fn amount_resident(&self) -> usize {
        self.count_pages(|page| !page.is_sentinel()) * PAGE_SIZE
    }

    /// Bytes of the window backed by real pages someone else also holds
    pub fn amount_shared(&self) -> usize {
        self.count_pages(|page| !page.is_sentinel() && page.ref_count() > 1) * PAGE_SIZE
    }

    pub fn amount_dirty(&self) -> usize {
        let vmobject = self.vmobject();
        if vmobject.is_inode() {
            vmobject.amount_dirty()
        } else {
            self.amount_resident()
        }
    }

    pub fn cow_pages(&self) -> usize {
        let vmobject = self.vmobject();
        if vmobject.is_anonymous() {
            vmobject.cow_pages()
        } else {
            0
        }
    }

    fn count_pages(&self, f: impl Fn(&PhysicalPage) -> bool) -> usize {
        let first = self.first_page_index();
        let count = self.page_count();
        self.vmobject().with_state(|state| {
            state.physical_pages[first..first + count]
                .iter()
                .flatten()
                .filter(|page| f(page))
                .count()
        })
    }

    // ------------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------------

    pub fn page_directory(&self) -> Option<Arc<PageDirectory>> {
        self.inner.page_directory()
    }

    pub fn is_mapped(&self) -> bool {
        self.page_directory().is_some()
    }

    /// Attach the region to `page_directory` and install every page.
    ///
    /// The range must already be allocated in the directory (ranges outside
    /// both of its allocators excepted). Stops at the first page that cannot
    /// be installed. The region stays attached in that case and the caller
    /// must `unmap` it.
    pub fn map(
        &self,
        page_directory: &Arc<PageDirectory>,
        should_flush_tlb: ShouldFlushTlb,
    ) -> Result<()> {
        if !page_directory.is_range_allocated(&self.inner.range) {
            log::warn!(
                "Region {}: range is not allocated in page directory {:?}",
                self,
                page_directory.id()
            );
            return Err(VmError::RangeUnavailable);
        }
        let vmobject = self.vmobject();
        if self.inner.user && !self.is_shared() {
            debug_assert!(!vmobject.is_shared_inode());
        }
        let guard = self.mm.lock();
        let object = vmobject.lock(&guard);
        let mut tables = page_directory.lock(&guard);
        {
            let mut state = self.inner.state.lock();
            debug_assert!(state
                .page_directory
                .as_ref()
                .map_or(true, |current| Arc::ptr_eq(current, page_directory)));
            state.page_directory = Some(Arc::clone(page_directory));
        }
        self.inner.map_pages(&object, &mut tables, should_flush_tlb)
    }

    /// Release every PTE, flush the range and detach from the directory.
    /// Does nothing when the region is not mapped.
    pub fn unmap(&self, deallocate_range: ShouldDeallocateVirtualMemoryRange) {
        let guard = self.mm.lock();
        self.inner.unmap_locked(&guard, deallocate_range);
    }

    /// Re-install every page into the current directory
    pub fn remap(&self) -> Result<()> {
        let Some(directory) = self.page_directory() else {
            debug_assert!(false, "remap of unmapped region {}", self);
            return Ok(());
        };
        self.map(&directory, ShouldFlushTlb::Yes)
    }

    /// Duplicate the region for fork.
    ///
    /// Shared regions map the same object. Private regions get a clone of
    /// the object sharing its pages copy-on-write, and every existing
    /// mapping of the original object is remapped read-only.
    pub fn try_clone(&self) -> Result<Region> {
        let (access, cacheable, shared, stack, mmap, name) = {
            let state = self.inner.state.lock();
            (
                state.access,
                state.cacheable,
                state.shared,
                state.stack,
                state.mmap,
                state.name.clone(),
            )
        };
        let vmobject = self.vmobject();

        let clone_vmobject = if shared {
            debug_assert!(!stack);
            debug_assert!(!vmobject.is_inode() || vmobject.is_shared_inode());
            vmobject
        } else {
            let guard = self.mm.lock();
            let mut locked = vmobject.lock(&guard);
            let clone = locked.try_clone()?;
            remap_all_regions(&locked);
            clone
        };

        let state = RegionState {
            vmobject: clone_vmobject,
            access,
            cacheable,
            shared,
            stack,
            mmap,
            name,
            page_directory: None,
        };
        Self::create(
            &self.mm,
            self.inner.range,
            self.inner.offset_in_vmobject,
            self.inner.user,
            state,
        )
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.vmobject().remove_region(self.handle);
        self.unmap(ShouldDeallocateVirtualMemoryRange::Yes);
        self.mm.regions().remove(self.handle);
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({} {})", self.inner.range, self.name())
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("handle", &self.handle)
            .field("range", &self.inner.range)
            .field("offset_in_vmobject", &self.inner.offset_in_vmobject)
            .field("access", &self.access())
            .field("name", &self.name())
            .finish()
    }
}

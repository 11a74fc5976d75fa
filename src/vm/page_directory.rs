//! Page Directory - Per-Address-Space Page Tables
//!
//! The hardware page-table tree of one address space, reduced to what the
//! region code needs: entries addressed by virtual page, leaf tables
//! allocated on demand from the frame pool, and the two virtual range
//! allocators of the address space.
//!
//! ## Locking
//!
//! The tables are only reachable through a [`PageDirectoryGuard`], which can
//! only be created while holding the global MM lock. The range allocators
//! have their own leaf locks since mmap/munmap allocate ranges without
//! touching any table.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::config::{PAGE_SHIFT, PAGE_TABLE_ENTRIES};
use crate::sync::LockRank;
use crate::vm::address::{PhysicalAddress, Range, VirtualAddress};
use crate::vm::memory_manager::{MemoryManager, MemoryManagerConfig, MmGuard};
use crate::vm::physical_page::{PhysicalPage, ShouldZeroFill};
use crate::vm::range_allocator::RangeAllocator;

/// Page directory identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageDirectoryId(pub u64);

impl PageDirectoryId {
    pub const KERNEL: Self = Self(1);
}

// ============================================================================
// Page Table Entry
// ============================================================================

bitflags! {
    /// Page table entry attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PteFlags: u8 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER_ALLOWED = 1 << 2;
        const CACHE_DISABLED = 1 << 3;
        const EXECUTE_DISABLED = 1 << 4;
    }
}

/// One virtual-to-physical translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry {
    physical_page_base: PhysicalAddress,
    flags: PteFlags,
}

impl PageTableEntry {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn physical_page_base(&self) -> PhysicalAddress {
        self.physical_page_base
    }

    pub fn set_physical_page_base(&mut self, paddr: PhysicalAddress) {
        self.physical_page_base = paddr;
    }

    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    pub fn is_present(&self) -> bool {
        self.flags.contains(PteFlags::PRESENT)
    }

    pub fn set_present(&mut self, b: bool) {
        self.flags.set(PteFlags::PRESENT, b);
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    pub fn set_writable(&mut self, b: bool) {
        self.flags.set(PteFlags::WRITABLE, b);
    }

    pub fn is_user_allowed(&self) -> bool {
        self.flags.contains(PteFlags::USER_ALLOWED)
    }

    pub fn set_user_allowed(&mut self, b: bool) {
        self.flags.set(PteFlags::USER_ALLOWED, b);
    }

    pub fn is_cache_disabled(&self) -> bool {
        self.flags.contains(PteFlags::CACHE_DISABLED)
    }

    pub fn set_cache_disabled(&mut self, b: bool) {
        self.flags.set(PteFlags::CACHE_DISABLED, b);
    }

    pub fn is_execute_disabled(&self) -> bool {
        self.flags.contains(PteFlags::EXECUTE_DISABLED)
    }

    pub fn set_execute_disabled(&mut self, b: bool) {
        self.flags.set(PteFlags::EXECUTE_DISABLED, b);
    }
}

// ============================================================================
// Page Tables
// ============================================================================

struct PageTable {
    /// Frame holding the table itself
    _frame: PhysicalPage,
    entries: Box<[PageTableEntry]>,
}

impl PageTable {
    fn new(frame: PhysicalPage) -> Self {
        Self {
            _frame: frame,
            entries: vec![PageTableEntry::default(); PAGE_TABLE_ENTRIES].into_boxed_slice(),
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(|pte| !pte.is_present())
    }
}

fn table_index(vaddr: VirtualAddress) -> usize {
    vaddr.get() >> PAGE_SHIFT >> PAGE_TABLE_ENTRIES.trailing_zeros()
}

fn entry_index(vaddr: VirtualAddress) -> usize {
    (vaddr.get() >> PAGE_SHIFT) & (PAGE_TABLE_ENTRIES - 1)
}

// ============================================================================
// Page Directory
// ============================================================================

/// Whether `allocator` has handed out all of `range`, if it manages it
fn allocated_in(allocator: &RangeAllocator, range: &Range) -> Option<bool> {
    allocator
        .contains(range)
        .then(|| !allocator.available().iter().any(|free| free.intersects(range)))
}

/// Page tables and virtual range allocators of one address space
pub struct PageDirectory {
    id: PageDirectoryId,
    tables: Mutex<BTreeMap<usize, PageTable>>,
    range_allocator: Mutex<RangeAllocator>,
    identity_range_allocator: Mutex<RangeAllocator>,
}

impl PageDirectory {
    pub(crate) fn new(id: PageDirectoryId, config: &MemoryManagerConfig) -> Self {
        Self {
            id,
            tables: Mutex::new(BTreeMap::new()),
            range_allocator: Mutex::new(RangeAllocator::new(
                config.user_range.base(),
                config.user_range.size(),
            )),
            identity_range_allocator: Mutex::new(RangeAllocator::new(
                config.identity_range.base(),
                config.identity_range.size(),
            )),
        }
    }

    /// Address space for a forked child: no tables yet, but both range
    /// allocators start out as copies of `parent`'s
    pub(crate) fn new_from_parent(id: PageDirectoryId, parent: &PageDirectory) -> Self {
        let range_allocator = parent.range_allocator().clone();
        let identity_range_allocator = parent.identity_range_allocator().clone();
        Self {
            id,
            tables: Mutex::new(BTreeMap::new()),
            range_allocator: Mutex::new(range_allocator),
            identity_range_allocator: Mutex::new(identity_range_allocator),
        }
    }

    pub fn id(&self) -> PageDirectoryId {
        self.id
    }

    /// Is `range` handed out by one of this directory's allocators? Ranges
    /// outside both allocators are not tracked here and always qualify.
    pub fn is_range_allocated(&self, range: &Range) -> bool {
        if let Some(allocated) = allocated_in(&self.range_allocator(), range) {
            return allocated;
        }
        allocated_in(&self.identity_range_allocator(), range).unwrap_or(true)
    }

    /// Lock the tables. Requires the global MM lock.
    pub fn lock<'a>(&'a self, mm: &'a MmGuard<'a>) -> PageDirectoryGuard<'a> {
        mm.order().acquire(LockRank::PageDirectory);
        PageDirectoryGuard {
            directory: self,
            tables: self.tables.lock(),
            mm,
        }
    }

    /// Allocator for ordinary (user or kernel heap) ranges
    pub fn range_allocator(&self) -> MutexGuard<'_, RangeAllocator> {
        self.range_allocator.lock()
    }

    /// Allocator for identity-mapped ranges
    pub fn identity_range_allocator(&self) -> MutexGuard<'_, RangeAllocator> {
        self.identity_range_allocator.lock()
    }

    /// Current translation of `vaddr`, if an entry exists.
    ///
    /// Takes only the table lock and nests nothing under it.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PageTableEntry> {
        let tables = self.tables.lock();
        let pte = tables.get(&table_index(vaddr))?.entries[entry_index(vaddr)];
        pte.is_present().then_some(pte)
    }

    /// Number of leaf tables currently allocated
    pub fn page_table_count(&self) -> usize {
        self.tables.lock().len()
    }
}

impl core::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageDirectory").field("id", &self.id).finish()
    }
}

/// Locked access to one directory's tables
pub struct PageDirectoryGuard<'a> {
    directory: &'a PageDirectory,
    tables: MutexGuard<'a, BTreeMap<usize, PageTable>>,
    mm: &'a MmGuard<'a>,
}

impl<'a> PageDirectoryGuard<'a> {
    pub fn directory(&self) -> &'a PageDirectory {
        self.directory
    }

    pub fn memory_manager(&self) -> &'a MemoryManager {
        self.mm.memory_manager()
    }

    /// Entry for `vaddr`, allocating the leaf table if needed.
    ///
    /// Returns `None` when no frame is left for a new table.
    pub fn ensure_pte(&mut self, vaddr: VirtualAddress) -> Option<&mut PageTableEntry> {
        let index = table_index(vaddr);
        if !self.tables.contains_key(&index) {
            let frame = self
                .mm
                .memory_manager()
                .allocate_user_physical_page(ShouldZeroFill::Yes)?;
            self.tables.insert(index, PageTable::new(frame));
        }
        let table = self.tables.get_mut(&index)?;
        Some(&mut table.entries[entry_index(vaddr)])
    }

    /// Clear the entry for `vaddr`. On the last release of a range, the leaf
    /// table is freed once it holds no present entries.
    pub fn release_pte(&mut self, vaddr: VirtualAddress, is_last_release: bool) {
        let index = table_index(vaddr);
        let Some(table) = self.tables.get_mut(&index) else {
            return;
        };
        table.entries[entry_index(vaddr)].clear();
        if is_last_release && table.is_empty() {
            self.tables.remove(&index);
        }
    }

    /// Current entry for `vaddr`, present or not
    pub fn pte(&self, vaddr: VirtualAddress) -> Option<PageTableEntry> {
        Some(self.tables.get(&table_index(vaddr))?.entries[entry_index(vaddr)])
    }
}

impl Drop for PageDirectoryGuard<'_> {
    fn drop(&mut self) {
        self.mm.order().release(LockRank::PageDirectory);
    }
}

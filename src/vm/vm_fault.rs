//! VM Fault - Page Fault Resolution
//!
//! Turns a hardware page fault inside a region into one of three outcomes:
//! the access can be retried, the faulting thread must crash, or memory ran
//! out. All resolution happens under the MM lock and the object lock, and
//! every slot change is broadcast to all regions mapping the object before
//! the locks are dropped.
//!
//! ## Fault Types
//!
//! - **Zero-fill**: first write to a sentinel page gets a private zeroed page
//! - **Lazy commit**: a not-present lazy slot is realized from the object's
//!   commitment
//! - **Copy-on-write**: first write to a page shared by a fork gets a copy,
//!   unless nobody else holds it any more
//! - **Inode**: first touch of a file page reads it from the inode

use alloc::vec;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::PAGE_SIZE;
use crate::vm::address::VirtualAddress;
use crate::vm::physical_page::ShouldZeroFill;
use crate::vm::region::{remap_vmobject_page, Region};
use crate::vm::vm_object::VmObjectGuard;

// ============================================================================
// Fault Description
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultType {
    PageNotPresent,
    ProtectionViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultAccess {
    Read,
    Write,
}

/// A page fault as reported by the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    vaddr: VirtualAddress,
    fault_type: PageFaultType,
    access: PageFaultAccess,
}

impl PageFault {
    pub const fn new(vaddr: VirtualAddress, fault_type: PageFaultType, access: PageFaultAccess) -> Self {
        Self {
            vaddr,
            fault_type,
            access,
        }
    }

    pub fn vaddr(&self) -> VirtualAddress {
        self.vaddr
    }

    pub fn fault_type(&self) -> PageFaultType {
        self.fault_type
    }

    pub fn access(&self) -> PageFaultAccess {
        self.access
    }

    pub fn is_not_present(&self) -> bool {
        self.fault_type == PageFaultType::PageNotPresent
    }

    pub fn is_protection_violation(&self) -> bool {
        self.fault_type == PageFaultType::ProtectionViolation
    }

    pub fn is_read(&self) -> bool {
        self.access == PageFaultAccess::Read
    }

    pub fn is_write(&self) -> bool {
        self.access == PageFaultAccess::Write
    }
}

/// Result of a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResponse {
    /// The faulting thread must be terminated
    ShouldCrash,
    /// No memory to resolve the fault
    OutOfMemory,
    /// Fault resolved; retry the access
    Continue,
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault statistics counters
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Zero-fill faults
    pub zero_fill: AtomicU64,
    /// Copy-on-write faults
    pub cow: AtomicU64,
    /// Inode page-in faults
    pub inode: AtomicU64,
    /// Lazy committed pages realized
    pub committed: AtomicU64,
    /// Faults resolved by remapping a resident page
    pub remaps: AtomicU64,
    /// Faults answered with ShouldCrash
    pub crashes: AtomicU64,
    /// Faults answered with OutOfMemory
    pub out_of_memory: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            inode: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            remaps: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
            out_of_memory: AtomicU64::new(0),
        }
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_zero_fill(&self) {
        self.zero_fill.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_inode(&self) {
        self.inode.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_remaps(&self) {
        self.remaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_crashes(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_out_of_memory(&self) {
        self.out_of_memory.fetch_add(1, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for FaultStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FaultStats")
            .field("total", &self.total.load(Ordering::Relaxed))
            .field("zero_fill", &self.zero_fill.load(Ordering::Relaxed))
            .field("cow", &self.cow.load(Ordering::Relaxed))
            .field("inode", &self.inode.load(Ordering::Relaxed))
            .field("committed", &self.committed.load(Ordering::Relaxed))
            .field("remaps", &self.remaps.load(Ordering::Relaxed))
            .field("crashes", &self.crashes.load(Ordering::Relaxed))
            .field("out_of_memory", &self.out_of_memory.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Fault Handling
// ============================================================================

/// Broadcast a changed slot, mapping a failed remap to OutOfMemory
fn broadcast(object: &VmObjectGuard<'_>, vmobject_page_index: usize) -> PageFaultResponse {
    if remap_vmobject_page(object, vmobject_page_index) {
        PageFaultResponse::Continue
    } else {
        PageFaultResponse::OutOfMemory
    }
}

impl Region {
    /// Resolve a page fault at `fault.vaddr()`, which must lie in this region
    pub fn handle_fault(&self, fault: &PageFault) -> PageFaultResponse {
        let stats = self.memory_manager().fault_stats();
        stats.incr_total();
        let response = self.resolve_fault(fault);
        match response {
            PageFaultResponse::ShouldCrash => stats.incr_crashes(),
            PageFaultResponse::OutOfMemory => stats.incr_out_of_memory(),
            PageFaultResponse::Continue => {}
        }
        response
    }

    fn resolve_fault(&self, fault: &PageFault) -> PageFaultResponse {
        let vaddr = fault.vaddr();
        if !self.contains(vaddr) {
            log::error!("Region {}: fault at {} outside the region", self, vaddr);
            return PageFaultResponse::ShouldCrash;
        }
        let page_index = self.page_index_from_address(vaddr);
        let vmobject_page_index = self.translate_to_vmobject_page(page_index);
        let readable = self.is_readable();
        let writable = self.is_writable();
        let shared = self.is_shared();

        let vmobject = self.vmobject();
        let guard = self.memory_manager().lock();
        let mut object = vmobject.lock(&guard);

        match fault.fault_type() {
            PageFaultType::PageNotPresent => {
                if fault.is_read() && !readable {
                    log::debug!("NP(non-readable) fault in Region {} at {}", self, vaddr);
                    return PageFaultResponse::ShouldCrash;
                }
                if fault.is_write() && !writable {
                    log::debug!("NP(non-writable) write fault in Region {} at {}", self, vaddr);
                    return PageFaultResponse::ShouldCrash;
                }
                if vmobject.is_inode() {
                    fault_trace!("NP(inode) fault in Region {} at {}", self, vaddr);
                    return self.handle_inode_fault(&mut object, vmobject_page_index, fault);
                }
                match object.physical_page(vmobject_page_index).map(|page| page.is_lazy_committed_page()) {
                    Some(true) => self.handle_lazy_commit_fault(&mut object, vmobject_page_index),
                    Some(false) => {
                        // Another thread or region resolved it first
                        fault_trace!("NP(present) fault in Region {} at {}, remapping", self, vaddr);
                        self.memory_manager().fault_stats().incr_remaps();
                        broadcast(&object, vmobject_page_index)
                    }
                    None => {
                        log::error!("BUG! Unexpected NP fault at {}", vaddr);
                        PageFaultResponse::ShouldCrash
                    }
                }
            }
            PageFaultType::ProtectionViolation => {
                if !(fault.is_write() && writable) {
                    log::debug!("PV fault in Region {} at {}", self, vaddr);
                    return PageFaultResponse::ShouldCrash;
                }
                let Some(page) = object.physical_page(vmobject_page_index) else {
                    log::error!("BUG! PV fault on empty slot at {}", vaddr);
                    return PageFaultResponse::ShouldCrash;
                };
                let slot_paddr = page.paddr();
                if page.is_sentinel() {
                    fault_trace!("PV(zero) fault in Region {} at {}", self, vaddr);
                    return self.handle_zero_fault(&mut object, vmobject_page_index);
                }
                if object.should_cow(vmobject_page_index, shared) {
                    fault_trace!("PV(cow) fault in Region {} at {}", self, vaddr);
                    self.memory_manager().fault_stats().incr_cow();
                    let response = object.handle_cow_fault(vmobject_page_index, vaddr);
                    if response != PageFaultResponse::Continue {
                        return response;
                    }
                    return broadcast(&object, vmobject_page_index);
                }
                let installed = match self.page_directory() {
                    Some(directory) => {
                        let tables = directory.lock(&guard);
                        tables.pte(vaddr)
                    }
                    None => None,
                };
                match installed {
                    Some(pte) if pte.is_present() => {
                        if pte.is_writable() && pte.physical_page_base() == slot_paddr {
                            // A racer already installed the page writable
                            fault_trace!("PV(resolved) fault in Region {} at {}", self, vaddr);
                            return PageFaultResponse::Continue;
                        }
                        // Stale PTE for a page that is writable by now
                        fault_trace!("PV(stale) fault in Region {} at {}, remapping", self, vaddr);
                        self.memory_manager().fault_stats().incr_remaps();
                        broadcast(&object, vmobject_page_index)
                    }
                    _ => {
                        log::debug!("PV(error) fault in Region {} at {}", self, vaddr);
                        PageFaultResponse::ShouldCrash
                    }
                }
            }
        }
    }

    /// Give the slot a private zeroed page
    fn handle_zero_fault(&self, object: &mut VmObjectGuard<'_>, vmobject_page_index: usize) -> PageFaultResponse {
        let mm = object.memory_manager();
        let lazy = match object.physical_page(vmobject_page_index) {
            Some(page) if !page.is_sentinel() => {
                // Someone else already resolved this fault
                mm.fault_stats().incr_remaps();
                return broadcast(object, vmobject_page_index);
            }
            Some(page) => page.is_lazy_committed_page(),
            None => false,
        };

        let committed = if lazy {
            object.allocate_committed_page()
        } else {
            None
        };
        if committed.is_some() {
            mm.fault_stats().incr_committed();
        }
        let page = committed
            .or_else(|| object.allocate_from_cow_reserve(vmobject_page_index))
            .or_else(|| mm.allocate_user_physical_page(ShouldZeroFill::Yes));
        let Some(page) = page else {
            log::warn!("MM: handle_zero_fault was unable to allocate a physical page");
            return PageFaultResponse::OutOfMemory;
        };

        fault_trace!("      >> ZERO {}", page.paddr());
        mm.fault_stats().incr_zero_fill();
        object.set_physical_page(vmobject_page_index, Some(page));
        object.set_should_cow(vmobject_page_index, false);
        broadcast(object, vmobject_page_index)
    }

    /// Realize a lazy committed slot that faulted while not present
    fn handle_lazy_commit_fault(
        &self,
        object: &mut VmObjectGuard<'_>,
        vmobject_page_index: usize,
    ) -> PageFaultResponse {
        let Some(page) = object.allocate_committed_page() else {
            log::warn!("MM: unable to realize committed page {}", vmobject_page_index);
            return PageFaultResponse::OutOfMemory;
        };
        object.memory_manager().fault_stats().incr_committed();
        object.set_physical_page(vmobject_page_index, Some(page));
        broadcast(object, vmobject_page_index)
    }

    /// Read the page in from the inode, once, under the object lock
    fn handle_inode_fault(
        &self,
        object: &mut VmObjectGuard<'_>,
        vmobject_page_index: usize,
        fault: &PageFault,
    ) -> PageFaultResponse {
        let mm = object.memory_manager();
        if object.physical_page(vmobject_page_index).is_some() {
            // Paged in by another thread or through another region
            mm.fault_stats().incr_remaps();
            return broadcast(object, vmobject_page_index);
        }

        let Some(inode) = object.object().inode().cloned() else {
            return PageFaultResponse::ShouldCrash;
        };
        let Some(page) = mm.allocate_user_physical_page(ShouldZeroFill::No) else {
            log::warn!("MM: handle_inode_fault was unable to allocate a physical page");
            return PageFaultResponse::OutOfMemory;
        };

        // Short reads at end of file leave the tail zeroed
        let mut buffer = vec![0u8; PAGE_SIZE];
        let offset = vmobject_page_index * PAGE_SIZE;
        match inode.read_bytes(offset, &mut buffer) {
            Ok(nread) => {
                fault_trace!("      >> INODE read {} bytes at {:#x}", nread, offset);
            }
            Err(e) => {
                log::error!("MM: handle_inode_fault had error ({}) while reading at {:#x}", e, offset);
                return PageFaultResponse::ShouldCrash;
            }
        }

        mm.fault_stats().incr_inode();
        mm.physical_memory().write_frame(page.paddr(), 0, &buffer);
        object.set_physical_page(vmobject_page_index, Some(page));
        if fault.is_write() && object.object().is_shared_inode() {
            object.set_dirty(vmobject_page_index, true);
        }
        broadcast(object, vmobject_page_index)
    }
}

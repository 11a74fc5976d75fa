//! Test doubles and a tiny MMU model
//!
//! `touch` plays the role of the CPU: it walks the page directory for an
//! access and raises the page fault the hardware would raise, looping until
//! the access succeeds or the fault handler gives up.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::{PAGE_SIZE, USER_RANGE_BASE};
use crate::error::InodeError;
use crate::vm::{
    Access, AllocationStrategy, Cacheable, HeapPhysicalMemory, Inode, MemoryManager,
    MemoryManagerConfig, PageDirectory, PageDirectoryId, PageFault, PageFaultAccess,
    PageFaultResponse, PageFaultType, PhysicalAddress, PhysicalMemory, Platform, Range, Region,
    ShouldFlushTlb, VirtualAddress, VmObject,
};

/// Platform that records every TLB flush
pub(crate) struct RecordingPlatform {
    has_nx: bool,
    flushes: Mutex<Vec<(PageDirectoryId, VirtualAddress, usize)>>,
}

impl RecordingPlatform {
    pub(crate) fn new(has_nx: bool) -> Arc<Self> {
        Arc::new(Self {
            has_nx,
            flushes: Mutex::new(Vec::new()),
        })
    }

    /// Flushes seen for `directory` covering `vaddr`
    pub(crate) fn flushes_covering(&self, directory: PageDirectoryId, vaddr: VirtualAddress) -> usize {
        self.flushes
            .lock()
            .iter()
            .filter(|(id, base, count)| {
                *id == directory && Range::new(*base, count * PAGE_SIZE).contains(vaddr)
            })
            .count()
    }

    pub(crate) fn clear(&self) {
        self.flushes.lock().clear();
    }
}

impl Platform for RecordingPlatform {
    fn has_nx(&self) -> bool {
        self.has_nx
    }

    fn flush_tlb(&self, directory: PageDirectoryId, vaddr: VirtualAddress, page_count: usize) {
        self.flushes.lock().push((directory, vaddr, page_count));
    }
}

/// Memory manager over `frame_count` heap frames reporting to `platform`
pub(crate) fn memory_manager(
    frame_count: usize,
    platform: Arc<RecordingPlatform>,
) -> Arc<MemoryManager> {
    let memory = Arc::new(HeapPhysicalMemory::new(frame_count));
    MemoryManager::new(MemoryManagerConfig::default(), memory, platform).unwrap()
}

/// Heap frames that can be told to refuse allocations, so accounting and
/// physical memory disagree
pub(crate) struct FailingPhysicalMemory {
    inner: HeapPhysicalMemory,
    failing: AtomicBool,
}

impl FailingPhysicalMemory {
    pub(crate) fn new(frame_count: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: HeapPhysicalMemory::new(frame_count),
            failing: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl PhysicalMemory for FailingPhysicalMemory {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.allocate_frame()
    }

    fn free_frame(&self, paddr: PhysicalAddress) {
        self.inner.free_frame(paddr)
    }

    fn total_frames(&self) -> usize {
        self.inner.total_frames()
    }

    fn fill_frame(&self, paddr: PhysicalAddress, byte: u8) {
        self.inner.fill_frame(paddr, byte)
    }

    fn copy_frame(&self, dst: PhysicalAddress, src: PhysicalAddress) {
        self.inner.copy_frame(dst, src)
    }

    fn read_frame(&self, paddr: PhysicalAddress, offset: usize, buf: &mut [u8]) {
        self.inner.read_frame(paddr, offset, buf)
    }

    fn write_frame(&self, paddr: PhysicalAddress, offset: usize, data: &[u8]) {
        self.inner.write_frame(paddr, offset, data)
    }
}

/// Memory manager over `memory`, which can be made to refuse frames
pub(crate) fn failing_memory_manager(memory: Arc<FailingPhysicalMemory>) -> Arc<MemoryManager> {
    let platform = RecordingPlatform::new(true);
    MemoryManager::new(MemoryManagerConfig::default(), memory, platform).unwrap()
}

/// File contents held in memory, counting reads
pub(crate) struct MemoryInode {
    data: Vec<u8>,
    reads: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryInode {
    pub(crate) fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data,
            reads: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Inode for MemoryInode {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<usize, InodeError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(InodeError::Io);
        }
        if offset > self.data.len() {
            return Err(InodeError::OutOfRange { offset });
        }
        let available = &self.data[offset..];
        let count = available.len().min(buffer.len());
        buffer[..count].copy_from_slice(&available[..count]);
        Ok(count)
    }
}

// ============================================================================
// MMU model
// ============================================================================

const MAX_FAULTS_PER_ACCESS: usize = 4;

/// Perform an access the way the CPU would, faulting as needed
pub(crate) fn touch(
    region: &Region,
    directory: &PageDirectory,
    vaddr: VirtualAddress,
    access: PageFaultAccess,
) -> PageFaultResponse {
    for _ in 0..MAX_FAULTS_PER_ACCESS {
        let fault_type = match directory.translate(vaddr) {
            None => PageFaultType::PageNotPresent,
            Some(pte) if access == PageFaultAccess::Write && !pte.is_writable() => {
                PageFaultType::ProtectionViolation
            }
            Some(_) => return PageFaultResponse::Continue,
        };
        let response = region.handle_fault(&PageFault::new(vaddr, fault_type, access));
        if response != PageFaultResponse::Continue {
            return response;
        }
    }
    panic!("access to {} keeps faulting", vaddr);
}

pub(crate) fn read_byte(
    region: &Region,
    directory: &PageDirectory,
    vaddr: VirtualAddress,
) -> Result<u8, PageFaultResponse> {
    match touch(region, directory, vaddr, PageFaultAccess::Read) {
        PageFaultResponse::Continue => {}
        response => return Err(response),
    }
    let pte = directory.translate(vaddr).unwrap();
    let mut byte = [0u8; 1];
    region
        .memory_manager()
        .physical_memory()
        .read_frame(pte.physical_page_base(), vaddr.page_offset(), &mut byte);
    Ok(byte[0])
}

pub(crate) fn write_byte(
    region: &Region,
    directory: &PageDirectory,
    vaddr: VirtualAddress,
    value: u8,
) -> Result<(), PageFaultResponse> {
    match touch(region, directory, vaddr, PageFaultAccess::Write) {
        PageFaultResponse::Continue => {}
        response => return Err(response),
    }
    let pte = directory.translate(vaddr).unwrap();
    assert!(pte.is_writable());
    region
        .memory_manager()
        .physical_memory()
        .write_frame(pte.physical_page_base(), vaddr.page_offset(), &[value]);
    Ok(())
}

// ============================================================================
// Builders
// ============================================================================

/// `pages` pages starting at the bottom of the user range
pub(crate) fn user_range(pages: usize) -> Range {
    Range::new(VirtualAddress::new(USER_RANGE_BASE), pages * PAGE_SIZE)
}

/// Allocate a range in `directory`, back it with a fresh anonymous object
/// and map it
pub(crate) fn mapped_anonymous_region(
    mm: &Arc<MemoryManager>,
    directory: &Arc<PageDirectory>,
    pages: usize,
    strategy: AllocationStrategy,
    access: Access,
) -> Region {
    let object = VmObject::create_anonymous(mm, pages * PAGE_SIZE, strategy).unwrap();
    mapped_region(mm, directory, object, access, false)
}

/// Allocate a range in `directory` for all of `object` and map it
pub(crate) fn mapped_region(
    mm: &Arc<MemoryManager>,
    directory: &Arc<PageDirectory>,
    object: Arc<VmObject>,
    access: Access,
    shared: bool,
) -> Region {
    let range = directory
        .range_allocator()
        .allocate_anywhere(object.size(), PAGE_SIZE)
        .unwrap();
    let region = Region::create_user_accessible(
        mm,
        range,
        object,
        0,
        "test",
        access,
        Cacheable::Yes,
        shared,
    )
    .unwrap();
    region.map(directory, ShouldFlushTlb::Yes).unwrap();
    region
}

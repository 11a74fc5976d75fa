//! Physical Memory and Platform Hooks
//!
//! The VM core never touches frames or TLBs directly. It goes through two
//! opaque services:
//!
//! - [`PhysicalMemory`]: frame allocation and frame contents (the kernel's
//!   physmap / quickmap)
//! - [`Platform`]: CPU features and TLB invalidation
//!
//! [`HeapPhysicalMemory`] and [`HostedPlatform`] back them with ordinary heap
//! memory so the core can run hosted.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::vm::address::{PhysicalAddress, VirtualAddress};
use crate::vm::page_directory::PageDirectoryId;

/// Frame allocator and frame access service
pub trait PhysicalMemory: Send + Sync {
    /// Take one free frame
    fn allocate_frame(&self) -> Option<PhysicalAddress>;

    /// Return a frame taken with `allocate_frame`
    fn free_frame(&self, paddr: PhysicalAddress);

    /// Number of frames this service manages
    fn total_frames(&self) -> usize;

    /// Set every byte of the frame to `byte`
    fn fill_frame(&self, paddr: PhysicalAddress, byte: u8);

    /// Copy the whole of `src` into `dst`
    fn copy_frame(&self, dst: PhysicalAddress, src: PhysicalAddress);

    /// Read `buf.len()` bytes starting at `offset` within the frame
    fn read_frame(&self, paddr: PhysicalAddress, offset: usize, buf: &mut [u8]);

    /// Write `data` starting at `offset` within the frame
    fn write_frame(&self, paddr: PhysicalAddress, offset: usize, data: &[u8]);
}

/// CPU-level services the mapping code needs
pub trait Platform: Send + Sync {
    /// Does the CPU support execute-disable page table entries?
    fn has_nx(&self) -> bool;

    /// Invalidate `page_count` translations starting at `vaddr` in `directory`
    fn flush_tlb(&self, directory: PageDirectoryId, vaddr: VirtualAddress, page_count: usize);
}

// ============================================================================
// Heap-backed Physical Memory
// ============================================================================

/// Byte written over frames when they are freed
const FREED_FRAME_SCRUB: u8 = 0xdf;

type Frame = Box<[u8; PAGE_SIZE]>;

struct FrameStore {
    frames: Vec<Frame>,
    free: Vec<usize>,
}

/// Physical memory simulated with heap-allocated frames
pub struct HeapPhysicalMemory {
    base: PhysicalAddress,
    store: Mutex<FrameStore>,
}

impl HeapPhysicalMemory {
    /// Default physical base of the first frame (1 MiB)
    pub const DEFAULT_BASE: PhysicalAddress = PhysicalAddress::new(0x10_0000);

    /// Create a store with `frame_count` frames
    pub fn new(frame_count: usize) -> Self {
        Self::with_base(Self::DEFAULT_BASE, frame_count)
    }

    /// Create a store whose first frame lives at `base`
    pub fn with_base(base: PhysicalAddress, frame_count: usize) -> Self {
        debug_assert!(base.is_page_aligned());
        let frames = (0..frame_count)
            .map(|_| Box::new([FREED_FRAME_SCRUB; PAGE_SIZE]))
            .collect();
        // Hand out low frames first
        let free = (0..frame_count).rev().collect();
        Self {
            base,
            store: Mutex::new(FrameStore { frames, free }),
        }
    }

    /// Frames currently free
    pub fn free_frames(&self) -> usize {
        self.store.lock().free.len()
    }

    fn index_of(&self, paddr: PhysicalAddress) -> usize {
        debug_assert!(paddr.is_page_aligned());
        ((paddr.get() - self.base.get()) / PAGE_SIZE as u64) as usize
    }

    fn address_of(&self, index: usize) -> PhysicalAddress {
        self.base.offset((index * PAGE_SIZE) as u64)
    }
}

impl PhysicalMemory for HeapPhysicalMemory {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        let index = self.store.lock().free.pop()?;
        Some(self.address_of(index))
    }

    fn free_frame(&self, paddr: PhysicalAddress) {
        let index = self.index_of(paddr);
        let mut store = self.store.lock();
        store.frames[index].fill(FREED_FRAME_SCRUB);
        debug_assert!(!store.free.contains(&index), "double free of {}", paddr);
        store.free.push(index);
    }

    fn total_frames(&self) -> usize {
        self.store.lock().frames.len()
    }

    fn fill_frame(&self, paddr: PhysicalAddress, byte: u8) {
        let index = self.index_of(paddr);
        self.store.lock().frames[index].fill(byte);
    }

    fn copy_frame(&self, dst: PhysicalAddress, src: PhysicalAddress) {
        let (dst, src) = (self.index_of(dst), self.index_of(src));
        let mut store = self.store.lock();
        let contents = *store.frames[src];
        *store.frames[dst] = contents;
    }

    fn read_frame(&self, paddr: PhysicalAddress, offset: usize, buf: &mut [u8]) {
        let index = self.index_of(paddr);
        let store = self.store.lock();
        buf.copy_from_slice(&store.frames[index][offset..offset + buf.len()]);
    }

    fn write_frame(&self, paddr: PhysicalAddress, offset: usize, data: &[u8]) {
        let index = self.index_of(paddr);
        let mut store = self.store.lock();
        store.frames[index][offset..offset + data.len()].copy_from_slice(data);
    }
}

// ============================================================================
// Hosted Platform
// ============================================================================

/// Platform for hosted builds: configurable NX, counted TLB flushes
#[derive(Debug)]
pub struct HostedPlatform {
    has_nx: bool,
    tlb_flushes: AtomicU64,
}

impl HostedPlatform {
    pub const fn new(has_nx: bool) -> Self {
        Self {
            has_nx,
            tlb_flushes: AtomicU64::new(0),
        }
    }

    /// Number of flush requests seen
    pub fn tlb_flushes(&self) -> u64 {
        self.tlb_flushes.load(Ordering::Relaxed)
    }
}

impl Platform for HostedPlatform {
    fn has_nx(&self) -> bool {
        self.has_nx
    }

    fn flush_tlb(&self, _directory: PageDirectoryId, _vaddr: VirtualAddress, _page_count: usize) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

//! Region Arena - Stable Region Handles
//!
//! VMObjects need to reach every region mapping them in order to broadcast
//! remaps. Instead of raw back-pointers, every live region gets a slot in
//! the memory manager's arena and objects store the slot's [`RegionHandle`].
//!
//! A handle carries the slot generation, so a handle that outlived its region
//! resolves to nothing instead of to whatever region reused the slot.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::vm::region::RegionInner;

/// Stable reference to a region in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionHandle {
    index: u32,
    generation: u32,
}

impl RegionHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot {
    generation: u32,
    region: Option<Arc<RegionInner>>,
}

struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Slab of live regions. The slab lock is a leaf.
pub(crate) struct RegionArena {
    inner: Mutex<Slots>,
}

impl RegionArena {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub(crate) fn insert(&self, region: Arc<RegionInner>) -> RegionHandle {
        let mut inner = self.inner.lock();
        inner.live += 1;
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.region = Some(region);
            return RegionHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            region: Some(region),
        });
        RegionHandle {
            index,
            generation: 0,
        }
    }

    /// Free the slot of `handle`; stale handles are ignored
    pub(crate) fn remove(&self, handle: RegionHandle) -> Option<Arc<RegionInner>> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let region = slot.region.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        inner.live -= 1;
        Some(region)
    }

    pub(crate) fn get(&self, handle: RegionHandle) -> Option<Arc<RegionInner>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.region.clone()
    }

    /// Number of live regions
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGE_SIZE, USER_RANGE_BASE};
    use crate::vm::{
        Access, AllocationStrategy, Cacheable, MemoryManager, Range, Region, VirtualAddress,
        VmObject,
    };

    fn region(mm: &Arc<MemoryManager>, page: usize) -> Region {
        let object = VmObject::create_anonymous(mm, PAGE_SIZE, AllocationStrategy::None).unwrap();
        let base = VirtualAddress::new(USER_RANGE_BASE + page * PAGE_SIZE);
        let range = Range::new(base, PAGE_SIZE);
        Region::create_user_accessible(
            mm,
            range,
            object,
            0,
            "arena",
            Access::READ,
            Cacheable::Yes,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_handles_resolve_while_live() {
        let mm = MemoryManager::hosted(8);
        let a = region(&mm, 0);
        let b = region(&mm, 1);
        assert_ne!(a.handle(), b.handle());
        assert_eq!(mm.regions().len(), 2);
        assert!(mm.regions().get(a.handle()).is_some());
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mm = MemoryManager::hosted(8);
        let a = region(&mm, 0);
        let stale = a.handle();
        drop(a);
        assert!(mm.regions().get(stale).is_none());
        let b = region(&mm, 1);
        // Same slot, new generation
        assert_eq!(b.handle().index(), stale.index());
        assert_ne!(b.handle().generation(), stale.generation());
        assert!(mm.regions().get(stale).is_none());
        assert!(mm.regions().remove(stale).is_none());
        assert_eq!(mm.regions().len(), 1);
    }
}

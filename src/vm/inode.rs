//! Inode-backed VM Objects
//!
//! Pages of a file mapping are read through the [`Inode`] on first access
//! and stay resident in the object until released. Shared objects are
//! mapped by every process mapping the file `MAP_SHARED`; private objects
//! belong to one mapping (and its fork clones).

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitvec::vec::BitVec;

use crate::config::PAGE_SIZE;
use crate::error::{InodeError, Result, VmError};
use crate::vm::memory_manager::MemoryManager;
use crate::vm::region::remap_all_regions;
use crate::vm::vm_object::{VmObject, VmObjectGuard, VmObjectKind, VmObjectState};

/// File contents source for inode-backed objects
pub trait Inode: Send + Sync {
    /// File size in bytes
    fn size(&self) -> usize;

    /// Read up to `buffer.len()` bytes at `offset`. Returns the number of
    /// bytes read, which is short at end of file.
    fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> core::result::Result<usize, InodeError>;
}

impl VmObject {
    /// Create an object mapping `inode`, with every page non-resident
    pub fn create_inode(
        mm: &MemoryManager,
        inode: Arc<dyn Inode>,
        shared: bool,
    ) -> Result<Arc<VmObject>> {
        let page_count = inode.size().div_ceil(PAGE_SIZE);
        if page_count == 0 {
            return Err(VmError::MisalignedRange);
        }
        let mut physical_pages = Vec::with_capacity(page_count);
        physical_pages.resize(page_count, None);
        let state = VmObjectState {
            dirty_pages: BitVec::repeat(false, page_count),
            ..VmObjectState::new(physical_pages)
        };
        Ok(VmObject::from_parts(
            mm,
            VmObjectKind::Inode { inode, shared },
            state,
        ))
    }

    /// Bytes of resident pages written since they were read in
    pub fn amount_dirty(&self) -> usize {
        self.with_state(|state| count_resident(state, true)) * PAGE_SIZE
    }

    /// Bytes of resident pages identical to the file contents
    pub fn amount_clean(&self) -> usize {
        self.with_state(|state| count_resident(state, false)) * PAGE_SIZE
    }

    /// Drop every resident clean page and unmap it from all regions.
    /// Returns the number of pages released.
    pub fn release_all_clean_pages(&self, mm: &MemoryManager) -> usize {
        let guard = mm.lock();
        let mut locked = self.lock(&guard);
        locked.release_all_clean_pages()
    }
}

fn count_resident(state: &VmObjectState, dirty: bool) -> usize {
    state
        .physical_pages
        .iter()
        .enumerate()
        .filter(|(index, page)| {
            page.is_some() && state.dirty_pages.get(*index).is_some_and(|bit| *bit) == dirty
        })
        .count()
}

impl VmObjectGuard<'_> {
    /// Mark `page_index` as written (inode objects only)
    pub fn set_dirty(&mut self, page_index: usize, dirty: bool) {
        if let Some(mut bit) = self.state.dirty_pages.get_mut(page_index) {
            *bit = dirty;
        }
    }

    pub fn is_dirty(&self, page_index: usize) -> bool {
        self.state
            .dirty_pages
            .get(page_index)
            .is_some_and(|bit| *bit)
    }

    /// Release clean resident pages, then rewrite every mapping of the object
    pub fn release_all_clean_pages(&mut self) -> usize {
        if !self.object().is_inode() {
            return 0;
        }
        let mut released = Vec::new();
        for index in 0..self.object().page_count() {
            if !self.is_dirty(index) {
                released.extend(self.set_physical_page(index, None));
            }
        }
        if !released.is_empty() {
            log::debug!(
                "VmObject {:?}: released {} clean pages",
                self.object().id(),
                released.len()
            );
            // Frames go back to the pool only once no PTE refers to them
            remap_all_regions(self);
        }
        released.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryInode;
    use crate::vm::{AllocationStrategy, ShouldZeroFill};

    #[test]
    fn test_create_inode_object() {
        let mm = MemoryManager::hosted(8);
        let inode = MemoryInode::new(vec![7u8; PAGE_SIZE + 10]);
        let object = VmObject::create_inode(&mm, inode, false).unwrap();
        assert!(object.is_inode());
        assert!(object.is_private_inode());
        assert_eq!(object.page_count(), 2);
        assert!(object.physical_page(0).is_none());
        assert_eq!(object.amount_dirty(), 0);
        assert_eq!(object.amount_clean(), 0);
    }

    #[test]
    fn test_empty_inode_is_rejected() {
        let mm = MemoryManager::hosted(8);
        let result = VmObject::create_inode(&mm, MemoryInode::new(Vec::new()), true);
        assert_eq!(result.err(), Some(VmError::MisalignedRange));
    }

    #[test]
    fn test_dirty_and_clean_accounting() {
        let mm = MemoryManager::hosted(8);
        let inode = MemoryInode::new(vec![1u8; 3 * PAGE_SIZE]);
        let object = VmObject::create_inode(&mm, inode, true).unwrap();
        {
            let guard = mm.lock();
            let mut locked = object.lock(&guard);
            for index in 0..2 {
                let page = mm.allocate_user_physical_page(ShouldZeroFill::Yes);
                locked.set_physical_page(index, page);
            }
            locked.set_dirty(1, true);
            assert!(locked.is_dirty(1));
        }
        assert_eq!(object.amount_dirty(), PAGE_SIZE);
        assert_eq!(object.amount_clean(), PAGE_SIZE);

        assert_eq!(object.release_all_clean_pages(&mm), 1);
        assert!(object.physical_page(0).is_none());
        assert!(object.physical_page(1).is_some());
        assert_eq!(object.amount_clean(), 0);
    }

    #[test]
    fn test_anonymous_objects_have_no_clean_pages() {
        let mm = MemoryManager::hosted(8);
        let object = VmObject::create_anonymous(&mm, PAGE_SIZE, AllocationStrategy::AllocateNow).unwrap();
        assert_eq!(object.release_all_clean_pages(&mm), 0);
        assert!(object.physical_page(0).is_some());
    }
}

//! Error types for the VM core
//!
//! Page faults never produce these: a fault always resolves to a
//! [`crate::vm::PageFaultResponse`]. `VmError` covers the fallible
//! operations around it (object creation, mapping, range allocation).

use thiserror::Error;

/// Errors reported by region, object and mapping operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,

    #[error("unable to commit {pages} physical pages")]
    CommitFailed { pages: usize },

    #[error("virtual range unavailable")]
    RangeUnavailable,

    #[error("range or offset is not page aligned")]
    MisalignedRange,

    #[error("refusing to map mmap'ed page at kernel address {vaddr:#x}")]
    KernelAddressInUserMapping { vaddr: usize },

    #[error("range exceeds vmobject bounds")]
    OutOfBounds,

    #[error("operation requires an anonymous vmobject")]
    NotAnonymous,
}

/// Errors reported by an [`crate::vm::Inode`] read
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeError {
    #[error("i/o error")]
    Io,

    #[error("offset {offset:#x} is beyond end of file")]
    OutOfRange { offset: usize },
}

/// Result alias used across the crate
pub type Result<T> = core::result::Result<T, VmError>;

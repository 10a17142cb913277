//! # KeOS kernel services
//!
//! This crate is the layer of the kernel that sits between the "hardware" in
//! [`abyss`] and the demand paging core. It provides the abstractions the
//! paging core is written against:
//!
//! - [`mm`]: the physical page allocator and the hardware page table.
//! - [`fs`]: regular files and block disks.
//! - [`sync`]: the SMP spinlock.
//! - [`KernelError`]: the errno-style error type shared by every kernel
//!   operation.
//!
//! ## Implementation Notes
//!
//! Every lock in KeOS is a [`SpinLock`] whose guard must be released by an
//! explicit `unlock()`. Dropping a guard without unlocking panics and reports
//! the location the lock was taken at, which is usually enough to find a
//! forgotten unlock on an error path.
//!
//! Large buffers belong on the heap:
//! ```rust
//! let v = Box::new([0u8; 0x1000]); // OK: Allocates on the heap
//! ```
//!
//! [`SpinLock`]: sync::SpinLock

#![no_std]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

#[macro_use]
extern crate abyss;
extern crate alloc;

pub mod fs;
pub mod mm;
pub mod sync;

pub use abyss::{PFErrorCode, addressing, debug, info, warning};

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by the kernel operation.
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a kernel operation. These errors can be
/// returned to the user program to indicate the nature of the failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Text file busy. (ETXTBSY)
    TextFileBusy,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::TextFileBusy => -26,
            KernelError::NoSpace => -28,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -16 => Ok(Self::Busy),
            -17 => Ok(Self::FileExist),
            -22 => Ok(Self::InvalidArgument),
            -26 => Ok(Self::TextFileBusy),
            -28 => Ok(Self::NoSpace),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}

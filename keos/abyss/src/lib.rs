//! The abyss of kernel that operates hardwares.
//!
//! This crate contains the collection of "hardware" the virtual memory
//! subsystem talks to: address arithmetic, the SMP spinlock, block devices and
//! the page fault error code. In this build the hardware is emulated in host
//! memory so that the paging core can run (and be tested) as an ordinary
//! library.
//!
//! You are **not** required to understand every line of code in this crate.
//! Instead, see the [`keos`] crate for the abstractions that the paging core
//! is supposed to use.
//!
//! [`keos`]: ../keos/index.html
#![no_std]

extern crate alloc;

#[doc(hidden)]
pub use log;

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod dev;
pub mod interrupt;
pub mod spinlock;

pub use addressing::{Pa, Va};
pub use interrupt::PFErrorCode;
pub use spinlock::SpinLock;

/// Silence the kernel print macros.
///
/// Grading-style test drivers set this flag to keep the output readable.
#[doc(hidden)]
pub static QUITE: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

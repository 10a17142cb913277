//! Synchronization primitives.
//!
//! The paging core only needs the SMP spinlock. Its guard must be released
//! with an explicit `unlock()`, so every critical section is visible at the
//! call site.

pub use abyss::spinlock::{SpinLock, SpinLockGuard, WouldBlock};

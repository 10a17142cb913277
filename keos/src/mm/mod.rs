//! Memory Management.
//!
//! This module implements functionality for memory management operations such
//! as allocating and deallocating physical memory. The core abstraction is the
//! [`Page`], which represents a single physical page.
//!
//! Memory allocation and deallocation in KeOS is closely tied to Rust's
//! ownership and lifetime system: A page is allocated by creating an instance
//! of the [`Page`] struct. Once the [`Page`] instance is dropped, the page is
//! automatically freed, ensuring proper memory management and preventing memory
//! leaks.
//!
//! The physical memory itself is a [`PhysicalMemory`], a fixed pool of frames.
//! Its size bounds how many user pages can be resident at once, which is what
//! forces the paging core to evict.
pub mod page_table;

use crate::addressing::{PAGE_SHIFT, PAGE_SIZE, Pa};
use abyss::spinlock::SpinLock;
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Physical address of the first frame of the pool.
///
/// The first megabyte is never handed out, so that a zero [`Pa`] is never a
/// valid frame.
const RAM_BASE: usize = 0x10_0000;

// Physical memory allocators.
struct Arena {
    frames: Vec<SpinLock<Box<[u8; PAGE_SIZE]>>>,
    // 0: used, 1: unused
    bitmap: SpinLock<Vec<u64>>,
    used: AtomicUsize,
}

impl Arena {
    fn index_of(&self, pa: Pa) -> Option<usize> {
        let idx = pa.into_usize().checked_sub(RAM_BASE)? >> PAGE_SHIFT;
        (idx < self.frames.len()).then_some(idx)
    }

    fn alloc(&self) -> Option<usize> {
        let mut bitmap = self.bitmap.lock();
        let found = bitmap
            .iter()
            .position(|word| *word != 0)
            .map(|pos| pos * 64 + bitmap[pos].trailing_zeros() as usize)
            .filter(|idx| *idx < self.frames.len());
        if let Some(idx) = found {
            let (pos, ofs) = (idx / 64, idx % 64);
            debug_assert_ne!(bitmap[pos] & (1 << ofs), 0);
            bitmap[pos] &= !(1 << ofs);
            self.used.fetch_add(1, Ordering::SeqCst);
        }
        bitmap.unlock();
        found
    }

    fn dealloc(&self, idx: usize) {
        let mut bitmap = self.bitmap.lock();
        let (pos, ofs) = (idx / 64, idx % 64);
        debug_assert_eq!(bitmap[pos] & (1 << ofs), 0);
        bitmap[pos] |= 1 << ofs;
        self.used.fetch_sub(1, Ordering::SeqCst);
        bitmap.unlock();
    }
}

/// The physical memory of the machine.
///
/// A [`PhysicalMemory`] is a cheaply clonable handle to a fixed pool of
/// page-sized frames. Pages are allocated with
/// [`PhysicalMemory::alloc_page`] and returned to the pool when the
/// [`Page`] is dropped.
///
/// ## Example:
/// ```
/// let ram = PhysicalMemory::new(16);
/// let page = ram.alloc_page().unwrap();
/// assert_eq!(ram.free_pages(), 15);
/// drop(page);
/// assert_eq!(ram.free_pages(), 16);
/// ```
#[derive(Clone)]
pub struct PhysicalMemory {
    arena: Arc<Arena>,
}

impl PhysicalMemory {
    /// Create a physical memory of `cnt` frames.
    pub fn new(cnt: usize) -> Self {
        let mut bitmap = vec![u64::MAX; cnt.div_ceil(64)];
        // Pad back.
        for i in cnt..cnt.div_ceil(64) * 64 {
            bitmap[i / 64] &= !(1 << (i % 64));
        }
        info!(
            "Memory: {} frames ({} KiB) usable.",
            cnt,
            cnt * PAGE_SIZE / 1024
        );
        Self {
            arena: Arc::new(Arena {
                frames: (0..cnt)
                    .map(|_| SpinLock::new(Box::new([0; PAGE_SIZE])))
                    .collect(),
                bitmap: SpinLock::new(bitmap),
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocate a zero-filled page.
    ///
    /// # Returns
    /// - `Some(Page)` on success.
    /// - `None` if every frame of the pool is in use.
    pub fn alloc_page(&self) -> Option<Page> {
        let index = self.arena.alloc()?;
        let page = Page {
            arena: self.arena.clone(),
            index,
        };
        page.with_inner_mut(|b| b.fill(0));
        Some(page)
    }

    /// The number of frames of this memory.
    pub fn capacity(&self) -> usize {
        self.arena.frames.len()
    }

    /// The number of frames that are not allocated.
    pub fn free_pages(&self) -> usize {
        self.capacity() - self.arena.used.load(Ordering::SeqCst)
    }

    /// Access the frame at the physical address `pa`.
    ///
    /// This is how the memory management unit reaches memory after a
    /// translation: the closure receives the whole frame that contains `pa`.
    ///
    /// # Returns
    /// - `Some(R)` with the result of `f`.
    /// - `None` if `pa` is not backed by this memory.
    pub fn with_frame<R>(&self, pa: Pa, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> Option<R> {
        let idx = self.arena.index_of(pa)?;
        let mut frame = self.arena.frames[idx].lock();
        let r = f(&mut frame);
        frame.unlock();
        Some(r)
    }
}

/// A representation of a memory page.
///
/// The [`Page`] struct encapsulates a single physical page, providing methods
/// to access and manipulate the underlying page's contents. A page has a
/// single owner; sharing a page among address spaces is the business of
/// whoever owns it.
///
/// ## Example:
/// ```
/// let page = ram.alloc_page().unwrap();
/// let pa = page.pa();  // Get the physical address of the page.
/// ```
pub struct Page {
    arena: Arc<Arena>,
    index: usize,
}

impl Page {
    /// Get the physical address of this page.
    ///
    /// # Returns
    /// - The physical address ([`Pa`]) of the page.
    #[inline]
    pub fn pa(&self) -> Pa {
        Pa::new(RAM_BASE + (self.index << PAGE_SHIFT)).unwrap_or(Pa::ZERO)
    }

    /// Run `f` over the contents of the page (read-only).
    pub fn with_inner<R>(&self, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> R {
        let frame = self.arena.frames[self.index].lock();
        let r = f(&frame);
        frame.unlock();
        r
    }

    /// Run `f` over the contents of the page.
    ///
    /// The caller can read from and write to the page's memory.
    pub fn with_inner_mut<R>(&self, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let mut frame = self.arena.frames[self.index].lock();
        let r = f(&mut frame);
        frame.unlock();
        r
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:?})", self.pa())
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.arena.dealloc(self.index);
    }
}

//! # Demand Paging for KeOS
//!
//! This crate extends KeOS' memory management with **demand paging**: user
//! pages are described first and backed later, physical memory is a cache of
//! the address space instead of its home, and pages that do not fit in memory
//! live on a swap disk or in the file they were mapped from.
//!
//! The pieces, from the leaves to the root:
//!
//! - [`swap`]: the swap disk, carved into page-sized slots.
//! - [`frame`]: the frame table, the registry of every physical frame that
//!   holds user data, and the clock algorithm that picks eviction victims.
//! - [`page`]: the three kinds of virtual pages (uninitialized, anonymous and
//!   file-backed) and how each is brought in, written out and destroyed.
//! - [`spt`]: the supplemental page table, the per-process record of every
//!   virtual page, including the copy made on `fork`.
//! - [`fault`]: page fault resolution, stack growth and copy-on-write.
//! - [`mmap`]: memory-mapped files and lazily loaded program segments.
//! - [`mm_struct`]: [`MmStruct`], the memory state of one process, which ties
//!   everything above to a page table.
//!
//! ## Shared state
//!
//! Frames are shared between processes after `fork`, so the frame table and
//! the swap store are global. They are not statics: a [`Vm`] owns them and
//! every [`MmStruct`] holds a handle to the [`Vm`] it was created from.
//!
//! ## Locking
//!
//! There are three locks, always taken in this order:
//!
//! 1. the frame table lock, taken exactly once at the top of every operation
//!    that inspects or changes frames (fault resolution, fork, teardown,
//!    munmap). Everything below receives the locked table as `&mut`.
//! 2. the swap lock, inside [`SwapStore`].
//! 3. the filesystem lock, inside the file implementation.
//!
//! Page table locks are leaves: they are held only to read or update entries
//! and for the duration of one user memory access.
//!
//! [`SwapStore`]: swap::SwapStore
#![no_std]
#![deny(missing_docs)]

extern crate alloc;
#[macro_use]
extern crate keos;

pub mod fault;
pub mod frame;
pub mod mm_struct;
pub mod mmap;
pub mod page;
pub mod spt;
pub mod swap;

pub use mm_struct::MmStruct;

use abyss::dev::{RamDisk, SECTOR_SIZE};
use alloc::{string::String, sync::Arc};
use frame::FrameTable;
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::Disk,
    mm::{PhysicalMemory, page_table::PageTable},
    sync::SpinLock,
};
use swap::SwapStore;

/// The top of the user stack.
///
/// The first stack page lies right below this address.
pub const USER_STACK_TOP: usize = 0x4748_0000;

/// The maximum size of the user stack.
pub const MAX_STACK_SIZE: usize = 0x10_0000;

/// How far below the stack pointer an access may land and still grow the
/// stack.
///
/// `push` touches the word right below `rsp` before moving it, and the widest
/// push (`pusha`-style sequences) reaches 32 bytes below.
pub const STACK_SLACK: usize = 32;

/// Number of disk sectors that make up one swap slot.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// The address space of a process.
///
/// An address space is a page table plus the unique id of that page table.
/// Frames and swap slots refer to the address spaces that map them through
/// this handle.
#[derive(Clone)]
pub struct AddressSpace {
    id: u64,
    page_table: Arc<SpinLock<PageTable>>,
}

impl AddressSpace {
    /// Create a fresh address space with an empty page table.
    pub fn new() -> Self {
        let page_table = PageTable::new();
        Self {
            id: page_table.id(),
            page_table: Arc::new(SpinLock::new(page_table)),
        }
    }

    /// The id of this address space.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The page table of this address space.
    #[inline]
    pub fn page_table(&self) -> &Arc<SpinLock<PageTable>> {
        &self.page_table
    }

    /// The key of the page at `va` in this address space.
    #[inline]
    pub fn key(&self, va: Va) -> PageKey {
        PageKey {
            asid: self.id,
            va: va.page_down(),
        }
    }

    /// A mapping of the page at `va` in this address space.
    pub fn mapping(&self, va: Va, writable: bool) -> Mapping {
        Mapping {
            space: self.clone(),
            va: va.page_down(),
            writable,
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Names one virtual page of one process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    /// Id of the address space.
    pub asid: u64,
    /// Page-aligned virtual address.
    pub va: Va,
}

/// One virtual page that shares a frame or a swap slot.
///
/// `writable` is the permission of the virtual page itself. The hardware
/// mapping is only writable while the page is the sole user of its frame.
#[derive(Clone)]
pub struct Mapping {
    /// The address space the page belongs to.
    pub space: AddressSpace,
    /// Page-aligned virtual address of the page.
    pub va: Va,
    /// Whether the virtual page is writable.
    pub writable: bool,
}

impl Mapping {
    /// The key of the mapped page.
    #[inline]
    pub fn key(&self) -> PageKey {
        PageKey {
            asid: self.space.id,
            va: self.va,
        }
    }
}

impl core::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Mapping({}, {:?}, {})",
            self.space.id,
            self.va,
            if self.writable { "rw" } else { "ro" }
        )
    }
}

/// Configuration of the paging subsystem.
///
/// ## Example:
/// ```
/// let vm = Vm::new(VmConfig::new().frames(8).swap_disk(disk));
/// ```
pub struct VmConfig {
    frames: usize,
    swap_disk: Option<Disk>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl VmConfig {
    /// The default number of physical frames for user pages.
    pub const DEFAULT_FRAMES: usize = 64;
    /// The default size of the swap disk, in bytes.
    pub const DEFAULT_SWAP_SIZE: usize = 4 * 1024 * 1024;

    /// Start from the defaults.
    pub fn new() -> Self {
        Self {
            frames: Self::DEFAULT_FRAMES,
            swap_disk: None,
        }
    }

    /// Set the number of physical frames for user pages.
    pub fn frames(self, frames: usize) -> Self {
        Self { frames, ..self }
    }

    /// Use `disk` as the swap disk.
    pub fn swap_disk(self, disk: Disk) -> Self {
        Self {
            swap_disk: Some(disk),
            ..self
        }
    }
}

/// Counters of the paging subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    /// Frames that currently hold user data.
    pub resident_frames: usize,
    /// Frames of physical memory that are not allocated.
    pub free_frames: usize,
    /// Frames reclaimed by eviction so far.
    pub evictions: usize,
    /// Total number of swap slots.
    pub swap_slots: usize,
    /// Swap slots that are not in use.
    pub free_swap_slots: usize,
    /// Slots read back from the swap disk.
    pub swap_ins: usize,
    /// Slots written to the swap disk.
    pub swap_outs: usize,
}

struct VmInner {
    ram: PhysicalMemory,
    frames: SpinLock<FrameTable>,
    swap: SwapStore,
}

/// The paging subsystem.
///
/// A [`Vm`] owns the physical memory for user pages, the frame table and the
/// swap store. It is a cheaply clonable handle; every process created from it
/// shares the same frames and swap slots.
#[derive(Clone)]
pub struct Vm {
    inner: Arc<VmInner>,
}

/// The locked shared state of the paging subsystem.
///
/// Obtained through [`Vm::with_locked`]. Holding a [`VmCtx`] means holding
/// the frame table lock.
pub struct VmCtx<'a> {
    /// The frame table.
    pub frames: &'a mut FrameTable,
    /// The swap store.
    pub swap: &'a SwapStore,
}

impl Vm {
    /// Bring up the paging subsystem.
    pub fn new(config: VmConfig) -> Self {
        let ram = PhysicalMemory::new(config.frames);
        let disk = config.swap_disk.unwrap_or_else(|| {
            Disk::new(Arc::new(RamDisk::with_capacity(
                VmConfig::DEFAULT_SWAP_SIZE,
            )))
        });
        let swap = SwapStore::new(disk);
        info!(
            "VM: {} frames, {} swap slots.",
            ram.capacity(),
            swap.slot_cnt()
        );
        Self {
            inner: Arc::new(VmInner {
                frames: SpinLock::new(FrameTable::new(ram.clone())),
                ram,
                swap,
            }),
        }
    }

    /// Create the memory state of a new process named `name`.
    pub fn new_process(&self, name: impl Into<String>) -> MmStruct {
        MmStruct::new(self.clone(), name)
    }

    /// The physical memory that backs user pages.
    pub fn physical_memory(&self) -> &PhysicalMemory {
        &self.inner.ram
    }

    /// The swap store.
    pub fn swap(&self) -> &SwapStore {
        &self.inner.swap
    }

    /// Run `f` while holding the frame table lock.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut VmCtx) -> R) -> R {
        let mut frames = self.inner.frames.lock();
        let r = f(&mut VmCtx {
            frames: &mut frames,
            swap: &self.inner.swap,
        });
        frames.unlock();
        r
    }

    /// Current counters of the subsystem.
    pub fn stats(&self) -> VmStats {
        let (resident_frames, evictions) =
            self.with_locked(|ctx| (ctx.frames.len(), ctx.frames.evictions()));
        let (swap_ins, swap_outs) = self.inner.swap.io_cnt();
        VmStats {
            resident_frames,
            free_frames: self.inner.ram.free_pages(),
            evictions,
            swap_slots: self.inner.swap.slot_cnt(),
            free_swap_slots: self.inner.swap.free_slot_cnt(),
            swap_ins,
            swap_outs,
        }
    }
}

/// Result of an operation that may terminate the process.
pub type VmResult<T> = Result<T, KernelError>;

//! # Swap Store
//!
//! Anonymous pages have no file to return to when their frame is reclaimed,
//! so they are written to a dedicated **swap disk**. The disk is carved into
//! page-sized **slots**, each spanning [`SECTORS_PER_SLOT`] consecutive
//! sectors: slot `n` starts at sector `n * SECTORS_PER_SLOT`.
//!
//! A slot is in use exactly while at least one virtual page lives in it. After
//! `fork`, a page that was swapped out is shared by the parent and the child,
//! so each slot keeps the list of [`Mapping`]s whose data it holds. The
//! reverse direction (which slot holds a given page) is kept in an index
//! keyed by [`PageKey`].
//!
//! A slot also remembers whether it was ever written. Clean pages that were
//! never modified are not written to disk at all; reading them back yields a
//! zero-filled page.
//!
//! Every slot operation, including the disk I/O, runs under the swap lock.
//!
//! [`SECTORS_PER_SLOT`]: crate::SECTORS_PER_SLOT
use crate::{Mapping, PageKey, SECTORS_PER_SLOT};
use abyss::dev::SECTOR_SIZE;
use alloc::{collections::BTreeMap, collections::VecDeque, vec::Vec};
use keos::{
    KernelError,
    fs::{Disk, Sector},
    mm::Page,
    sync::SpinLock,
};

/// Index of a swap slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl SlotId {
    /// The first sector of this slot.
    #[inline]
    pub fn sector(self) -> Sector {
        Sector(self.0 * SECTORS_PER_SLOT)
    }
}

#[derive(Default)]
struct Slot {
    sharers: Vec<Mapping>,
    in_use: bool,
    written: bool,
}

struct SwapTable {
    slots: Vec<Slot>,
    free: VecDeque<SlotId>,
    index: BTreeMap<PageKey, SlotId>,
    reads: usize,
    writes: usize,
}

impl SwapTable {
    fn slot(&mut self, slot: SlotId) -> &mut Slot {
        let s = &mut self.slots[slot.0];
        assert!(s.in_use, "{:?} is not allocated.", slot);
        s
    }

    fn release(&mut self, slot: SlotId) -> Vec<Mapping> {
        let s = self.slot(slot);
        s.in_use = false;
        s.written = false;
        let sharers = core::mem::take(&mut s.sharers);
        for m in sharers.iter() {
            self.index.remove(&m.key());
        }
        self.free.push_back(slot);
        sharers
    }
}

/// The swap disk and its slot bookkeeping.
pub struct SwapStore {
    disk: Disk,
    table: SpinLock<SwapTable>,
}

impl SwapStore {
    /// Build a swap store on top of `disk`.
    ///
    /// Trailing sectors that do not fill a whole slot are not used.
    pub fn new(disk: Disk) -> Self {
        let cnt = disk.sector_cnt() / SECTORS_PER_SLOT;
        Self {
            disk,
            table: SpinLock::new(SwapTable {
                slots: (0..cnt).map(|_| Slot::default()).collect(),
                free: (0..cnt).map(SlotId).collect(),
                index: BTreeMap::new(),
                reads: 0,
                writes: 0,
            }),
        }
    }

    /// Total number of slots.
    pub fn slot_cnt(&self) -> usize {
        let guard = self.table.lock();
        let cnt = guard.slots.len();
        guard.unlock();
        cnt
    }

    /// Number of slots that are not in use.
    pub fn free_slot_cnt(&self) -> usize {
        let guard = self.table.lock();
        let cnt = guard.free.len();
        guard.unlock();
        cnt
    }

    /// Number of slot reads and slot writes issued so far.
    pub fn io_cnt(&self) -> (usize, usize) {
        let guard = self.table.lock();
        let cnt = (guard.reads, guard.writes);
        guard.unlock();
        cnt
    }

    /// Allocate a free slot.
    ///
    /// # Returns
    /// - `Ok(SlotId)` of an empty, unwritten slot.
    /// - `Err(KernelError::NoSpace)` if every slot is in use.
    pub fn allocate_slot(&self) -> Result<SlotId, KernelError> {
        let mut guard = self.table.lock();
        let slot = guard.free.pop_front();
        if let Some(slot) = slot {
            let s = &mut guard.slots[slot.0];
            debug_assert!(!s.in_use && s.sharers.is_empty());
            s.in_use = true;
            s.written = false;
        }
        guard.unlock();
        slot.ok_or_else(|| {
            warning!("Swap: out of slots.");
            KernelError::NoSpace
        })
    }

    /// Return `slot` to the free list, forgetting every page that lived in it.
    pub fn free_slot(&self, slot: SlotId) {
        let mut guard = self.table.lock();
        guard.release(slot);
        guard.unlock();
    }

    /// Read the content of `slot` into `page`.
    pub fn read_slot(&self, slot: SlotId, page: &Page) -> Result<(), KernelError> {
        let mut guard = self.table.lock();
        guard.slot(slot);
        let r = page.with_inner_mut(|buf| {
            let mut sector = [0u8; SECTOR_SIZE];
            for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
                self.disk.read(slot.sector() + i, &mut sector)?;
                chunk.copy_from_slice(&sector);
            }
            Ok(())
        });
        if r.is_ok() {
            guard.reads += 1;
        }
        guard.unlock();
        r
    }

    /// Write the content of `page` into `slot`.
    pub fn write_slot(&self, slot: SlotId, page: &Page) -> Result<(), KernelError> {
        let mut guard = self.table.lock();
        guard.slot(slot);
        let r = page.with_inner(|buf| {
            let mut sector = [0u8; SECTOR_SIZE];
            for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
                sector.copy_from_slice(chunk);
                self.disk.write(slot.sector() + i, &sector)?;
            }
            Ok(())
        });
        if r.is_ok() {
            guard.slot(slot).written = true;
            guard.writes += 1;
        }
        guard.unlock();
        r
    }

    /// Record that the page of `mapping` lives in `slot`.
    pub fn attach(&self, slot: SlotId, mapping: Mapping) {
        let mut guard = self.table.lock();
        let key = mapping.key();
        guard.slot(slot).sharers.push(mapping);
        let prev = guard.index.insert(key, slot);
        guard.unlock();
        assert!(prev.is_none(), "{:?} is already in swap slot {:?}.", key, prev);
    }

    /// The slot that holds the page `key`, if it is swapped out.
    pub fn slot_of(&self, key: PageKey) -> Option<SlotId> {
        let guard = self.table.lock();
        let slot = guard.index.get(&key).copied();
        guard.unlock();
        slot
    }

    /// Returns `true` if `slot` holds data written to disk.
    pub fn is_written(&self, slot: SlotId) -> bool {
        let mut guard = self.table.lock();
        let written = guard.slot(slot).written;
        guard.unlock();
        written
    }

    /// Free `slot` and return the pages that lived in it.
    ///
    /// Called once the content of the slot is back in memory.
    pub fn take_sharers(&self, slot: SlotId) -> Vec<Mapping> {
        let mut guard = self.table.lock();
        let sharers = guard.release(slot);
        guard.unlock();
        sharers
    }

    /// Forget that the page `key` lives in swap.
    ///
    /// The slot is freed when its last page leaves.
    ///
    /// # Returns
    /// `true` if the page was in swap.
    pub fn detach(&self, key: PageKey) -> bool {
        let mut guard = self.table.lock();
        let found = if let Some(slot) = guard.index.remove(&key) {
            let s = guard.slot(slot);
            s.sharers.retain(|m| m.key() != key);
            if s.sharers.is_empty() {
                guard.release(slot);
            }
            true
        } else {
            false
        };
        guard.unlock();
        found
    }

    /// Number of pages that live in `slot`.
    pub fn sharer_cnt(&self, slot: SlotId) -> usize {
        let mut guard = self.table.lock();
        let cnt = guard.slot(slot).sharers.len();
        guard.unlock();
        cnt
    }
}

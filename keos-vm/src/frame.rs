//! # Frame Table
//!
//! The frame table is the registry of every physical frame that holds the
//! data of a user page. Frames live in an arena and are named by [`FrameId`];
//! a second index maps each [`PageKey`] to the frame that backs it, so the
//! table answers both "who uses this frame" and "which frame backs this page".
//!
//! A frame can back several virtual pages at once. After `fork`, the parent
//! and the child share every resident page until one of them writes to it.
//! The frame keeps the list of [`Mapping`]s that share it, and the reference
//! count of the frame is simply the length of that list. A frame with no
//! sharer left is released immediately.
//!
//! ## Write protection
//!
//! Whether a page table entry is writable is derived, never stored: a mapping
//! is writable only if its virtual page is writable *and* it is the only
//! sharer of the frame. [`FrameTable::share`] downgrades every sharer to
//! read-only, and [`FrameTable::detach`] restores the last remaining sharer.
//!
//! ## Eviction
//!
//! When physical memory runs out, [`FrameTable::acquire_frame`] reclaims a
//! frame with the **clock** (second chance) algorithm. The frames form a
//! circular list swept by a persistent hand. A frame any of whose sharers has
//! the accessed bit set gets a second chance: the bits are cleared and the
//! hand moves on. The first frame found with every accessed bit clear is the
//! victim. If two full sweeps find nothing, the frame under the hand is taken.
//!
//! The victim is written to its backing store according to its [`Backing`]
//! and every sharer is unmapped. Dirtiness is the union of a software flag and
//! the dirty bits of all sharers; the dirty bit of a mapping is folded into
//! the software flag whenever the mapping is removed.
//!
//! A file-backed mapping that leaves a shared frame takes its modifications
//! with it: [`FrameTable::flush`] writes the frame back to the file if that
//! mapping (or an earlier one) dirtied it, and the frame is clean afterwards.
//! The sharers that stay behind only write back what they change later.
use crate::{
    Mapping, PageKey,
    page::{anon, file::FilePage},
    swap::SwapStore,
};
use alloc::{collections::BTreeMap, vec::Vec};
use keos::{
    KernelError,
    mm::{
        Page, PhysicalMemory,
        page_table::{Permission, PteFlags},
    },
};

/// Index of a frame in the frame table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameId(usize);

/// Where the content of a frame goes when the frame is reclaimed.
#[derive(Clone)]
pub enum Backing {
    /// Anonymous memory. Written to the swap disk.
    Anon,
    /// A page of a file. Written back to the file.
    File(FilePage),
}

/// A physical frame that holds user data.
pub struct Frame {
    page: Page,
    sharers: Vec<Mapping>,
    backing: Backing,
    dirty: bool,
}

impl Frame {
    /// The physical page of this frame.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// The virtual pages that share this frame.
    pub fn sharers(&self) -> &[Mapping] {
        &self.sharers
    }

    /// The backing store of this frame.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Returns `true` if the frame was modified since it was loaded.
    ///
    /// Only the dirty bits of mappings that were already removed are
    /// accounted for.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn permission_of(&self, m: &Mapping) -> Permission {
        Permission::user(m.writable && self.sharers.len() == 1)
    }

    fn map(&self, m: &Mapping) {
        let mut pt = m.space.page_table().lock();
        let r = pt.map(m.va, self.page.pa(), self.permission_of(m));
        pt.unlock();
        if let Err(e) = r {
            panic!("Failed to map {:?}: {:?}", m, e);
        }
    }

    /// Write the content of the frame back to the file it was loaded from.
    ///
    /// Anonymous frames have nowhere to go and are left alone.
    pub fn write_back(&self) -> Result<(), KernelError> {
        match &self.backing {
            Backing::File(f) if self.dirty => f.write_back(&self.page),
            _ => Ok(()),
        }
    }
}

// Unmap `m`, returning its dirty bit.
fn unmap(m: &Mapping) -> bool {
    let mut pt = m.space.page_table().lock();
    let dirty = pt.is_dirty(m.va);
    let r = pt.unmap(m.va);
    pt.unlock();
    debug_assert!(r.is_ok(), "{:?} was not mapped.", m);
    dirty
}

// Read and clear the dirty bit of `m`.
fn take_dirty(m: &Mapping) -> bool {
    let mut pt = m.space.page_table().lock();
    let dirty = pt.is_dirty(m.va);
    pt.set_dirty(m.va, false);
    pt.unlock();
    dirty
}

fn set_writable(m: &Mapping, writable: bool) {
    let mut pt = m.space.page_table().lock();
    if let Ok(pte) = pt.walk_mut(m.va) {
        let mut flags = pte.flags();
        flags.set(PteFlags::RW, writable);
        pte.set_flags(flags);
    }
    pt.unlock();
}

fn test_and_clear_accessed(m: &Mapping) -> bool {
    let mut pt = m.space.page_table().lock();
    let accessed = pt.is_accessed(m.va);
    pt.set_accessed(m.va, false);
    pt.unlock();
    accessed
}

/// The frame table.
pub struct FrameTable {
    ram: PhysicalMemory,
    frames: Vec<Option<Frame>>,
    vacant: Vec<FrameId>,
    resident: BTreeMap<PageKey, FrameId>,
    clock: Vec<FrameId>,
    hand: usize,
    evictions: usize,
}

impl FrameTable {
    /// Create an empty frame table that takes frames from `ram`.
    pub fn new(ram: PhysicalMemory) -> Self {
        Self {
            ram,
            frames: Vec::new(),
            vacant: Vec::new(),
            resident: BTreeMap::new(),
            clock: Vec::new(),
            hand: 0,
            evictions: 0,
        }
    }

    /// Number of frames in the table.
    pub fn len(&self) -> usize {
        self.clock.len()
    }

    /// Returns `true` if no frame holds user data.
    pub fn is_empty(&self) -> bool {
        self.clock.is_empty()
    }

    /// Number of frames reclaimed by eviction so far.
    pub fn evictions(&self) -> usize {
        self.evictions
    }

    /// The frame that backs the page `key`, if it is resident.
    pub fn frame_of(&self, key: PageKey) -> Option<FrameId> {
        self.resident.get(&key).copied()
    }

    /// Look up a frame.
    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.0).and_then(Option::as_ref)
    }

    fn frame_mut(&mut self, id: FrameId) -> &mut Frame {
        match self.frames.get_mut(id.0).and_then(Option::as_mut) {
            Some(frame) => frame,
            None => panic!("{:?} is not in use.", id),
        }
    }

    /// Get a physical page for a new frame.
    ///
    /// Free memory is used first. Otherwise a victim chosen by
    /// [`FrameTable::select_victim`] is written out and its page reused.
    ///
    /// # Returns
    /// - `Ok(Page)`: a page that no frame refers to.
    /// - `Err(KernelError::NoMemory)`: there is nothing to evict.
    /// - `Err(KernelError)`: the victim could not be written out. The victim
    ///   stays resident and mapped.
    pub fn acquire_frame(&mut self, swap: &SwapStore) -> Result<Page, KernelError> {
        if let Some(page) = self.ram.alloc_page() {
            return Ok(page);
        }
        let victim = self.select_victim().ok_or(KernelError::NoMemory)?;
        self.evict(victim, swap)
    }

    /// Pick the next victim of the clock algorithm.
    pub fn select_victim(&mut self) -> Option<FrameId> {
        let n = self.clock.len();
        if n == 0 {
            return None;
        }
        for _ in 0..2 * n {
            if self.hand >= n {
                self.hand = 0;
            }
            let id = self.clock[self.hand];
            if !self.mark_accessed_clear(id) {
                return Some(id);
            }
            self.hand += 1;
        }
        // Every sharer kept touching its page while we swept.
        if self.hand >= n {
            self.hand = 0;
        }
        Some(self.clock[self.hand])
    }

    /// Clear the accessed bit of every mapping of the frame.
    ///
    /// # Returns
    /// `true` if any of them was set.
    pub fn mark_accessed_clear(&mut self, id: FrameId) -> bool {
        self.frame_mut(id)
            .sharers
            .iter()
            .fold(false, |acc, m| test_and_clear_accessed(m) | acc)
    }

    fn evict(&mut self, id: FrameId, swap: &SwapStore) -> Result<Page, KernelError> {
        let frame = self.frame_mut(id);
        for m in frame.sharers.iter() {
            frame.dirty |= unmap(m);
        }
        let r = match &frame.backing {
            Backing::Anon => anon::swap_out(&frame.page, &frame.sharers, frame.dirty, swap),
            Backing::File(_) => frame.write_back(),
        };
        if let Err(e) = r {
            warning!("Failed to evict {:?}: {:?}", frame.page, e);
            for m in frame.sharers.iter() {
                frame.map(m);
            }
            return Err(e);
        }
        let frame = self.release_frame(id);
        self.evictions += 1;
        debug!(
            "Evicted {:?} ({} sharers, {}).",
            frame.page,
            frame.sharers.len(),
            if frame.dirty { "dirty" } else { "clean" }
        );
        Ok(frame.page)
    }

    /// Register `page` as a frame shared by `sharers` and map it into every
    /// sharer's page table.
    pub fn install(
        &mut self,
        page: Page,
        backing: Backing,
        sharers: Vec<Mapping>,
        dirty: bool,
    ) -> FrameId {
        assert!(!sharers.is_empty(), "Installing a frame without a user.");
        let frame = Frame {
            page,
            sharers,
            backing,
            dirty,
        };
        for m in frame.sharers.iter() {
            frame.map(m);
        }
        let id = match self.vacant.pop() {
            Some(id) => id,
            None => {
                self.frames.push(None);
                FrameId(self.frames.len() - 1)
            }
        };
        for m in frame.sharers.iter() {
            let prev = self.resident.insert(m.key(), id);
            assert!(prev.is_none(), "{:?} is already resident.", m);
        }
        self.frames[id.0] = Some(frame);
        self.clock.push(id);
        id
    }

    /// Remove a frame from the table.
    ///
    /// The sharers must already be unmapped. The page returns to the free
    /// pool when the returned [`Frame`] is dropped.
    pub fn release_frame(&mut self, id: FrameId) -> Frame {
        let frame = match self.frames.get_mut(id.0).and_then(Option::take) {
            Some(frame) => frame,
            None => panic!("{:?} is not in use.", id),
        };
        for m in frame.sharers.iter() {
            self.resident.remove(&m.key());
        }
        if let Some(pos) = self.clock.iter().position(|f| *f == id) {
            self.clock.remove(pos);
            if pos < self.hand {
                self.hand -= 1;
            }
        }
        self.vacant.push(id);
        frame
    }

    /// Let `mapping` share the frame `id`.
    ///
    /// Every sharer, including the new one, is mapped read-only.
    pub fn share(&mut self, id: FrameId, mapping: Mapping) {
        let key = mapping.key();
        let frame = self.frame_mut(id);
        for m in frame.sharers.iter() {
            set_writable(m, false);
        }
        frame.sharers.push(mapping);
        if let Some(m) = frame.sharers.last() {
            frame.map(m);
        }
        let prev = self.resident.insert(key, id);
        assert!(prev.is_none(), "{:?} is already resident.", key);
    }

    /// Stop sharing the frame `id` with the page `key`.
    ///
    /// # Returns
    /// The frame if `key` was its last sharer.
    pub fn detach(&mut self, id: FrameId, key: PageKey) -> Option<Frame> {
        let frame = self.frame_mut(id);
        let Some(pos) = frame.sharers.iter().position(|m| m.key() == key) else {
            panic!("{:?} does not share {:?}.", key, id);
        };
        let m = frame.sharers.remove(pos);
        frame.dirty |= unmap(&m);
        let remaining = frame.sharers.len();
        self.resident.remove(&key);
        match remaining {
            0 => Some(self.release_frame(id)),
            1 => {
                self.restore_writable(id);
                None
            }
            _ => None,
        }
    }

    /// Write the file-backed frame `id` back on behalf of its sharer `key`.
    ///
    /// The dirty bit of `key` is folded into the frame first. A dirty frame
    /// is written back and becomes clean. Anonymous frames are left alone.
    pub fn flush(&mut self, id: FrameId, key: PageKey) -> Result<(), KernelError> {
        let frame = self.frame_mut(id);
        if !matches!(frame.backing, Backing::File(_)) {
            return Ok(());
        }
        if let Some(m) = frame.sharers.iter().find(|m| m.key() == key) {
            frame.dirty |= take_dirty(m);
        }
        frame.write_back()?;
        frame.dirty = false;
        Ok(())
    }

    /// Make the frame writable again for its only sharer.
    ///
    /// # Returns
    /// `true` if the frame has a single, writable sharer.
    pub fn restore_writable(&mut self, id: FrameId) -> bool {
        let frame = self.frame_mut(id);
        match frame.sharers.as_slice() {
            [m] if m.writable => {
                set_writable(m, true);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressSpace, SECTORS_PER_SLOT};
    use abyss::dev::RamDisk;
    use alloc::{sync::Arc, vec};
    use keos::{addressing::Va, fs::Disk};

    fn va(v: usize) -> Va {
        Va::new(v).unwrap()
    }

    fn setup(frames: usize) -> (FrameTable, SwapStore) {
        let swap = SwapStore::new(Disk::new(Arc::new(RamDisk::new(16 * SECTORS_PER_SLOT))));
        (FrameTable::new(PhysicalMemory::new(frames)), swap)
    }

    fn touch(space: &AddressSpace, addr: Va, write: bool) {
        let mut pt = space.page_table().lock();
        let r = pt.translate(addr, write, true);
        pt.unlock();
        assert!(r.is_ok(), "{:?} must be accessible.", addr);
    }

    fn is_writable(space: &AddressSpace, addr: Va) -> bool {
        let pt = space.page_table().lock();
        let w = pt
            .walk(addr)
            .map(|pte| pte.flags().contains(PteFlags::RW))
            .unwrap_or(false);
        pt.unlock();
        w
    }

    #[test]
    fn install_and_detach() {
        let (mut frames, swap) = setup(2);
        let s = AddressSpace::new();
        let page = frames.acquire_frame(&swap).unwrap();
        let id = frames.install(page, Backing::Anon, vec![s.mapping(va(0x1000), true)], false);
        assert_eq!(frames.frame_of(s.key(va(0x1000))), Some(id));
        assert!(is_writable(&s, va(0x1000)));
        assert!(frames.detach(id, s.key(va(0x1000))).is_some());
        assert!(frames.is_empty());
        assert_eq!(frames.frame_of(s.key(va(0x1000))), None);
        let pt = s.page_table().lock();
        let empty = pt.is_empty();
        pt.unlock();
        assert!(empty, "Detached page must be unmapped.");
    }

    #[test]
    fn share_write_protects_and_detach_restores() {
        let (mut frames, swap) = setup(1);
        let (p, c) = (AddressSpace::new(), AddressSpace::new());
        let a = va(0x2000);
        let page = frames.acquire_frame(&swap).unwrap();
        let id = frames.install(page, Backing::Anon, vec![p.mapping(a, true)], false);
        frames.share(id, c.mapping(a, true));
        assert!(!is_writable(&p, a), "Shared frame must be read-only.");
        assert!(!is_writable(&c, a), "Shared frame must be read-only.");
        assert_eq!(frames.get(id).map(|f| f.sharers().len()), Some(2));

        assert!(frames.detach(id, c.key(a)).is_none());
        assert!(is_writable(&p, a), "Sole sharer must become writable.");
    }

    #[test]
    fn clock_gives_second_chance() {
        let (mut frames, swap) = setup(2);
        let s = AddressSpace::new();
        let (a, b) = (va(0x1000), va(0x2000));
        for addr in [a, b] {
            let page = frames.acquire_frame(&swap).unwrap();
            frames.install(page, Backing::Anon, vec![s.mapping(addr, true)], false);
        }
        touch(&s, a, false);
        let victim = frames.select_victim();
        assert_eq!(victim, frames.frame_of(s.key(b)), "Unaccessed frame first.");

        // Both accessed: the sweep clears everything and picks one.
        touch(&s, a, false);
        touch(&s, b, false);
        assert!(frames.select_victim().is_some());
    }

    #[test]
    fn eviction_moves_dirty_page_to_swap() {
        let (mut frames, swap) = setup(1);
        let s = AddressSpace::new();
        let a = va(0x1000);
        let page = frames.acquire_frame(&swap).unwrap();
        page.with_inner_mut(|b| b[0] = 0x77);
        frames.install(page, Backing::Anon, vec![s.mapping(a, true)], false);
        touch(&s, a, true);

        let page = frames.acquire_frame(&swap).unwrap();
        assert_eq!(frames.evictions(), 1);
        assert_eq!(frames.frame_of(s.key(a)), None);
        let slot = swap.slot_of(s.key(a)).expect("Evicted page must be in swap.");
        assert!(swap.is_written(slot));
        swap.read_slot(slot, &page).unwrap();
        assert_eq!(page.with_inner(|b| b[0]), 0x77);
    }

    #[test]
    fn clean_eviction_skips_disk() {
        let (mut frames, swap) = setup(1);
        let s = AddressSpace::new();
        let a = va(0x1000);
        let page = frames.acquire_frame(&swap).unwrap();
        frames.install(page, Backing::Anon, vec![s.mapping(a, true)], false);
        touch(&s, a, false);
        let _page = frames.acquire_frame(&swap).unwrap();
        let slot = swap.slot_of(s.key(a)).unwrap();
        assert!(!swap.is_written(slot), "Clean page must not be written.");
        assert_eq!(swap.io_cnt(), (0, 0));
    }

    #[test]
    fn flush_cleans_shared_file_frame() {
        use crate::page::file::FilePage;
        use keos::fs::MemFs;

        let (mut frames, swap) = setup(2);
        let file = MemFs::new().create("f", &[0; 16]).unwrap();
        let backing = Backing::File(FilePage::new(file.reopen(), 0, 16));
        let (p, c) = (AddressSpace::new(), AddressSpace::new());
        let a = va(0x3000);
        let page = frames.acquire_frame(&swap).unwrap();
        let id = frames.install(page, backing, vec![p.mapping(a, true)], false);
        touch(&p, a, true);
        if let Some(frame) = frames.get(id) {
            frame.page().with_inner_mut(|b| b[0] = 9);
        }
        frames.share(id, c.mapping(a, true));

        // The sharer that never wrote has nothing to flush.
        frames.flush(id, c.key(a)).unwrap();
        let mut buf = [0; 1];
        file.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0]);

        frames.flush(id, p.key(a)).unwrap();
        file.read(0, &mut buf).unwrap();
        assert_eq!(buf, [9], "Dirty sharer must be written back.");
        assert_eq!(frames.get(id).map(Frame::is_dirty), Some(false));

        // Nothing left to write once the writer is gone.
        file.write(0, &[5]).unwrap();
        frames.detach(id, p.key(a));
        assert!(frames.detach(id, c.key(a)).is_some_and(|f| !f.is_dirty()));
        file.read(0, &mut buf).unwrap();
        assert_eq!(buf, [5]);
    }

    #[test]
    fn failed_eviction_keeps_victim() {
        let swap = SwapStore::new(Disk::new(Arc::new(RamDisk::new(0))));
        let mut frames = FrameTable::new(PhysicalMemory::new(1));
        let s = AddressSpace::new();
        let a = va(0x1000);
        let page = frames.acquire_frame(&swap).unwrap();
        frames.install(page, Backing::Anon, vec![s.mapping(a, true)], false);
        assert_eq!(frames.acquire_frame(&swap).err(), Some(KernelError::NoSpace));
        assert!(frames.frame_of(s.key(a)).is_some());
        touch(&s, a, true);
    }
}

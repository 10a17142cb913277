//! # Supplemental Page Table
//!
//! The hardware page table only knows about pages that are in memory right
//! now. The supplemental page table knows about every page a process may
//! touch: pages not yet loaded, pages in swap, and pages backed by a file. The
//! fault handler consults it to decide what a faulting address should
//! contain, and teardown walks it to release everything the process holds.
//!
//! Entries are kept in address order, so iteration is deterministic.
use crate::{
    AddressSpace, VmCtx,
    page::{Page, PageState},
};
use alloc::collections::{BTreeMap, btree_map::Entry};
use core::ops::Range;
use keos::{KernelError, addressing::Va};

/// The supplemental page table of a process.
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<Va, Page>,
}

impl SupplementalPageTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the page that contains `va`.
    pub fn find(&self, va: Va) -> Option<&Page> {
        self.pages.get(&va.page_down())
    }

    /// Find the page that contains `va`, mutably.
    pub fn find_mut(&mut self, va: Va) -> Option<&mut Page> {
        self.pages.get_mut(&va.page_down())
    }

    /// Insert `page`.
    ///
    /// # Returns
    /// - `Err(KernelError::FileExist)` if a page already exists at its
    ///   address. The table is left unchanged.
    pub fn insert(&mut self, page: Page) -> Result<(), KernelError> {
        match self.pages.entry(page.va()) {
            Entry::Occupied(_) => Err(KernelError::FileExist),
            Entry::Vacant(v) => {
                v.insert(page);
                Ok(())
            }
        }
    }

    /// Remove and destroy the page that contains `va`.
    ///
    /// # Returns
    /// `true` if there was such a page.
    pub fn remove(&mut self, va: Va, space: &AddressSpace, ctx: &mut VmCtx) -> bool {
        match self.pages.remove(&va.page_down()) {
            Some(page) => {
                page.destroy(space, ctx);
                true
            }
            None => false,
        }
    }

    /// Returns `true` if any page lies in `range`.
    pub fn overlaps(&self, range: Range<Va>) -> bool {
        self.pages.range(range.start.page_down()..range.end).next().is_some()
    }

    /// Iterate over the pages in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    /// Number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if the table has no page.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Copy every page of this table into `dst`, the table of a child
    /// process.
    ///
    /// Untouched pages are duplicated as they are. Pages in memory are shared
    /// with the child copy-on-write, and pages in swap share their slot. A
    /// file-backed page that is not in memory is reloaded from the file on
    /// demand by each process on its own.
    pub fn copy_into(
        &self,
        dst: &mut SupplementalPageTable,
        src_space: &AddressSpace,
        dst_space: &AddressSpace,
        ctx: &mut VmCtx,
    ) -> Result<(), KernelError> {
        for (va, page) in self.pages.iter() {
            let key = src_space.key(*va);
            match page.state() {
                PageState::Uninit(_) => (),
                state => {
                    let mapping = dst_space.mapping(*va, page.writable());
                    if let Some(id) = ctx.frames.frame_of(key) {
                        ctx.frames.share(id, mapping);
                    } else if let Some(slot) = ctx.swap.slot_of(key) {
                        ctx.swap.attach(slot, mapping);
                    } else if let PageState::Anon(_) = state {
                        panic!("Anonymous page {:?} is neither resident nor in swap.", key);
                    }
                }
            }
            dst.insert(page.clone())?;
        }
        Ok(())
    }

    /// Destroy every page.
    pub fn kill(&mut self, space: &AddressSpace, ctx: &mut VmCtx) {
        while let Some((_, page)) = self.pages.pop_first() {
            page.destroy(space, ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Vm, VmConfig,
        page::{LazyLoad, VmType},
    };

    fn va(v: usize) -> Va {
        Va::new(v).unwrap()
    }

    fn zero_page(addr: usize) -> Page {
        Page::new_uninit(va(addr), true, VmType::Anon, LazyLoad::Zero).unwrap()
    }

    #[test]
    fn insert_and_find() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(zero_page(0x1000)).unwrap();
        assert_eq!(
            spt.insert(zero_page(0x1000)).err(),
            Some(KernelError::FileExist),
            "Duplicated insert must fail."
        );
        assert_eq!(spt.find(va(0x1ff8)).map(Page::va), Some(va(0x1000)));
        assert!(spt.find(va(0x2000)).is_none());
        assert!(spt.overlaps(va(0x1800)..va(0x3000)));
        assert!(!spt.overlaps(va(0x2000)..va(0x3000)));
        assert_eq!(spt.find(va(0x1000)).map(Page::ty), Some(VmType::Anon));
    }

    #[test]
    fn copy_shares_resident_frames() {
        let vm = Vm::new(VmConfig::new().frames(4));
        let (p, c) = (AddressSpace::new(), AddressSpace::new());
        let (mut src, mut dst) = (SupplementalPageTable::new(), SupplementalPageTable::new());
        src.insert(zero_page(0x1000)).unwrap();
        src.insert(zero_page(0x2000)).unwrap();

        vm.with_locked(|ctx| {
            src.find_mut(va(0x1000)).unwrap().swap_in(&p, ctx).unwrap();
            src.copy_into(&mut dst, &p, &c, ctx).unwrap();
            let id = ctx.frames.frame_of(p.key(va(0x1000))).unwrap();
            assert_eq!(ctx.frames.frame_of(c.key(va(0x1000))), Some(id));
            assert_eq!(ctx.frames.get(id).map(|f| f.sharers().len()), Some(2));
        });
        assert_eq!(dst.len(), 2);
        assert!(dst.find(va(0x2000)).unwrap().is_uninit());

        vm.with_locked(|ctx| {
            src.kill(&p, ctx);
            assert_eq!(ctx.frames.len(), 1, "Child still holds the frame.");
            dst.kill(&c, ctx);
            assert!(ctx.frames.is_empty());
        });
        assert_eq!(vm.stats().free_frames, 4);
    }
}

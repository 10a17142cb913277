//! # Virtual Pages
//!
//! Every virtual page a process may touch is described by a [`Page`] in its
//! supplemental page table. A page is one of three kinds:
//!
//! - **Uninitialized** ([`UninitPage`]): the page was described but never
//!   touched. It knows what it will become and how to produce its first
//!   content (a [`LazyLoad`]).
//! - **Anonymous** ([`AnonPage`]): memory without a file behind it, such as
//!   the stack or a program's data segment. Reclaimed to the swap disk.
//! - **File-backed** ([`FilePage`]): a page of a memory-mapped file.
//!   Reclaimed by writing it back to the file.
//!
//! An uninitialized page turns into its target kind exactly once, on its
//! first fault. The kinds share three operations, dispatched with a `match`:
//!
//! - `swap_in`: bring the content into a frame and map it.
//! - `swap_out`: write the content of a victim frame to its backing store.
//!   This happens on eviction, per frame rather than per page, and lives in
//!   [`FrameTable`](crate::frame::FrameTable).
//! - `destroy`: release everything the page holds when the process drops it.
use crate::{AddressSpace, VmCtx};
use keos::{KernelError, addressing::Va};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod anon;
pub mod file;
pub mod uninit;

pub use anon::AnonPage;
pub use file::FilePage;
pub use uninit::{LazyLoad, UninitPage};

/// Kind of a virtual page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum VmType {
    /// Not yet initialized.
    Uninit = 0,
    /// Anonymous memory.
    Anon = 1,
    /// Memory-mapped file.
    File = 2,
}

/// The kind-specific state of a page.
#[derive(Clone)]
pub enum PageState {
    /// Not yet initialized.
    Uninit(UninitPage),
    /// Anonymous memory.
    Anon(AnonPage),
    /// Memory-mapped file.
    File(FilePage),
}

/// A virtual page.
#[derive(Clone)]
pub struct Page {
    va: Va,
    writable: bool,
    state: PageState,
}

impl Page {
    /// Describe the page at `va` that will become a `ty` page when it is
    /// first touched.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if `load` cannot produce a `ty`
    ///   page: a file page needs a file to load from, and an uninitialized
    ///   page cannot stay uninitialized.
    pub fn new_uninit(
        va: Va,
        writable: bool,
        ty: VmType,
        load: LazyLoad,
    ) -> Result<Self, KernelError> {
        match (ty, &load) {
            (VmType::Anon, _) | (VmType::File, LazyLoad::Segment { .. }) => Ok(Self {
                va: va.page_down(),
                writable,
                state: PageState::Uninit(UninitPage::new(ty, load)),
            }),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Page-aligned virtual address of the page.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Returns `true` if the page may be written.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The kind-specific state of the page.
    #[inline]
    pub fn state(&self) -> &PageState {
        &self.state
    }

    /// The kind of the page.
    ///
    /// An uninitialized page reports the kind it will turn into.
    pub fn ty(&self) -> VmType {
        match &self.state {
            PageState::Uninit(u) => u.ty(),
            PageState::Anon(_) => VmType::Anon,
            PageState::File(_) => VmType::File,
        }
    }

    /// Returns `true` if the page has never been touched.
    pub fn is_uninit(&self) -> bool {
        matches!(self.state, PageState::Uninit(_))
    }

    /// Bring the page into memory and map it into `space`.
    ///
    /// The page must not be resident.
    pub fn swap_in(&mut self, space: &AddressSpace, ctx: &mut VmCtx) -> Result<(), KernelError> {
        let mapping = space.mapping(self.va, self.writable);
        match &self.state {
            PageState::Uninit(u) => {
                self.state = u.swap_in(mapping, ctx)?;
                Ok(())
            }
            PageState::Anon(a) => a.swap_in(mapping.key(), ctx),
            PageState::File(f) => f.swap_in(mapping, ctx),
        }
    }

    /// Release the frame, the swap slot and the file handle of the page.
    ///
    /// Dirty file-backed content is written back. Failure to write back is
    /// reported and otherwise ignored.
    pub fn destroy(self, space: &AddressSpace, ctx: &mut VmCtx) {
        let key = space.key(self.va);
        match self.state {
            PageState::Uninit(_) => (),
            PageState::Anon(a) => a.destroy(key, ctx),
            PageState::File(f) => f.destroy(key, ctx),
        }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Page({:?}, {:?}, {})",
            self.va,
            match &self.state {
                PageState::Uninit(_) => VmType::Uninit,
                PageState::Anon(_) => VmType::Anon,
                PageState::File(_) => VmType::File,
            },
            if self.writable { "rw" } else { "ro" }
        )
    }
}

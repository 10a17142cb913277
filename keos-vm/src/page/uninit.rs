//! Uninitialized pages.
//!
//! Nothing is allocated for a page until it is touched. An [`UninitPage`]
//! records what the page will turn into and a [`LazyLoad`] that produces its
//! first content. On the first fault the page gets a frame, the load runs, and
//! the page is replaced by an anonymous or file-backed page for good.
use super::{AnonPage, FilePage, PageState, VmType};
use crate::{Mapping, VmCtx, frame::Backing};
use alloc::vec;
use keos::{KernelError, fs::RegularFile};

/// How to produce the first content of a page.
#[derive(Clone)]
pub enum LazyLoad {
    /// A zero-filled page.
    Zero,
    /// `read_bytes` bytes of `file` at `offset`, followed by zeros.
    Segment {
        /// The file to read from.
        file: RegularFile,
        /// Offset of the page in the file.
        offset: usize,
        /// Number of bytes to read. The rest of the page is zero.
        read_bytes: usize,
    },
}

/// A page that was never touched.
#[derive(Clone)]
pub struct UninitPage {
    ty: VmType,
    load: LazyLoad,
}

impl UninitPage {
    pub(super) fn new(ty: VmType, load: LazyLoad) -> Self {
        Self { ty, load }
    }

    /// The kind this page turns into.
    pub fn ty(&self) -> VmType {
        self.ty
    }

    /// The deferred load.
    pub fn load(&self) -> &LazyLoad {
        &self.load
    }

    /// Run the deferred load into a fresh frame and map it.
    ///
    /// # Returns
    /// The state the page turns into.
    pub(super) fn swap_in(
        &self,
        mapping: Mapping,
        ctx: &mut VmCtx,
    ) -> Result<PageState, KernelError> {
        let (state, backing, dirty) = match (&self.ty, &self.load) {
            (VmType::Anon, LazyLoad::Zero) => (PageState::Anon(AnonPage), Backing::Anon, false),
            // A segment exists nowhere else once it is in memory.
            (VmType::Anon, LazyLoad::Segment { .. }) => {
                (PageState::Anon(AnonPage), Backing::Anon, true)
            }
            (
                VmType::File,
                LazyLoad::Segment {
                    file,
                    offset,
                    read_bytes,
                },
            ) => {
                let page = FilePage::new(file.reopen(), *offset, *read_bytes);
                (PageState::File(page.clone()), Backing::File(page), false)
            }
            _ => unreachable!("{:?} page with an impossible loader.", self.ty),
        };
        let buf = match &self.load {
            LazyLoad::Zero => None,
            LazyLoad::Segment {
                file,
                offset,
                read_bytes,
            } => Some(FilePage::read_page(file, *offset, *read_bytes)?),
        };
        let page = ctx.frames.acquire_frame(ctx.swap)?;
        if let Some(buf) = buf {
            page.with_inner_mut(|b| b.copy_from_slice(buf.as_ref()));
        }
        ctx.frames.install(page, backing, vec![mapping], dirty);
        Ok(state)
    }
}

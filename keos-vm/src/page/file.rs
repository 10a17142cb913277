//! File-backed pages.
//!
//! A file-backed page caches `read_bytes` bytes of a file starting at
//! `offset`; the rest of the page is zero. The file itself is the backing
//! store: clean pages are simply dropped on eviction, and dirty pages are
//! written back first. Write-back never extends the file: only the part of
//! the page that lies inside the file is written.
use crate::{Mapping, PageKey, VmCtx, frame::Backing};
use alloc::{boxed::Box, vec};
use keos::{KernelError, addressing::PAGE_SIZE, fs::RegularFile, mm::Page};

/// A page of a memory-mapped file.
#[derive(Clone)]
pub struct FilePage {
    file: RegularFile,
    offset: usize,
    read_bytes: usize,
}

impl FilePage {
    /// A page holding `read_bytes` bytes of `file` at `offset`.
    pub fn new(file: RegularFile, offset: usize, read_bytes: usize) -> Self {
        Self {
            file,
            offset,
            read_bytes: read_bytes.min(PAGE_SIZE),
        }
    }

    /// The file of this page.
    pub fn file(&self) -> &RegularFile {
        &self.file
    }

    /// Offset of this page in the file.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes of the page that come from the file.
    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// Read `read_bytes` bytes of `file` at `offset` into a zero-filled page
    /// buffer.
    pub(crate) fn read_page(
        file: &RegularFile,
        offset: usize,
        read_bytes: usize,
    ) -> Result<Box<[u8; PAGE_SIZE]>, KernelError> {
        let mut buf = Box::new([0; PAGE_SIZE]);
        file.read(offset, &mut buf[..read_bytes.min(PAGE_SIZE)])?;
        Ok(buf)
    }

    /// Write the file part of `page` back to the file.
    pub fn write_back(&self, page: &Page) -> Result<(), KernelError> {
        let len = self
            .read_bytes
            .min(self.file.size().saturating_sub(self.offset));
        if len == 0 {
            return Ok(());
        }
        let mut buf = Box::new([0; PAGE_SIZE]);
        page.with_inner(|b| buf[..len].copy_from_slice(&b[..len]));
        if self.file.write(self.offset, &buf[..len])? != len {
            return Err(KernelError::IOError);
        }
        Ok(())
    }

    pub(super) fn swap_in(&self, mapping: Mapping, ctx: &mut VmCtx) -> Result<(), KernelError> {
        let buf = Self::read_page(&self.file, self.offset, self.read_bytes)?;
        let page = ctx.frames.acquire_frame(ctx.swap)?;
        page.with_inner_mut(|b| b.copy_from_slice(buf.as_ref()));
        ctx.frames
            .install(page, Backing::File(self.clone()), vec![mapping], false);
        Ok(())
    }

    pub(super) fn destroy(&self, key: PageKey, ctx: &mut VmCtx) {
        let Some(id) = ctx.frames.frame_of(key) else {
            return;
        };
        // Other sharers may keep the frame; our modifications leave with us.
        if let Err(e) = ctx.frames.flush(id, key) {
            warning!(
                "Failed to write back {:?} at offset {:#x}: {:?}",
                self.file,
                self.offset,
                e
            );
        }
        ctx.frames.detach(id, key);
    }
}

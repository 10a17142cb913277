//! # Memory-Mapped Files
//!
//! `mmap` makes the content of a file part of the address space. Like every
//! other page, the pages of a mapping are only described at `mmap` time: each
//! becomes an uninitialized page that turns into a file-backed page on its
//! first fault. Modified pages are written back to the file when they are
//! evicted, when the mapping is removed with `munmap`, and when the process
//! exits.
//!
//! A mapping keeps its own handle of the file, so closing the file
//! descriptor it was created from does not unmap it.
//!
//! The last page of a mapping may cover less of the file than a full page.
//! Only the part of the page that lies inside the file is ever read from or
//! written to it; the rest of the page reads as zeros and write-back never
//! extends the file.
//!
//! Program segments are loaded the same lazy way by
//! [`MmStruct::load_segment`], but their pages turn into anonymous pages: a
//! modified data segment must never be written back to the executable. An
//! executable with loaded segments cannot be written until the process exits.
use crate::{
    MAX_STACK_SIZE, MmStruct, USER_STACK_TOP,
    page::{LazyLoad, Page, VmType},
};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::RegularFile,
};

/// A memory-mapped region.
#[derive(Clone)]
pub struct MmapArea {
    start: Va,
    pages: usize,
    file: RegularFile,
}

impl MmapArea {
    /// First address of the mapping.
    pub fn start(&self) -> Va {
        self.start
    }

    /// Number of pages of the mapping.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// The mapped file.
    pub fn file(&self) -> &RegularFile {
        &self.file
    }

    fn page_addrs(&self) -> impl Iterator<Item = Va> + '_ {
        (0..self.pages).map(move |i| self.start + i * PAGE_SIZE)
    }
}

impl MmStruct {
    /// Map `len` bytes of `file`, starting at `offset`, at `addr`.
    ///
    /// # Behavior
    ///
    /// The following conditions must be met, otherwise the call fails
    /// without side effects:
    ///
    /// - `addr` must be non-zero and page-aligned.
    /// - `len` must be non-zero and the range must lie in user space.
    /// - `offset` must be page-aligned.
    /// - The file must not be empty.
    /// - The range must not overlap any existing page or the stack region.
    ///
    /// # Returns
    /// - `Ok(Va)`: the start of the mapping.
    /// - `Err(KernelError::InvalidArgument)` for malformed arguments.
    /// - `Err(KernelError::FileExist)` if the range overlaps.
    pub fn mmap(
        &mut self,
        addr: usize,
        len: usize,
        writable: bool,
        file: &RegularFile,
        offset: usize,
    ) -> Result<Va, KernelError> {
        let start = Va::new(addr).ok_or(KernelError::InvalidArgument)?;
        if addr == 0 || !start.is_page_aligned() || len == 0 || offset % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = start
            .checked_add(len - 1)
            .filter(|last| last.is_user())
            .ok_or(KernelError::InvalidArgument)?
            .page_down()
            + PAGE_SIZE;
        let size = file.size();
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let stack = USER_STACK_TOP - MAX_STACK_SIZE..USER_STACK_TOP;
        if self.spt.overlaps(start..end)
            || (start.into_usize() < stack.end && stack.start < end.into_usize())
        {
            return Err(KernelError::FileExist);
        }

        let area = MmapArea {
            start,
            pages: (end - start) / PAGE_SIZE,
            file: file.reopen(),
        };
        for (i, va) in area.page_addrs().enumerate() {
            let ofs = offset + i * PAGE_SIZE;
            let read_bytes = PAGE_SIZE
                .min(len - i * PAGE_SIZE)
                .min(size.saturating_sub(ofs));
            self.spt.insert(Page::new_uninit(
                va,
                writable,
                VmType::File,
                LazyLoad::Segment {
                    file: area.file.reopen(),
                    offset: ofs,
                    read_bytes,
                },
            )?)?;
        }
        self.mmaps.insert(start, area);
        Ok(start)
    }

    /// Remove the mapping that starts at `addr`.
    ///
    /// Modified pages are written back to the file.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if no mapping starts at `addr`.
    pub fn munmap(&mut self, addr: Va) -> Result<(), KernelError> {
        let area = self
            .mmaps
            .remove(&addr)
            .ok_or(KernelError::InvalidArgument)?;
        let vm = self.vm.clone();
        vm.with_locked(|ctx| {
            for va in area.page_addrs() {
                self.spt.remove(va, &self.space, ctx);
            }
        });
        Ok(())
    }

    /// The mappings of this process, in address order.
    pub fn mmaps(&self) -> impl Iterator<Item = &MmapArea> {
        self.mmaps.values()
    }

    /// System call entry of [`MmStruct::mmap`].
    ///
    /// # Returns
    /// The start of the mapping, or `0` on failure.
    pub fn sys_mmap(
        &mut self,
        addr: usize,
        len: usize,
        writable: bool,
        file: &RegularFile,
        offset: usize,
    ) -> usize {
        self.mmap(addr, len, writable, file, offset)
            .map(Va::into_usize)
            .unwrap_or(0)
    }

    /// System call entry of [`MmStruct::munmap`].
    pub fn sys_munmap(&mut self, addr: usize) -> usize {
        match Va::new(addr)
            .ok_or(KernelError::InvalidArgument)
            .and_then(|va| self.munmap(va))
        {
            Ok(()) => 0,
            Err(e) => e.into_usize(),
        }
    }

    /// Lazily load a program segment.
    ///
    /// `read_bytes` bytes of `file` at `ofs` are mapped at `upage`, followed
    /// by `zero_bytes` zeros. Each page turns into an anonymous page on its
    /// first fault. Writes to `file` are denied while the process lives.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if `upage` or `ofs` is not
    ///   page-aligned, or the segment does not end on a page boundary.
    /// - `Err(KernelError::FileExist)` if the segment overlaps an existing
    ///   page.
    pub fn load_segment(
        &mut self,
        file: &RegularFile,
        mut ofs: usize,
        upage: usize,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        let mut va = Va::new(upage).ok_or(KernelError::InvalidArgument)?;
        if !va.is_page_aligned()
            || ofs % PAGE_SIZE != 0
            || (read_bytes + zero_bytes) % PAGE_SIZE != 0
        {
            return Err(KernelError::InvalidArgument);
        }
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;
            let load = if page_read_bytes == 0 {
                LazyLoad::Zero
            } else {
                LazyLoad::Segment {
                    file: file.reopen(),
                    offset: ofs,
                    read_bytes: page_read_bytes,
                }
            };
            self.spt
                .insert(Page::new_uninit(va, writable, VmType::Anon, load)?)?;
            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            ofs += PAGE_SIZE;
            va += PAGE_SIZE;
        }
        self.denied
            .entry(file.ino())
            .or_insert_with(|| file.deny_write());
        Ok(())
    }
}

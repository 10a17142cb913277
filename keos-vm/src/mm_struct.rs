//! # Memory State of a Process
//!
//! [`MmStruct`] represents the memory state of one process, corresponding to
//! the Linux kernel's `struct mm_struct`. It owns the address space and the
//! supplemental page table of the process, the list of its memory-mapped
//! files, and the executables it loaded segments from.
//!
//! All accesses to user memory go through [`MmStruct::read_user`] and
//! [`MmStruct::write_user`] (accesses by the program itself) or
//! [`MmStruct::copy_from_user`] and [`MmStruct::copy_to_user`] (accesses by
//! the kernel on behalf of a system call). They behave like the memory
//! management unit: each access translates the address through the page
//! table, which sets the accessed and dirty bits, and a failed translation
//! raises a page fault. Once the fault is resolved the access is retried; if
//! it cannot be resolved, the process is terminated.
//!
//! ## Process lifecycle
//!
//! - [`Vm::new_process`] creates an empty process, and
//!   [`MmStruct::setup_stack`] gives it its first stack page.
//! - [`MmStruct::fork`] duplicates the process. Memory is shared
//!   copy-on-write.
//! - [`MmStruct::exit`] terminates the process and releases all of its
//!   memory, writing modified file-backed pages back to their files. Dropping
//!   an [`MmStruct`] does the same without reporting an exit status.
//!
//! [`Vm::new_process`]: crate::Vm::new_process
use crate::{
    AddressSpace, USER_STACK_TOP, Vm,
    mmap::MmapArea,
    page::{LazyLoad, Page, VmType},
    spt::SupplementalPageTable,
};
use alloc::{collections::BTreeMap, string::String};
use core::ops::Range;
use keos::{
    KernelError, PFErrorCode,
    addressing::{PAGE_SIZE, Va},
    fs::{DenyWrite, InodeNumber},
    mm::page_table::PteFlags,
};

/// The memory state of a process.
pub struct MmStruct {
    pub(crate) vm: Vm,
    pub(crate) name: String,
    pub(crate) space: AddressSpace,
    pub(crate) spt: SupplementalPageTable,
    pub(crate) mmaps: BTreeMap<Va, MmapArea>,
    pub(crate) denied: BTreeMap<InodeNumber, DenyWrite>,
    pub(crate) rsp: usize,
    pub(crate) saved_rsp: usize,
    exit_status: Option<i32>,
}

impl MmStruct {
    /// Create the memory state of a process named `name` with an empty
    /// address space.
    pub fn new(vm: Vm, name: impl Into<String>) -> Self {
        Self {
            vm,
            name: name.into(),
            space: AddressSpace::new(),
            spt: SupplementalPageTable::new(),
            mmaps: BTreeMap::new(),
            denied: BTreeMap::new(),
            rsp: USER_STACK_TOP,
            saved_rsp: USER_STACK_TOP,
            exit_status: None,
        }
    }

    /// Name of the process.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The paging subsystem this process belongs to.
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// The address space of the process.
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// The supplemental page table of the process.
    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// The exit status, once the process has exited.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// The user stack pointer.
    pub fn rsp(&self) -> usize {
        self.rsp
    }

    /// Move the user stack pointer.
    pub fn set_rsp(&mut self, rsp: usize) {
        self.rsp = rsp;
    }

    /// Record the user stack pointer on system call entry.
    ///
    /// Faults the kernel raises while serving the system call check stack
    /// growth against this value.
    pub fn syscall_enter(&mut self, rsp: usize) {
        self.saved_rsp = rsp;
    }

    /// Allocate the first stack page and point the stack pointer at the top
    /// of the stack.
    pub fn setup_stack(&mut self) -> Result<(), KernelError> {
        let va = USER_STACK_TOP - PAGE_SIZE;
        self.alloc_page(VmType::Anon, va, true)?;
        self.claim_page(va)?;
        self.rsp = USER_STACK_TOP;
        Ok(())
    }

    /// Record a page at `va` that turns into a `ty` page with the content
    /// produced by `load` when it is first touched.
    ///
    /// `va` is rounded down to its page.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)` if `va` is null or not a user address.
    /// - `Err(KernelError::FileExist)` if a page already exists at `va`.
    /// - `Err(KernelError::InvalidArgument)` if `load` cannot produce a `ty`
    ///   page.
    pub fn alloc_page_with_initializer(
        &mut self,
        ty: VmType,
        va: usize,
        writable: bool,
        load: LazyLoad,
    ) -> Result<(), KernelError> {
        let va = Va::new(va)
            .filter(|va| va.is_user() && va.page_down().into_usize() != 0)
            .ok_or(KernelError::BadAddress)?;
        self.spt.insert(Page::new_uninit(va, writable, ty, load)?)
    }

    /// Record a zero-filled page at `va`.
    pub fn alloc_page(&mut self, ty: VmType, va: usize, writable: bool) -> Result<(), KernelError> {
        self.alloc_page_with_initializer(ty, va, writable, LazyLoad::Zero)
    }

    /// Bring the page at `va` into memory right away.
    pub fn claim_page(&mut self, va: usize) -> Result<(), KernelError> {
        let va = Va::new(va).ok_or(KernelError::BadAddress)?;
        let vm = self.vm.clone();
        vm.with_locked(|ctx| self.claim_locked(va, ctx))
    }

    /// Checks whether the whole range `addr` may be accessed.
    ///
    /// Every page of the range must be recorded (and writable if `is_write`
    /// is set) or be a valid stack growth target.
    pub fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        if addr.start.page_down().into_usize() == 0 || !addr.start.is_user() {
            return false;
        }
        if addr.end <= addr.start {
            return addr.end == addr.start;
        }
        if !(addr.end - 1usize).is_user() {
            return false;
        }
        let mut va = addr.start.page_down();
        while va < addr.end {
            let ok = match self.spt.find(va) {
                Some(page) => !is_write || page.writable(),
                None => self.is_stack_access(va.max(addr.start), false),
            };
            if !ok {
                return false;
            }
            va += PAGE_SIZE;
        }
        true
    }

    /// Validate a single user address passed to a system call.
    pub fn check_address(&self, addr: usize) -> Result<Va, KernelError> {
        let va = Va::new(addr).ok_or(KernelError::BadAddress)?;
        if self.access_ok(va..va, false)
            && (self.spt.find(va).is_some() || self.is_stack_access(va, false))
        {
            Ok(va)
        } else {
            Err(KernelError::BadAddress)
        }
    }

    fn access(
        &mut self,
        addr: usize,
        len: usize,
        is_write: bool,
        is_user: bool,
        mut op: impl FnMut(&mut [u8], usize),
    ) -> Result<(), KernelError> {
        if self.exit_status.is_some() {
            return Err(KernelError::BadAddress);
        }
        let mut done = 0;
        while done < len {
            let cur = addr.wrapping_add(done);
            let Some(va) = Va::new(cur) else {
                self.exit(-1);
                return Err(KernelError::BadAddress);
            };
            let chunk = (PAGE_SIZE - va.offset()).min(len - done);
            let mut pt = self.space.page_table().lock();
            let r = pt.translate(va, is_write, is_user).map(|pa| {
                self.vm.physical_memory().with_frame(pa, |frame| {
                    op(&mut frame[pa.offset()..pa.offset() + chunk], done)
                })
            });
            pt.unlock();
            match r {
                Ok(Some(())) => done += chunk,
                Ok(None) => return Err(KernelError::BadAddress),
                Err(ec) => {
                    if !self.try_handle_fault(
                        cur,
                        is_user,
                        is_write,
                        !ec.contains(PFErrorCode::PRESENT),
                    ) {
                        return Err(KernelError::BadAddress);
                    }
                }
            }
        }
        Ok(())
    }

    /// Read user memory at `addr` into `buf`, as the user program does.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)` if the access faulted and the process
    ///   was terminated.
    pub fn read_user(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        self.access(addr, buf.len(), false, true, |mem, ofs| {
            buf[ofs..ofs + mem.len()].copy_from_slice(mem)
        })
    }

    /// Write `buf` to user memory at `addr`, as the user program does.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)` if the access faulted and the process
    ///   was terminated.
    pub fn write_user(&mut self, addr: usize, buf: &[u8]) -> Result<(), KernelError> {
        self.access(addr, buf.len(), true, true, |mem, ofs| {
            mem.copy_from_slice(&buf[ofs..ofs + mem.len()])
        })
    }

    /// Read user memory at `addr` into `buf` on behalf of a system call.
    pub fn copy_from_user(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        self.access(addr, buf.len(), false, false, |mem, ofs| {
            buf[ofs..ofs + mem.len()].copy_from_slice(mem)
        })
    }

    /// Write `buf` to user memory at `addr` on behalf of a system call.
    pub fn copy_to_user(&mut self, addr: usize, buf: &[u8]) -> Result<(), KernelError> {
        self.access(addr, buf.len(), true, false, |mem, ofs| {
            mem.copy_from_slice(&buf[ofs..ofs + mem.len()])
        })
    }

    /// Duplicate this process.
    ///
    /// The child gets a copy of every page; pages in memory or in swap are
    /// shared copy-on-write.
    pub fn fork(&mut self, name: impl Into<String>) -> Result<MmStruct, KernelError> {
        let mut child = MmStruct::new(self.vm.clone(), name);
        let vm = self.vm.clone();
        vm.with_locked(|ctx| {
            self.spt
                .copy_into(&mut child.spt, &self.space, &child.space, ctx)
        })?;
        child.mmaps = self.mmaps.clone();
        child.denied = self.denied.clone();
        child.rsp = self.rsp;
        child.saved_rsp = self.saved_rsp;
        Ok(child)
    }

    /// Terminate the process with `status`.
    ///
    /// Every page is destroyed. Modified pages of memory-mapped files are
    /// written back.
    pub fn exit(&mut self, status: i32) {
        if self.exit_status.is_some() {
            return;
        }
        info!("{}: exit({})", self.name, status);
        self.exit_status = Some(status);
        self.teardown();
    }

    fn teardown(&mut self) {
        let vm = self.vm.clone();
        vm.with_locked(|ctx| self.spt.kill(&self.space, ctx));
        self.mmaps.clear();
        self.denied.clear();
    }

    /// Number of processes that share the frame backing `va`.
    ///
    /// `0` if the page is not in memory.
    pub fn frame_refcount(&self, va: usize) -> usize {
        let Some(va) = Va::new(va) else {
            return 0;
        };
        let key = self.space.key(va);
        self.vm.with_locked(|ctx| {
            ctx.frames
                .frame_of(key)
                .and_then(|id| ctx.frames.get(id))
                .map(|frame| frame.sharers().len())
                .unwrap_or(0)
        })
    }

    /// Returns `true` if the page at `va` is writable but currently mapped
    /// read-only because its frame is shared.
    pub fn is_write_protected(&self, va: usize) -> bool {
        let Some(va) = Va::new(va) else {
            return false;
        };
        if !self.spt.find(va).is_some_and(Page::writable) {
            return false;
        }
        let pt = self.space.page_table().lock();
        let protected = pt
            .walk(va)
            .map(|pte| !pte.flags().contains(PteFlags::RW))
            .unwrap_or(false);
        pt.unlock();
        protected
    }

    /// Returns `true` if the page at `va` is in memory.
    pub fn is_resident(&self, va: usize) -> bool {
        let Some(va) = Va::new(va) else {
            return false;
        };
        let key = self.space.key(va);
        self.vm.with_locked(|ctx| ctx.frames.frame_of(key).is_some())
    }
}

impl Drop for MmStruct {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            self.teardown();
        }
    }
}

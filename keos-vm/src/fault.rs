//! # Page Fault Resolution
//!
//! Every page fault of a user process ends up in
//! [`MmStruct::handle_page_fault`]. The handler decodes the fault into a
//! [`PageFaultReason`] and sorts it into one of the following cases:
//!
//! 1. **Bad address**: the address is null or belongs to the kernel.
//! 2. **Stack growth**: nothing is recorded at the address, but it lies in the
//!    stack region and no further than [`STACK_SLACK`] bytes below the stack
//!    pointer. A zero-filled anonymous page is added and loaded.
//! 3. **Demand paging**: the page is recorded but not mapped. It is brought in
//!    by the `swap_in` of its kind. Writing to a read-only page is refused.
//! 4. **Copy-on-write**: the page is mapped read-only but the process may
//!    write to it, because the frame is shared with another process since
//!    `fork`. The faulting process gets a private copy of the frame. When it
//!    is the only sharer left, the mapping is made writable again in place.
//! 5. Anything else is an access violation.
//!
//! A fault that cannot be resolved terminates the process with exit status
//! `-1` (see [`MmStruct::try_handle_fault`]).
//!
//! The stack pointer used by the growth check depends on who faulted. A fault
//! raised by the user program uses the user stack pointer at the time of the
//! fault. A fault raised by the kernel while it touches user memory on behalf
//! of a system call uses the user stack pointer saved on system call entry.
//!
//! [`STACK_SLACK`]: crate::STACK_SLACK
use crate::{
    MAX_STACK_SIZE, MmStruct, STACK_SLACK, USER_STACK_TOP, VmCtx,
    frame::Backing,
    page::{LazyLoad, Page, PageState, VmType},
};
use alloc::{boxed::Box, vec};
use keos::{
    KernelError, PFErrorCode,
    addressing::{PAGE_SIZE, Va},
};

/// Represents the reason for a page fault in a virtual memory system.
///
/// This struct is used to capture various details about a page fault,
/// including the faulting address, the type of access that caused the fault
/// (read or write), and who raised it.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,

    /// Indicates whether the fault was due to a write access.
    pub is_write_access: bool,

    /// Indicates whether the page that caused the fault is present in memory.
    ///
    /// A value of `true` means the fault is a protection violation on a
    /// mapped page.
    pub is_present: bool,

    /// Indicates whether the fault was raised by user code.
    ///
    /// `false` means the kernel faulted while touching user memory.
    pub is_user: bool,
}

impl PageFaultReason {
    /// Probe the cause of page fault into a [`PageFaultReason`].
    ///
    /// This function decodes a hardware-provided [`PFErrorCode`] together with
    /// the faulting address (`cr2`).
    pub fn new(ec: PFErrorCode, cr2: Va) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            is_user: ec.contains(PFErrorCode::USER),
        }
    }

    /// Returns `true` if the fault is due to **demand paging**.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }

    /// Returns `true` if the fault may be a **copy-on-write** fault.
    #[inline]
    pub fn is_cow_fault(&self) -> bool {
        self.is_present && self.is_write_access
    }
}

impl MmStruct {
    /// Resolve a page fault, terminating the process if it cannot be
    /// resolved.
    ///
    /// # Parameters
    /// - `addr`: the faulting address.
    /// - `is_user`: the fault was raised by user code.
    /// - `is_write`: the faulting access was a write.
    /// - `is_not_present`: the address was not mapped.
    ///
    /// # Returns
    /// - `true` if the access can be retried.
    /// - `false` if the process was terminated with exit status `-1`.
    pub fn try_handle_fault(
        &mut self,
        addr: usize,
        is_user: bool,
        is_write: bool,
        is_not_present: bool,
    ) -> bool {
        let Some(fault_addr) = Va::new(addr) else {
            self.exit(-1);
            return false;
        };
        let mut ec = PFErrorCode::empty();
        ec.set(PFErrorCode::PRESENT, !is_not_present);
        ec.set(PFErrorCode::WRITE_ACCESS, is_write);
        ec.set(PFErrorCode::USER, is_user);
        match self.handle_page_fault(&PageFaultReason::new(ec, fault_addr)) {
            Ok(()) => true,
            Err(e) => {
                debug!("{}: unresolved fault at {:?}: {:?}", self.name, fault_addr, e);
                self.exit(-1);
                false
            }
        }
    }

    /// Resolve a page fault.
    ///
    /// # Returns
    /// - `Ok(())` if the faulting access can be retried.
    /// - `Err(KernelError::BadAddress)` for null, kernel and unrecorded
    ///   addresses.
    /// - `Err(KernelError::InvalidAccess)` for writes to read-only pages.
    /// - `Err(KernelError)` if memory, swap or I/O failed while loading.
    pub fn handle_page_fault(&mut self, reason: &PageFaultReason) -> Result<(), KernelError> {
        let addr = reason.fault_addr;
        if addr.page_down().into_usize() == 0 || !addr.is_user() {
            return Err(KernelError::BadAddress);
        }
        let vm = self.vm.clone();
        let writable = self.spt.find(addr).map(Page::writable);
        vm.with_locked(|ctx| {
            if reason.is_demand_paging_fault() {
                match writable {
                    None if self.is_stack_access(addr, reason.is_user) => {
                        self.grow_stack(addr, ctx)
                    }
                    None => Err(KernelError::BadAddress),
                    Some(false) if reason.is_write_access => Err(KernelError::InvalidAccess),
                    Some(_) => self.claim_locked(addr, ctx),
                }
            } else if reason.is_cow_fault() && writable == Some(true) {
                self.do_copy_on_write(addr, ctx)
            } else {
                Err(KernelError::InvalidAccess)
            }
        })
    }

    /// Returns `true` if an access at `addr` should grow the stack.
    pub(crate) fn is_stack_access(&self, addr: Va, is_user: bool) -> bool {
        let rsp = if is_user { self.rsp } else { self.saved_rsp };
        let addr = addr.into_usize();
        (USER_STACK_TOP - MAX_STACK_SIZE..USER_STACK_TOP).contains(&addr)
            && addr + STACK_SLACK >= rsp
    }

    fn grow_stack(&mut self, addr: Va, ctx: &mut VmCtx) -> Result<(), KernelError> {
        self.spt.insert(Page::new_uninit(
            addr.page_down(),
            true,
            VmType::Anon,
            LazyLoad::Zero,
        )?)?;
        self.claim_locked(addr, ctx)
    }

    /// Bring the recorded page at `va` into memory.
    ///
    /// Nothing happens if the page is already resident.
    pub(crate) fn claim_locked(&mut self, va: Va, ctx: &mut VmCtx) -> Result<(), KernelError> {
        if ctx.frames.frame_of(self.space.key(va)).is_some() {
            return Ok(());
        }
        let page = self.spt.find_mut(va).ok_or(KernelError::BadAddress)?;
        page.swap_in(&self.space, ctx)
    }

    /// Give the process a private, writable copy of the page at `va`.
    ///
    /// ### Steps:
    /// 1. If the page was evicted in the meantime, load it back. It returns
    ///    with a single sharer, or read-only if still shared.
    /// 2. If the process is the only sharer left, just restore write access.
    /// 3. Otherwise copy the frame content aside, take a new frame, fill it
    ///    with the copy and map it writable in place of the shared one. A
    ///    dirty file-backed frame is written back before it is left.
    fn do_copy_on_write(&mut self, va: Va, ctx: &mut VmCtx) -> Result<(), KernelError> {
        let key = self.space.key(va);
        let id = match ctx.frames.frame_of(key) {
            Some(id) => id,
            None => {
                self.claim_locked(va, ctx)?;
                match ctx.frames.frame_of(key) {
                    Some(id) => id,
                    None => return Err(KernelError::BadAddress),
                }
            }
        };
        if ctx.frames.restore_writable(id) {
            return Ok(());
        }

        let Some(page) = self.spt.find(va) else {
            return Err(KernelError::BadAddress);
        };
        let backing = match page.state() {
            PageState::File(f) => Backing::File(f.clone()),
            _ => Backing::Anon,
        };
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        if let Some(frame) = ctx.frames.get(id) {
            frame.page().with_inner(|b| buf.copy_from_slice(b));
        }
        // Taking a frame may evict the shared one, so look it up again.
        let new = ctx.frames.acquire_frame(ctx.swap)?;
        match ctx.frames.frame_of(key) {
            Some(id) => {
                // What was written before the split belongs to the file, not
                // to the sharers that stay behind.
                ctx.frames.flush(id, key)?;
                ctx.frames.detach(id, key);
            }
            None => {
                ctx.swap.detach(key);
            }
        }
        new.with_inner_mut(|b| b.copy_from_slice(buf.as_ref()));
        ctx.frames
            .install(new, backing, vec![self.space.mapping(va, true)], true);
        Ok(())
    }
}

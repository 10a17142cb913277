//! Anonymous pages.
//!
//! An anonymous page is either resident in a frame or lives in a swap slot;
//! both facts are recorded in the shared indices of the frame table and the
//! swap store, so the page itself carries no state.
use crate::{Mapping, PageKey, VmCtx, frame::Backing, swap::SwapStore};
use keos::{KernelError, mm::Page};

/// An anonymous page.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonPage;

impl AnonPage {
    /// Read the page back from swap.
    ///
    /// Every page that shares the slot comes back with it, and the slot is
    /// freed.
    pub(super) fn swap_in(&self, key: PageKey, ctx: &mut VmCtx) -> Result<(), KernelError> {
        let Some(slot) = ctx.swap.slot_of(key) else {
            panic!("Anonymous page {:?} is neither resident nor in swap.", key);
        };
        let page = ctx.frames.acquire_frame(ctx.swap)?;
        let written = ctx.swap.is_written(slot);
        if written {
            ctx.swap.read_slot(slot, &page)?;
        }
        let sharers = ctx.swap.take_sharers(slot);
        // Data that came from the disk must go back to the disk.
        ctx.frames.install(page, Backing::Anon, sharers, written);
        Ok(())
    }

    pub(super) fn destroy(&self, key: PageKey, ctx: &mut VmCtx) {
        if let Some(id) = ctx.frames.frame_of(key) {
            ctx.frames.detach(id, key);
        } else {
            ctx.swap.detach(key);
        }
    }
}

/// Move the content of a victim frame to a fresh swap slot.
///
/// Clean content is not written: the slot then reads back as zeros.
pub(crate) fn swap_out(
    page: &Page,
    sharers: &[Mapping],
    dirty: bool,
    swap: &SwapStore,
) -> Result<(), KernelError> {
    let slot = swap.allocate_slot()?;
    if dirty {
        if let Err(e) = swap.write_slot(slot, page) {
            swap.free_slot(slot);
            return Err(e);
        }
    }
    for m in sharers.iter() {
        swap.attach(slot, m.clone());
    }
    Ok(())
}

//! Interrupt.
//!
//! The paging core only consumes one piece of interrupt state: the error code
//! the processor pushes on a page fault.

bitflags::bitflags! {
    /// Error code of the page fault exception.
    ///
    /// The layout follows the x86_64 `#PF` error code.
    pub struct PFErrorCode: u64 {
        /// Set when the fault was caused by a page-protection violation.
        /// Cleared when the fault was caused by a not-present page.
        const PRESENT = 1 << 0;
        /// Set when the faulting access was a write.
        const WRITE_ACCESS = 1 << 1;
        /// Set when the access originated in user mode.
        const USER = 1 << 2;
        /// Set when one or more page directory entries contain reserved bits.
        const MALFORMED_TABLE = 1 << 3;
        /// Set when the fault was caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

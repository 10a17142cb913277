//! Hardware page table.
//!
//! A [`PageTable`] translates the user virtual addresses of one address space
//! into physical addresses. Each translation is a page table entry ([`Pte`]) in
//! the x86_64 format: the physical frame number plus a set of [`PteFlags`].
//!
//! Like the real memory management unit, [`PageTable::translate`] sets the
//! accessed bit on every successful translation and the dirty bit on every
//! write. The paging core reads those bits to pick eviction victims and to
//! decide what must be written back.
use crate::addressing::{PAGE_MASK, Pa, Va};
use abyss::interrupt::PFErrorCode;
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page
        /// referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the
        /// 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed; indicates whether software has accessed the 4-KByte page
        /// referenced by this entry
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page
        /// referenced by this entry
        const D = 1 << 6;
        /// If the PAT is supported, indirectly determines the memory type used
        /// to access the 4-KByte page referenced by this entry
        const PAT = 1 << 7;
        /// Global; if CR4.PGE = 1, determines whether the translation is global
        const G = 1 << 8;
        /// If IA32_EFER.NXE = 1, execute-disable
        const XD = 1 << 63;
    }
}

/// Page Table Entry (PTE).
///
/// A page table entry holds the physical address of a page and various
/// control bits, such as flags indicating whether the page is present,
/// read/write, etc.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl Pte {
    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the page is present, containing the physical address.
    /// - `None` if the page is not present (i.e., the "P" flag is not set).
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PteFlags::all().bits() & !PAGE_MASK)
        } else {
            None
        }
    }

    /// Get the flags associated with this page table entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Set the physical address for this entry.
    ///
    /// # Returns
    /// - `Ok(&mut Self)` if the address is valid and the update is successful.
    /// - `Err(PageTableMappingError::Unaligned)` if the provided physical
    ///   address is not aligned.
    ///
    /// # Warning
    /// This operation does not modify the flags of the entry.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, PageTableMappingError> {
        let pa = pa.into_usize();
        if pa & PAGE_MASK != 0 {
            Err(PageTableMappingError::Unaligned)
        } else {
            self.0 = pa | self.flags().bits() | PteFlags::P.bits();
            Ok(self)
        }
    }

    /// Set the flags for this entry, keeping the physical address.
    #[inline]
    pub fn set_flags(&mut self, perm: PteFlags) -> &mut Self {
        self.0 = self.pa().map(|n| n.into_usize()).unwrap_or(0) | perm.bits();
        self
    }

    /// Clears the entry.
    ///
    /// # Returns
    /// - `Some(Pa)`: The physical address that was previously stored in the
    ///   entry, if it existed.
    /// - `None`: If the entry did not contain a valid physical address.
    #[inline]
    pub fn clear(&mut self) -> Option<Pa> {
        self.pa().inspect(|_| {
            self.0 = 0;
        })
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:?}, {:?})", self.pa(), self.flags())
    }
}

/// Page Table Mapping Error.
///
/// This enum represents errors that can occur when working with page table
/// mappings in the virtual memory system.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address provided for a page table entry
    /// is not properly aligned to the required page size.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not exist
    /// or is invalid.
    NotExist,

    /// Duplicated mapping.
    ///
    /// This error is returned when an attempt is made to create a duplicate
    /// mapping for an address that already has an existing mapping.
    Duplicated,

    /// Invalid permission.
    ///
    /// This error is returned when an attempt is made to create a mapping with
    /// an invalid permission.
    InvalidPermission,
}

impl From<PageTableMappingError> for crate::KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::NotExist => crate::KernelError::BadAddress,
            PageTableMappingError::Duplicated => crate::KernelError::FileExist,
            PageTableMappingError::Unaligned | PageTableMappingError::InvalidPermission => {
                crate::KernelError::InvalidArgument
            }
        }
    }
}

bitflags::bitflags! {
    /// Possible memory permissions for a page.
    ///
    /// The [`Permission`] allows you to specify memory access permissions such as:
    /// - Whether a page is readable.
    /// - Whether a page is writable.
    /// - Whether a page is executable.
    /// - Whether a page can be accessed by user applications.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXECUTABLE = 1 << 2;
        /// Page can be referred by user application.
        const USER = 1 << 3;
    }
}

impl Permission {
    /// Permission of an ordinary user data page.
    pub fn user(writable: bool) -> Self {
        if writable {
            Permission::READ | Permission::WRITE | Permission::USER
        } else {
            Permission::READ | Permission::USER
        }
    }
}

impl TryFrom<Permission> for PteFlags {
    type Error = PageTableMappingError;

    fn try_from(perm: Permission) -> Result<Self, Self::Error> {
        if !perm.contains(Permission::READ) {
            return Err(PageTableMappingError::InvalidPermission);
        }
        let mut flags = PteFlags::P;
        if perm.contains(Permission::WRITE) {
            flags |= PteFlags::RW;
        }
        if perm.contains(Permission::USER) {
            flags |= PteFlags::US;
        }
        if !perm.contains(Permission::EXECUTABLE) {
            flags |= PteFlags::XD;
        }
        Ok(flags)
    }
}

static NEXT_PAGE_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// The page table of one address space.
///
/// Only present entries are stored. Every page table carries a unique id,
/// which the paging core uses to name the address space.
pub struct PageTable {
    id: u64,
    entries: BTreeMap<Va, Pte>,
}

impl PageTable {
    /// Create an empty page table.
    pub fn new() -> Self {
        Self {
            id: NEXT_PAGE_TABLE_ID.fetch_add(1, Ordering::SeqCst),
            entries: BTreeMap::new(),
        }
    }

    /// The unique identifier of this page table.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Map a virtual address (`va`) to a physical address (`pa`) with the
    /// specified permissions (`perm`).
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(PageTableMappingError::Unaligned)` if either address is not
    ///   page aligned.
    /// - `Err(PageTableMappingError::Duplicated)` if `va` is already mapped.
    /// - `Err(PageTableMappingError::InvalidPermission)` if `perm` is not
    ///   readable.
    pub fn map(&mut self, va: Va, pa: Pa, perm: Permission) -> Result<(), PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        let flags = PteFlags::try_from(perm)?;
        if self.entries.contains_key(&va) {
            return Err(PageTableMappingError::Duplicated);
        }
        let mut pte = Pte(0);
        pte.set_pa(pa)?.set_flags(flags);
        self.entries.insert(va, pte);
        Ok(())
    }

    /// Unmap the given virtual address (`va`) and return the physical address
    /// that was mapped to it.
    pub fn unmap(&mut self, va: Va) -> Result<Pa, PageTableMappingError> {
        self.entries
            .remove(&va.page_down())
            .and_then(|mut pte| pte.clear())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Walk the page table to find the page table entry for `va`.
    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        self.entries
            .get(&va.page_down())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Walk the page table to find the mutable page table entry for `va`.
    pub fn walk_mut(&mut self, va: Va) -> Result<&mut Pte, PageTableMappingError> {
        self.entries
            .get_mut(&va.page_down())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Returns `true` if the page mapped at `va` has been written since its
    /// dirty bit was last cleared.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.walk(va)
            .map(|pte| pte.flags().contains(PteFlags::D))
            .unwrap_or(false)
    }

    /// Returns `true` if the page mapped at `va` has been accessed since its
    /// accessed bit was last cleared.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.walk(va)
            .map(|pte| pte.flags().contains(PteFlags::A))
            .unwrap_or(false)
    }

    /// Set or clear the accessed bit of the page mapped at `va`.
    pub fn set_accessed(&mut self, va: Va, accessed: bool) {
        if let Ok(pte) = self.walk_mut(va) {
            let mut flags = pte.flags();
            flags.set(PteFlags::A, accessed);
            pte.set_flags(flags);
        }
    }

    /// Set or clear the dirty bit of the page mapped at `va`.
    pub fn set_dirty(&mut self, va: Va, dirty: bool) {
        if let Ok(pte) = self.walk_mut(va) {
            let mut flags = pte.flags();
            flags.set(PteFlags::D, dirty);
            pte.set_flags(flags);
        }
    }

    /// Translate `va` the way the memory management unit does.
    ///
    /// A successful translation sets the accessed bit, and the dirty bit as
    /// well when `is_write` is set.
    ///
    /// # Returns
    /// - `Ok(Pa)`: the physical address `va` translates to.
    /// - `Err(PFErrorCode)`: the error code of the page fault the access
    ///   raises.
    pub fn translate(&mut self, va: Va, is_write: bool, is_user: bool) -> Result<Pa, PFErrorCode> {
        let mut ec = PFErrorCode::empty();
        ec.set(PFErrorCode::WRITE_ACCESS, is_write);
        ec.set(PFErrorCode::USER, is_user);
        let Some(pte) = self.entries.get_mut(&va.page_down()) else {
            return Err(ec);
        };
        let (pa, mut flags) = match pte.pa() {
            Some(pa) => (pa, pte.flags()),
            None => return Err(ec),
        };
        if (is_write && !flags.contains(PteFlags::RW)) || (is_user && !flags.contains(PteFlags::US))
        {
            return Err(ec | PFErrorCode::PRESENT);
        }
        flags |= PteFlags::A;
        if is_write {
            flags |= PteFlags::D;
        }
        pte.set_flags(flags);
        Ok(pa + va.offset())
    }

    /// Iterate over every mapping of this page table in address order.
    pub fn iter(&self) -> impl Iterator<Item = (Va, Pte)> + '_ {
        self.entries.iter().map(|(va, pte)| (*va, *pte))
    }

    /// The number of mapped pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(v: usize) -> Va {
        Va::new(v).unwrap()
    }

    fn pa(v: usize) -> Pa {
        Pa::new(v).unwrap()
    }

    #[test]
    fn map_walk_unmap() {
        let mut pt = PageTable::new();
        assert_eq!(
            pt.map(va(0x1000), pa(0x20_0000), Permission::user(true)),
            Ok(())
        );
        assert_eq!(
            pt.map(va(0x1000), pa(0x20_1000), Permission::user(true)),
            Err(PageTableMappingError::Duplicated)
        );
        assert_eq!(
            pt.map(va(0x1008), pa(0x20_1000), Permission::user(true)),
            Err(PageTableMappingError::Unaligned)
        );
        assert_eq!(
            pt.map(va(0x2000), pa(0x20_1000), Permission::WRITE),
            Err(PageTableMappingError::InvalidPermission)
        );
        let pte = pt.walk(va(0x1234)).unwrap();
        assert_eq!(pte.pa(), Some(pa(0x20_0000)));
        assert!(pte.flags().contains(PteFlags::P | PteFlags::RW | PteFlags::US));
        assert_eq!(pt.unmap(va(0x1000)), Ok(pa(0x20_0000)));
        assert_eq!(pt.walk(va(0x1000)).err(), Some(PageTableMappingError::NotExist));
    }

    #[test]
    fn translate_sets_accessed_and_dirty() {
        let mut pt = PageTable::new();
        pt.map(va(0x4000), pa(0x30_0000), Permission::user(false))
            .unwrap();
        assert!(!pt.is_accessed(va(0x4000)));
        assert_eq!(pt.translate(va(0x4010), false, true), Ok(pa(0x30_0010)));
        assert!(pt.is_accessed(va(0x4000)));
        assert!(!pt.is_dirty(va(0x4000)));

        let ec = pt.translate(va(0x4010), true, true).unwrap_err();
        assert!(ec.contains(PFErrorCode::PRESENT | PFErrorCode::WRITE_ACCESS));
        assert!(!pt.is_dirty(va(0x4000)), "A faulting write must not dirty.");

        let ec = pt.translate(va(0x8000), false, true).unwrap_err();
        assert!(!ec.contains(PFErrorCode::PRESENT));

        pt.set_accessed(va(0x4000), false);
        assert!(!pt.is_accessed(va(0x4000)));
    }
}

//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for virtual address and physical
//! address: [`Va`] for (user) virtual address and [`Pa`] for physical
//! address. Both support the usual address arithmetic so that page rounding
//! and offset calculation read naturally.
//!
//! ## Example Usage:
//!
//! ```
//! let pa = Pa::new(0x1234_0000).unwrap();
//! let next_pa = pa + PAGE_SIZE;
//! ```

/// The size of a single page in memory, in bytes.
///
/// Every frame, every virtual page and every swap slot covers exactly this
/// many bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// The first address that belongs to the kernel half of the address space.
///
/// User virtual addresses are strictly below this boundary.
pub const KERNEL_BASE: usize = 0x0000_8000_0000_0000;

/// Represents a physical address.
///
/// The [`Pa`] is a wrapper around `usize` that names a location in the
/// physical address space, i.e. an offset into the emulated RAM.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// The address must be less than `0xffff_0000_0000_0000`.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the physical address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up to the physical address to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// A [`Va`] must be canonical: the upper 17 bits are either all zero (user
/// half) or all one (kernel half). Only the user half can ever be mapped by a
/// process page table; see [`Va::is_user`].
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Example
    /// ```
    /// assert!(Va::new(0x4747_0000).is_some());
    /// assert!(Va::new(0xFFFF_7000_1234_5678).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if the address lies on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Returns `true` if the address belongs to the user half of the address
    /// space.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < KERNEL_BASE
    }

    /// Adds `rhs` bytes, returning `None` on overflow or when the result is
    /// not canonical.
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Self::new(v),
            None => None,
        }
    }

    /// Subtracts `rhs` bytes, returning `None` on underflow.
    #[inline]
    pub const fn checked_sub(self, rhs: usize) -> Option<Self> {
        match self.0.checked_sub(rhs) {
            Some(v) => Self::new(v),
            None => None,
        }
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

macro_rules! impl_fmt {
    ($t: ident) => {
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
    };
}

impl_fmt!(Va);
impl_fmt!(Pa);

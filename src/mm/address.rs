//! User Virtual Address Type
//!
//! Type-safe wrapper for addresses handed to the kernel by user code.
//! User code runs in a 32-bit address space; everything at or above
//! `PHYS_BASE` belongs to the kernel.
//!
//! # Security Properties
//! - A `UserAddr` is just a number; it cannot be dereferenced
//! - Arithmetic is checked so wrap-around never aliases kernel space

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: u32 = PAGE_SIZE as u32 - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: u32 = 12;

/// Base of kernel virtual memory. User addresses are strictly below it.
pub const PHYS_BASE: u32 = 0xC000_0000;

/// Size of a machine word in the user ABI.
pub const WORD_SIZE: u32 = 4;

/// A user virtual address.
///
/// Constructing one performs no validation; the validation layer decides
/// whether the kernel may touch it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct UserAddr(u32);

impl UserAddr {
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this address lies below the kernel split.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < PHYS_BASE
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Virtual page number.
    #[inline]
    pub const fn page_number(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    /// Offset inside the page (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & PAGE_MASK) as usize
    }

    /// Add an offset, returning `None` on 32-bit overflow.
    #[inline]
    pub const fn checked_add(self, offset: u32) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Subtract an offset, returning `None` below zero.
    #[inline]
    pub const fn checked_sub(self, offset: u32) -> Option<Self> {
        match self.0.checked_sub(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Address of the `index`th word above this one.
    #[inline]
    pub const fn word(self, index: u32) -> Option<Self> {
        match index.checked_mul(WORD_SIZE) {
            Some(offset) => self.checked_add(offset),
            None => None,
        }
    }
}

impl fmt::Debug for UserAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserAddr({:#010x})", self.0)
    }
}

impl fmt::Display for UserAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

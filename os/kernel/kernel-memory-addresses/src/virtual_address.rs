use crate::{ENTRIES_PER_TABLE, FRAME_SIZE, align_down, align_up};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// The four levels of the page-table radix tree, outermost first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    /// PML4.
    Root,
    /// PDPT.
    Upper,
    /// Page directory.
    Middle,
    /// Page table; its entries map 4 KiB frames.
    Leaf,
}

impl TableLevel {
    /// Bit position of this level's 9-bit index inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Root => 39,
            Self::Upper => 30,
            Self::Middle => 21,
            Self::Leaf => 12,
        }
    }

    /// Bytes of address space covered by a single entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The level below this one, or `None` for [`TableLevel::Leaf`].
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Root => Some(Self::Upper),
            Self::Upper => Some(Self::Middle),
            Self::Middle => Some(Self::Leaf),
            Self::Leaf => None,
        }
    }
}

/// Canonical 48-bit virtual address.
///
/// Bits 63..48 always replicate bit 47; [`VirtualAddress::new`] enforces this
/// in debug builds and [`VirtualAddress::canonical`] sign-extends raw values.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    /// First address of the upper canonical half.
    pub const HIGHER_HALF: Self = Self(0xFFFF_8000_0000_0000);

    /// One past the last address of the lower canonical half.
    pub const LOWER_HALF_END: u64 = 0x0000_8000_0000_0000;

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        debug_assert!(Self::is_canonical_raw(v), "non-canonical virtual address");
        Self(v)
    }

    /// Sign-extend bit 47 of `v`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub const fn canonical(v: u64) -> Self {
        Self((((v << 16) as i64) >> 16) as u64)
    }

    /// Compose an address from the four table indices (each `0..512`).
    #[inline]
    #[must_use]
    pub const fn from_indices(root: usize, upper: usize, middle: usize, leaf: usize) -> Self {
        debug_assert!(root < ENTRIES_PER_TABLE && upper < ENTRIES_PER_TABLE);
        debug_assert!(middle < ENTRIES_PER_TABLE && leaf < ENTRIES_PER_TABLE);
        Self::canonical(
            ((root as u64) << 39) | ((upper as u64) << 30) | ((middle as u64) << 21) | ((leaf as u64) << 12),
        )
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn is_canonical_raw(v: u64) -> bool {
        let top = v >> 47;
        top == 0 || top == 0x1_FFFF
    }

    #[inline]
    #[must_use]
    pub const fn is_higher_half(self) -> bool {
        self.0 >= Self::HIGHER_HALF.0
    }

    /// The 9-bit index selecting the entry at `level`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_index(self, level: TableLevel) -> usize {
        ((self.0 >> level.shift()) & 0x1FF) as usize
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (FRAME_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self) -> Self {
        Self(align_down(self.0, FRAME_SIZE))
    }

    #[inline]
    #[must_use]
    pub const fn align_up(self) -> Self {
        Self::canonical(align_up(self.0, FRAME_SIZE))
    }

    /// Address `bytes` further up, crossing the canonical hole if needed.
    #[inline]
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self::canonical(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self::new(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl Sub<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Self::new(self.0 - rhs)
    }
}

impl Sub<Self> for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_roundtrip() {
        let va = VirtualAddress::from_indices(384, 7, 300, 12);
        assert!(va.is_higher_half());
        assert_eq!(va.table_index(TableLevel::Root), 384);
        assert_eq!(va.table_index(TableLevel::Upper), 7);
        assert_eq!(va.table_index(TableLevel::Middle), 300);
        assert_eq!(va.table_index(TableLevel::Leaf), 12);
        assert_eq!(va.page_offset(), 0);
    }

    #[test]
    fn lower_half_is_not_sign_extended() {
        let va = VirtualAddress::from_indices(1, 0, 0, 0);
        assert_eq!(va.as_u64(), 0x0000_0080_0000_0000);
        assert!(!va.is_higher_half());
    }

    #[test]
    fn offset_crosses_canonical_hole() {
        let last_low = VirtualAddress::new(VirtualAddress::LOWER_HALF_END - FRAME_SIZE);
        assert_eq!(last_low.offset(FRAME_SIZE), VirtualAddress::HIGHER_HALF);
    }

    #[test]
    fn level_spans() {
        assert_eq!(TableLevel::Leaf.entry_span(), 4096);
        assert_eq!(TableLevel::Middle.entry_span(), 2 * 1024 * 1024);
        assert_eq!(TableLevel::Root.next(), Some(TableLevel::Upper));
        assert_eq!(TableLevel::Leaf.next(), None);
    }
}

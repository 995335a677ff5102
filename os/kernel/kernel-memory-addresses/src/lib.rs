//! # Physical and Virtual Address Types
//!
//! Strongly typed wrappers for the raw 64-bit addresses handled by the frame
//! allocator, the paging engine and the process manager.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A location in physical memory (RAM or MMIO). |
//! | [`PhysicalFrame`] | A 4 KiB physical frame, identified by its frame number. |
//! | [`VirtualAddress`] | A canonical, page-table translated address. |
//!
//! All paging in this kernel happens at 4 KiB granularity, so there is a single
//! frame size ([`FRAME_SIZE`]) rather than a family of page-size markers.
//!
//! ## Table Indices
//!
//! A 48-bit canonical virtual address decomposes into four 9-bit table
//! indices and a 12-bit offset:
//!
//! ```text
//! | 63..48 | 47..39 | 38..30 | 29..21 | 20..12 | 11..0  |
//! | sign   |  root  | upper  | middle |  leaf  | offset |
//! ```
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::from_indices(511, 510, 0, 3);
//! assert_eq!(va.as_u64(), 0xFFFF_FFFF_8000_3000);
//! assert_eq!(va.table_index(TableLevel::Root), 511);
//! assert_eq!(va.table_index(TableLevel::Leaf), 3);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_frame;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use physical_frame::PhysicalFrame;
pub use virtual_address::{TableLevel, VirtualAddress};

/// Size of a physical frame and of a virtual page, in bytes.
pub const FRAME_SIZE: u64 = 4096;

/// log2 of [`FRAME_SIZE`].
pub const FRAME_SHIFT: u32 = 12;

/// Number of entries in every page table level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Align `x` down to `a` (which must be a power of two).
///
/// ```
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to `a` (which must be a power of two).
///
/// ```
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1234, 0x1000), 0x2000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Number of 4 KiB frames needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn frames_for(bytes: u64) -> u64 {
    align_up(bytes, FRAME_SIZE) >> FRAME_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_counts_round_up() {
        assert_eq!(frames_for(0), 0);
        assert_eq!(frames_for(1), 1);
        assert_eq!(frames_for(FRAME_SIZE), 1);
        assert_eq!(frames_for(FRAME_SIZE + 1), 2);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x10_0001, 0x10_0000), 0x20_0000);
    }
}

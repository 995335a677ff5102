//! # Page Table Entries
//!
//! All four levels share one entry layout. Huge pages are never created
//! here, so a present entry either points to the next-level table or, at
//! [`TableLevel::Leaf`](kernel_memory_addresses::TableLevel::Leaf), maps one
//! 4 KiB frame.
//!
//! | Bits   | Field | Meaning |
//! |--------|-------|---------|
//! | 0      | `P`   | Present |
//! | 1      | `RW`  | Writable |
//! | 2      | `US`  | User accessible |
//! | 3      | `PWT` | Write-through |
//! | 4      | `PCD` | Cache disable |
//! | 5      | `A`   | Accessed |
//! | 6      | `D`   | Dirty (leaf only) |
//! | 7      | `PS`  | Huge page (never set by this crate) |
//! | 8      | `G`   | Global (leaf only) |
//! | 9–11   | OS    | Available to software |
//! | 12–51  | addr  | Physical frame number |
//! | 63     | `NX`  | Execute disable |

use bitfield_struct::bitfield;
use core::ops::{Index, IndexMut};
use kernel_memory_addresses::{ENTRIES_PER_TABLE, FRAME_SHIFT, PhysicalAddress};

/// Read/write permission of a leaf mapping.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageAccess {
    ReadOnly,
    ReadWrite,
}

/// Privilege level a mapping is reachable from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Privilege {
    /// Ring 0 only.
    Kernel,
    /// Ring 3 as well.
    User,
}

/// One 64-bit entry of any paging level.
///
/// An entry is either all zero (absent) or present with a non-zero frame.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Present (bit 0).
    pub present: bool,

    /// Writable (bit 1). Intermediate entries are always writable; the leaf
    /// decides.
    pub writable: bool,

    /// User accessible (bit 2). Must be set on every level of a user walk.
    pub user: bool,

    /// Write-through caching (bit 3).
    pub write_through: bool,

    /// Caching disabled (bit 4).
    pub cache_disable: bool,

    /// Set by the CPU on first access.
    pub accessed: bool,

    /// Set by the CPU on first write to a leaf.
    pub dirty: bool,

    /// Page size bit (bit 7).
    pub huge: bool,

    /// Global translation (bit 8).
    pub global: bool,

    /// Software bits 9..=11.
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number (bits 12..=51).
    #[bits(40)]
    frame_number: u64,

    #[bits(11)]
    _rsvd: u16,

    /// Execute disable (bit 63).
    pub no_execute: bool,
}

impl PageTableEntry {
    /// A present leaf mapping of `frame`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, access: PageAccess, privilege: Privilege) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(matches!(access, PageAccess::ReadWrite))
            .with_user(matches!(privilege, Privilege::User))
            .with_address(frame)
    }

    /// A present link to the next-level table in `frame`.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalAddress, privilege: Privilege) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(matches!(privilege, Privilege::User))
            .with_address(frame)
    }

    /// Frame the entry points to.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_number() << FRAME_SHIFT)
    }

    /// Replace the frame, keeping all flags.
    #[inline]
    #[must_use]
    pub const fn with_address(self, frame: PhysicalAddress) -> Self {
        debug_assert!(frame.is_frame_aligned());
        self.with_frame_number(frame.as_u64() >> FRAME_SHIFT)
    }

    /// Whether the entry is all zero.
    #[inline]
    #[must_use]
    pub const fn is_absent(self) -> bool {
        self.into_bits() == 0
    }

    /// Set (`on`) or clear every bit that is set in `flags`.
    #[inline]
    #[must_use]
    pub const fn with_flags(self, flags: PageFlags, on: bool) -> Self {
        let mask = flags.entry_mask();
        if on {
            Self::from_bits(self.into_bits() | mask)
        } else {
            Self::from_bits(self.into_bits() & !mask)
        }
    }
}

/// Flags that can be set or cleared on an existing range with
/// [`PagingEngine::set_flags`](crate::PagingEngine::set_flags).
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PageFlags {
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub global: bool,
    pub no_execute: bool,
    #[bits(2)]
    _rsvd: u8,
}

impl PageFlags {
    /// The same flags at their [`PageTableEntry`] bit positions.
    #[must_use]
    pub const fn entry_mask(self) -> u64 {
        PageTableEntry::new()
            .with_writable(self.writable())
            .with_user(self.user())
            .with_write_through(self.write_through())
            .with_cache_disable(self.cache_disable())
            .with_global(self.global())
            .with_no_execute(self.no_execute())
            .into_bits()
    }
}

/// One table of any level: 512 entries in a 4 KiB-aligned frame.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::new(); ENTRIES_PER_TABLE],
        }
    }

    /// Clear all entries.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

const _: () = assert!(size_of::<PageTable>() == 4096);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_encodes_flags_and_frame() {
        let e = PageTableEntry::leaf(
            PhysicalAddress::new(0x1234_5000),
            PageAccess::ReadWrite,
            Privilege::User,
        );
        assert_eq!(e.into_bits(), 0x1234_5007);
        assert_eq!(e.address(), PhysicalAddress::new(0x1234_5000));
        assert!(!e.is_absent());
    }

    #[test]
    fn read_only_kernel_leaf() {
        let e = PageTableEntry::leaf(
            PhysicalAddress::new(0x2000),
            PageAccess::ReadOnly,
            Privilege::Kernel,
        );
        assert_eq!(e.into_bits(), 0x2001);
    }

    #[test]
    fn flags_toggle_without_touching_address() {
        let e = PageTableEntry::table(PhysicalAddress::new(0x7000), Privilege::Kernel);
        let flags = PageFlags::new().with_user(true).with_no_execute(true);
        let on = e.with_flags(flags, true);
        assert!(on.user() && on.no_execute());
        assert_eq!(on.address(), e.address());
        assert_eq!(on.with_flags(flags, false), e);
    }

    #[test]
    fn empty_table() {
        let mut t = PageTable::new();
        assert!(t.is_empty());
        t[3] = PageTableEntry::table(PhysicalAddress::new(0x1000), Privilege::Kernel);
        assert_eq!(t.present_count(), 1);
        t.zero();
        assert!(t.is_empty());
    }
}

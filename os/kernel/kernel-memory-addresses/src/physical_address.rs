use crate::{FRAME_SIZE, PhysicalFrame, align_down};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Physical memory address.
///
/// Page-table entries and the frame bitmap only ever deal in physical
/// addresses; keeping them apart from [`VirtualAddress`](crate::VirtualAddress)
/// prevents accidental VA/PA mix-ups.
///
/// Address `0` doubles as the "no frame" value of the original allocator
/// interface and is never handed out as an allocatable frame.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Whether the address sits on a 4 KiB frame boundary.
    #[inline]
    #[must_use]
    pub const fn is_frame_aligned(self) -> bool {
        self.0 & (FRAME_SIZE - 1) == 0
    }

    /// Offset of the address inside its frame.
    #[inline]
    #[must_use]
    pub const fn frame_offset(self) -> u64 {
        self.0 & (FRAME_SIZE - 1)
    }

    /// The frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalFrame {
        PhysicalFrame::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self) -> Self {
        Self(align_down(self.0, FRAME_SIZE))
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalFrame> for PhysicalAddress {
    #[inline]
    fn from(frame: PhysicalFrame) -> Self {
        frame.start_address()
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<Self> for PhysicalAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

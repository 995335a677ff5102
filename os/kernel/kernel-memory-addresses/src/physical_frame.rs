use crate::{FRAME_SHIFT, PhysicalAddress};
use core::fmt;

/// A 4 KiB physical frame, identified by its frame number.
///
/// The frame number is also the bit index of the frame in the physical
/// frame bitmap.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(u64);

impl PhysicalFrame {
    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self(number)
    }

    /// The frame that contains `addr`.
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_u64() >> FRAME_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn start_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << FRAME_SHIFT)
    }

    /// The frame `n` frames after this one.
    #[inline]
    #[must_use]
    pub const fn offset(self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame#{}({:?})", self.0, self.start_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_number_is_address_shifted() {
        let frame = PhysicalAddress::new(0x5123).frame();
        assert_eq!(frame.number(), 5);
        assert_eq!(frame.start_address(), PhysicalAddress::new(0x5000));
        assert_eq!(frame.offset(2).start_address().as_u64(), 0x7000);
    }
}

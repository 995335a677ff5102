//! Statically reserved bitmap storage for the first boot phase, before the
//! kernel heap exists.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// `WORDS` bitmap words in the kernel image, handed out once.
pub struct BootstrapArena<const WORDS: usize> {
    words: UnsafeCell<[u64; WORDS]>,
    taken: AtomicBool,
}

// Safety: the storage is only reachable through the single `take`.
unsafe impl<const WORDS: usize> Sync for BootstrapArena<WORDS> {}

impl<const WORDS: usize> BootstrapArena<WORDS> {
    /// Frames the arena can describe.
    pub const FRAMES: u64 = WORDS as u64 * u64::BITS as u64;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: UnsafeCell::new([0; WORDS]),
            taken: AtomicBool::new(false),
        }
    }

    /// The storage, the first time only.
    pub fn take(&'static self) -> Option<&'static mut [u64]> {
        if self.taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        // Safety: `taken` guarantees a single mutable borrow.
        Some(unsafe { &mut *self.words.get() })
    }
}

impl<const WORDS: usize> Default for BootstrapArena<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_is_handed_out_once() {
        static ARENA: BootstrapArena<4> = BootstrapArena::new();
        assert_eq!(BootstrapArena::<4>::FRAMES, 256);
        let words = ARENA.take().unwrap();
        assert_eq!(words.len(), 4);
        assert!(ARENA.take().is_none());
    }
}

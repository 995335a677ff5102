use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

/// Storage in a `static` that is written exactly once at runtime, for boot
/// state that must outlive the boot function but cannot be built in a
/// `const` context.
pub struct StaticCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: the value is written once before `state` becomes READY and only
// shared afterwards.
unsafe impl<T: Send + Sync> Sync for StaticCell<T> {}

impl<T> StaticCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Store `value` and return a reference to it. Hands `value` back if the
    /// cell was already filled.
    ///
    /// # Errors
    /// The cell is not empty.
    pub fn put(&'static self, value: T) -> Result<&'static T, T> {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        // Safety: WRITING excludes every other writer and all readers.
        let stored = unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        Ok(stored)
    }

    #[must_use]
    pub fn get(&'static self) -> Option<&'static T> {
        if self.state.load(Ordering::Acquire) != READY {
            return None;
        }
        // Safety: READY is only stored after the value was written.
        Some(unsafe { (*self.value.get()).assume_init_ref() })
    }
}

impl<T> Default for StaticCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

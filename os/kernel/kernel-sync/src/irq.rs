//! Interrupt masking.
//!
//! On bare metal this is `cli`/`sti` and the `IF` bit of `RFLAGS`. Hosted
//! builds keep a software flag instead so the scheduling code can be
//! exercised in unit tests.

/// RAII guard that disables interrupts on creation and restores the
/// previous state on drop.
///
/// Guards nest: only the outermost one re-enables interrupts.
///
/// ```
/// use kernel_sync::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _g = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    const RFLAGS_IF: u64 = 1 << 9;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r & RFLAGS_IF != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    use core::sync::atomic::{AtomicBool, Ordering};

    static SOFT_IF: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn interrupts_enabled() -> bool {
        SOFT_IF.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn disable() {
        SOFT_IF.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn enable() {
        SOFT_IF.store(true, Ordering::SeqCst);
    }
}

pub use imp::{disable, enable, interrupts_enabled};

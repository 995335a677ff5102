//! # QEMU Debug Console Logging
//!
//! A `log` backend for the kernel. Records are rendered as
//! `[LEVEL] target: message` and written byte by byte to QEMU's debug port
//! (`0x402`, enable with `-debugcon stdio`).
//!
//! The port sink only exists on bare-metal `x86_64` with the `enabled`
//! feature; everywhere else [`qemu_trace!`] compiles to nothing, which keeps
//! hosted unit tests of the memory manager quiet.
//!
//! ```rust,no_run
//! use log::{LevelFilter, info};
//!
//! kernel_qemu::init(LevelFilter::Debug).expect("logger already set");
//! info!("frame allocator online");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, init, write_record};

#[cfg(all(feature = "enabled", target_arch = "x86_64", target_os = "none"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    const QEMU_DEBUG_PORT: u16 = 0x402;

    #[inline]
    fn dbg_putc(c: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; there is nowhere to report a failed debug write.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(all(feature = "enabled", target_arch = "x86_64", target_os = "none")))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// Write `format!`-style output straight to the debug port.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}

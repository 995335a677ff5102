//! # Kernel synchronization primitives
//!
//! The kernel runs on a single CPU; the only source of concurrency is the
//! timer interrupt. [`SpinLock`] guards state shared between the allocator
//! paths, [`IrqGuard`] masks interrupts around schedule-point bookkeeping and
//! [`StaticCell`] holds boot state that has to live in a `static`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod static_cell;

pub use irq::{IrqGuard, interrupts_enabled};
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
pub use static_cell::StaticCell;

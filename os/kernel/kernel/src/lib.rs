//! # Kernel
//!
//! Ties the memory manager and the scheduler together: the two-phase boot
//! that moves the frame bitmap from the bootstrap arena onto the heap, the
//! [`Kernel`] context the interrupt and system-call handlers go through, the
//! CPU glue that loads `CR3` and `TSS.rsp0`, and the panic report.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod boot;
mod context;
pub mod cpu;
pub mod panic;
pub mod tss;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod machine;

pub use crate::context::{FaultOutcome, Kernel, Wait};

use kernel_proc::{ProcessError, SchedulerError};

/// Errors of the system-call level entry points.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("no process is running")]
    NoCurrentProcess,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

//! # Processes and Scheduling
//!
//! Builds, clones, and tears down process address spaces and runs the
//! processes round-robin.
//!
//! ```text
//!             Scheduler
//!   running: [ P3 ][ P1 ][ P4 ]     zombies: [ P2 ]
//!               │
//!               ▼ dispatch
//!        ProcessManager ──► PagingEngine ──► TemporaryWindow
//!               │                 │
//!               └──── FrameAlloc ◄┘
//! ```
//!
//! Every frame a process owns is recorded in one of its segment lists
//! ([`ClaimKind`]) so that [`ProcessManager::destroy`] can hand all of them
//! back together with the page tables.
//!
//! A new process is laid out as follows:
//!
//! ```text
//! 0x40_0000            image (flat binary or PT_LOAD segments)
//! image end            argv block, read-only
//! 1 MiB aligned        heap, grows up to 1 GiB with sbrk
//! ...                  anonymous mappings
//! USER_STACK_TOP       user stack, grows down on faults
//! ─── canonical hole ───
//! KERNEL_HEAP_START    per-process kernel stack just below
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod args;
pub mod cpu;
pub mod exec;
pub mod fd;
mod manager;
mod process;
mod scheduler;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use crate::cpu::{Cpu, CpuState, FpuState, GeneralRegisters, InterruptStack};
pub use crate::exec::{
    ExecError, ExecutableKind, ExecutableSource, FsExecutables, ImageSource, ProcessDescriptor, ReadFile,
};
pub use crate::fd::{FdTable, FileHandle};
pub use crate::manager::{Placement, ProcessManager};
pub use crate::process::{ClaimKind, Pid, Process, ProcessLayout, ProcessState, SegmentClaim};
pub use crate::scheduler::{Dispatch, Scheduler, SchedulerError, TickCallback, TickOutcome, TimerError, TimerSource};

use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{MapError, WindowError};

/// Errors of process construction and address-space changes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ProcessError {
    #[error("out of physical frames")]
    OutOfFrames,
    #[error(transparent)]
    Map(MapError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("invalid executable: {0}")]
    Exec(#[from] ExecError),
    #[error("executable not found")]
    ExecutableNotFound,
    #[error("{0:?} is already mapped")]
    MappingCollision(VirtualAddress),
    #[error("process heap limit reached")]
    HeapExhausted,
    #[error("fault at {0:?} is outside the stack growth limit")]
    StackLimit(VirtualAddress),
    #[error("no free file descriptor")]
    TooManyFiles,
    #[error("no free virtual range of the requested size")]
    AddressSpaceExhausted,
    #[error("process resources have already been released")]
    Released,
}

impl From<MapError> for ProcessError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfFrames => Self::OutOfFrames,
            MapError::AlreadyMapped(virt) => Self::MappingCollision(virt),
            MapError::Window(e) => Self::Window(e),
            other => Self::Map(other),
        }
    }
}

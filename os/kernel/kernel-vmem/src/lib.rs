//! # Virtual Memory
//!
//! Four-level x86-64 paging for the kernel and its processes.
//!
//! ## What you get
//! - [`PageTableEntry`] and [`PageTable`]: the in-memory layout shared by all
//!   four levels.
//! - [`TemporaryWindow`]: a reserved leaf table through which any physical
//!   frame can be read or written for a short time, handed out as RAII
//!   [`TemporaryMapping`] guards.
//! - [`PagingEngine`]: map, unmap, translate, search, tear down and share
//!   address spaces.
//! - [`FrameAlloc`]: where the engine gets frames for page tables.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  Root | Upper | Middle|  Leaf | Offset |
//! ```
//!
//! ```text
//!  Root  →  Upper  →  Middle  →  Leaf  →  4 KiB frame
//!  (PML4)   (PDPT)    (PD)       (PT)
//! ```
//!
//! Each table is one 4 KiB frame with 512 eight-byte entries. Tables below the
//! root are allocated when the first mapping in their span appears and freed
//! when the last one goes away.
//!
//! ## Testing
//!
//! With the `test-support` feature (and in this crate's own tests) the
//! [`testing`] module provides simulated physical memory and a
//! ready-made kernel tree, so every operation runs on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "test-support"))]
extern crate alloc;

mod entry;
mod paging;
pub mod window;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use crate::entry::{PageAccess, PageFlags, PageTable, PageTableEntry, Privilege};
pub use crate::paging::{FreeRange, MapError, PagingEngine};
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use crate::window::MmuWindow;
pub use crate::window::{TemporaryMapping, TemporaryWindow, WindowBackend, WindowError};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::PhysicalAddress;

/// Source of 4 KiB physical frames.
///
/// Methods take `&self`: implementations lock internally, so the paging
/// engine, the heap and the process manager can draw from the same pool.
pub trait FrameAlloc {
    /// One frame, or `None` when memory is exhausted.
    fn request_frame(&self) -> Option<PhysicalAddress>;

    /// `count` physically contiguous frames.
    fn request_frames(&self, count: u64) -> Option<PhysicalAddress>;

    /// Return a frame obtained from this allocator.
    fn free_frame(&self, frame: PhysicalAddress);

    /// Return `count` contiguous frames starting at `base`.
    fn free_frames(&self, base: PhysicalAddress, count: u64) {
        for i in 0..count {
            self.free_frame(base + i * kernel_memory_addresses::FRAME_SIZE);
        }
    }
}

impl<T: FrameAlloc + ?Sized> FrameAlloc for &T {
    fn request_frame(&self) -> Option<PhysicalAddress> {
        (**self).request_frame()
    }

    fn request_frames(&self, count: u64) -> Option<PhysicalAddress> {
        (**self).request_frames(count)
    }

    fn free_frame(&self, frame: PhysicalAddress) {
        (**self).free_frame(frame);
    }

    fn free_frames(&self, base: PhysicalAddress, count: u64) {
        (**self).free_frames(base, count);
    }
}

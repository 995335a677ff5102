//! # Kernel Memory Allocation
//!
//! Physical frames and the kernel heap.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Kernel Heap (LockedHeap)            │
//! │    • segment list, first fit, coalescing            │
//! │    • aligned allocations with padding segments      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ HeapGrowth (KernelHeapGrowth)
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Paging Engine (kernel-vmem)              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ FrameAlloc
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Frame Bitmap (FrameAllocator)             │
//! │    • one bit per 4 KiB frame                        │
//! │    • seeded in a BootstrapArena, relocated once     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The bitmap cannot live on the heap until the heap exists, and the heap
//! cannot grow without frames. Boot therefore seeds the bitmap in a static
//! [`BootstrapArena`], brings up the heap, then moves the bitmap into heap
//! memory sized for all of RAM with [`FrameAllocator::relocate`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod bootstrap;
pub mod frame_bitmap;
pub mod heap;

pub use crate::bootstrap::BootstrapArena;
pub use crate::frame_bitmap::{FrameAllocator, FrameBitmapAllocator, FrameError};
pub use crate::heap::{
    Heap, HeapError, HeapGrowth, HeapStats, KernelHeapGrowth, LockedHeap, SegmentHandle,
};

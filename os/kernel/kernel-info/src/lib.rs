//! # Kernel Configuration and Boot Interface
//!
//! This crate is the single source of truth for the kernel's memory layout,
//! its tunable runtime parameters and the boot loader hand-off contract.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants that place the kernel heap, the temporary mapping
//! window and the per-process regions (code, arguments, heap, user stack,
//! kernel stack) in the 48-bit virtual address space:
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │ (unmapped)                      │
//! USER_CODE_BASE        ├─────────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │ code · arguments · program heap │
//!                       │            ...                  │
//!                       │ user stack (grows down)         │
//! USER_STACK_TOP        ├─────────────────────────────────┤ 0x0000_7FFF_FFFF_F000
//!                       │ (non-canonical hole)            │
//!                       ├─────────────────────────────────┤ 0xFFFF_8000_0000_0000
//!                       │ per-process kernel stack        │
//! KERNEL_HEAP_START     ├─────────────────────────────────┤ 0xFFFF_C000_0000_0000
//!                       │ kernel heap (shared)            │
//! KERNEL_HEAP_CEILING   ├─────────────────────────────────┤ 0xFFFF_FFFF_7FFF_F000
//! TEMPORARY_WINDOW_BASE ├─────────────────────────────────┤ 0xFFFF_FFFF_8000_0000
//!                       │ temporary window · kernel image │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Everything at and above [`memory::KERNEL_HEAP_START`] is shared between all
//! address spaces and never freed by a process teardown.
//!
//! ### Runtime Configuration ([`config`])
//! [`config::KernelConfig`] carries the timer interval, the scheduling quantum
//! and the default stack sizes.
//!
//! ### Boot Information ([`boot`])
//! The data the boot loader hands over: the physical memory map, the
//! bootstrap frame bitmap, the active kernel root table and the loaded
//! executable modules.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod config;
pub mod memory;

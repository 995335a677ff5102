//! # Typed `X86_64` Registers
//!
//! [`Cr3`](cr3::Cr3) selects the active address space on dispatch and
//! [`Rflags`](rflags::Rflags) describes saved process flags and the interrupt
//! state snapshot in panic reports.
//!
//! The privileged accessors are only compiled with the `asm` feature on
//! `x86_64`; the bit layouts are usable everywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
pub mod rflags;

pub use cr3::Cr3;
pub use rflags::Rflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The register access might be privileged and require kernel mode (Ring 0).
    /// Storing may change the active address space or interrupt state.
    unsafe fn store_unsafe(self);
}

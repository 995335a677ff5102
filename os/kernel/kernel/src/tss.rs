//! # 64-bit Task State Segment
//!
//! Long mode does no hardware task switching, but the CPU still reads the
//! TSS to find the ring-0 stack (`rsp0`) when an interrupt arrives from user
//! mode. The scheduler points `rsp0` at the kernel stack of the process it
//! dispatches, so every process enters the kernel on its own stack.

use core::mem::size_of;
use kernel_memory_addresses::VirtualAddress;

/// The TSS as the CPU reads it. All reserved fields must stay zero.
#[repr(C, packed)]
pub struct Tss64 {
    _reserved0: u32,

    /// Ring-0 stack pointer loaded on a privilege change into the kernel.
    pub rsp0: VirtualAddress,
    pub rsp1: VirtualAddress,
    pub rsp2: VirtualAddress,

    _reserved1: u64,

    /// Interrupt Stack Table; index 1 backs the double-fault handler.
    pub ist: [VirtualAddress; 7],

    _reserved2: u64,
    _reserved3: u16,

    /// Offset of the I/O permission bitmap. Pointing past the end of the TSS
    /// denies all port I/O from user mode.
    pub iopb_offset: u16,
}

impl Tss64 {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: VirtualAddress::new(0),
            rsp1: VirtualAddress::new(0),
            rsp2: VirtualAddress::new(0),
            _reserved1: 0,
            ist: [VirtualAddress::new(0); 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }

    #[must_use]
    pub const fn rsp0(&self) -> VirtualAddress {
        self.rsp0
    }

    pub const fn set_rsp0(&mut self, top: VirtualAddress) {
        self.rsp0 = top;
    }
}

impl Default for Tss64 {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(size_of::<Tss64>() == 104, "TSS must be 104 bytes");

//! # Memory Layout

use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress};

/// Start of the shared kernel region. Process teardown never frees anything
/// mapped at or above this address.
pub const KERNEL_HEAP_START: VirtualAddress = VirtualAddress::from_indices(384, 0, 0, 0);

/// The kernel heap may grow until its end reaches this address.
pub const KERNEL_HEAP_CEILING: VirtualAddress = VirtualAddress::from_indices(511, 509, 511, 511);

/// Base of the reserved leaf table used for temporary mappings.
pub const TEMPORARY_WINDOW_BASE: VirtualAddress = VirtualAddress::from_indices(511, 510, 0, 0);

/// Window slot holding the kernel root table.
pub const TEMPORARY_WINDOW_KERNEL_ROOT_SLOT: usize = 0;

/// Window slot holding the window's own leaf table.
pub const TEMPORARY_WINDOW_SELF_SLOT: usize = 1;

/// First slot handed out for temporary mappings.
pub const TEMPORARY_WINDOW_FIRST_FREE_SLOT: usize = 2;

/// Where flat binaries are loaded.
pub const USER_CODE_BASE: VirtualAddress = VirtualAddress::new(0x0000_0000_0040_0000);

/// Alignment of the program break following the code and argument pages.
pub const PROCESS_HEAP_ALIGNMENT: u64 = 1024 * 1024;

/// Maximum size of a process' program heap.
pub const PROCESS_HEAP_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// One past the highest byte of the user stack. The topmost lower-half page
/// stays unmapped as a guard.
pub const USER_STACK_TOP: VirtualAddress =
    VirtualAddress::new(VirtualAddress::LOWER_HALF_END - FRAME_SIZE);

/// One past the highest byte of the per-process kernel stack.
pub const PROCESS_KERNEL_STACK_TOP: VirtualAddress = KERNEL_HEAP_START;

/// Upper bound for page-fault driven user stack growth.
pub const MAX_USER_STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Number of file descriptor slots per process.
pub const MAX_FILE_DESCRIPTORS: usize = 64;

/// `RFLAGS` a new process starts with: reserved bit 1 and `IF`.
pub const PROCESS_DEFAULT_RFLAGS: u64 = 0x202;

/// Ring-0 code segment selector.
pub const KERNEL_CODE_SELECTOR: u64 = 0x08;

/// Ring-0 data segment selector.
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;

/// Ring-3 data segment selector (GDT index 3, RPL 3).
pub const USER_DATA_SELECTOR: u64 = 0x1B;

/// Ring-3 code segment selector (GDT index 4, RPL 3).
pub const USER_CODE_SELECTOR: u64 = 0x23;

const _: () = {
    assert!(KERNEL_HEAP_START.as_u64() == 0xFFFF_C000_0000_0000);
    assert!(KERNEL_HEAP_CEILING.as_u64() < TEMPORARY_WINDOW_BASE.as_u64());
    assert!(TEMPORARY_WINDOW_FIRST_FREE_SLOT > TEMPORARY_WINDOW_SELF_SLOT);
    assert!(USER_CODE_BASE.as_u64().is_multiple_of(FRAME_SIZE));
    assert!(PROCESS_HEAP_ALIGNMENT.is_power_of_two());
    assert!(USER_CODE_SELECTOR & 3 == 3 && USER_DATA_SELECTOR & 3 == 3);
};

//! Two-phase bring-up of the frame allocator.
//!
//! The heap needs frames and the frame bitmap for all of memory needs the
//! heap. Phase one seeds the bitmap into a [`BootstrapArena`] inside the
//! kernel image; it may cover only the low part of memory. Once the heap is
//! up, phase two moves the bitmap into heap storage sized for the whole
//! memory map and releases the boot loader's bitmap frames.

use alloc::vec;
use kernel_alloc::{BootstrapArena, FrameAllocator, FrameBitmapAllocator, FrameError, HeapError};
use kernel_info::boot::BootInfo;
use kernel_info::config::ConfigError;
use log::{LevelFilter, info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("the kernel was already booted")]
    AlreadyBooted,
    #[error("the temporary window table is not mapped")]
    WindowTableMissing,
    #[error(transparent)]
    Frames(#[from] FrameError),
    #[error("kernel heap bring-up failed: {0}")]
    Heap(#[from] HeapError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Install the QEMU logger. A logger that is already installed stays.
pub fn init_logging(max_level: LevelFilter) {
    if kernel_qemu::init(max_level).is_err() {
        warn!("logger already installed");
    }
}

/// Phase one: seed `frames` from the boot loader's bitmap, using the arena
/// as storage.
///
/// # Errors
/// [`BootError::AlreadyBooted`] if the arena was already handed out.
pub fn seed_frames<const WORDS: usize>(
    frames: &FrameAllocator,
    arena: &'static BootstrapArena<WORDS>,
    info: &BootInfo<'_>,
) -> Result<(), BootError> {
    let storage = arena.take().ok_or(BootError::AlreadyBooted)?;
    let bitmap = FrameBitmapAllocator::from_boot(storage, info.bootstrap_bitmap, info.memory_map);
    frames.with(|slot| *slot = bitmap);
    Ok(())
}

/// Phase two: move the bitmap onto the heap, covering all usable memory.
/// The arena storage is not reused.
///
/// # Errors
/// [`BootError::Frames`] if the new storage is too small; the bitmap stays
/// in the arena then.
#[allow(clippy::cast_possible_truncation)]
pub fn relocate_frames(frames: &FrameAllocator, info: &BootInfo<'_>) -> Result<(), BootError> {
    let words = info.frame_count().div_ceil(u64::from(u64::BITS)) as usize;
    let storage = vec![0u64; words].leak();
    frames.relocate(storage, info.memory_map, info.bootstrap_bitmap_frames)?;
    info!(
        "frame bitmap relocated: {} KiB free of {} KiB",
        frames.free_bytes() / 1024,
        frames.with(|b| b.total_bytes()) / 1024
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegion;
    use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, VirtualAddress};

    fn info<'a>(map: &'a [MemoryRegion], bits: &'a [u8]) -> BootInfo<'a> {
        BootInfo {
            memory_map: map,
            bootstrap_bitmap: bits,
            bootstrap_bitmap_frames: Some((PhysicalAddress::new(60 * FRAME_SIZE), 2)),
            kernel_root: PhysicalAddress::new(FRAME_SIZE),
            window_table: PhysicalAddress::new(2 * FRAME_SIZE),
            window_table_virt: VirtualAddress::new(0xFFFF_FFFF_8000_1000),
            modules: &[],
        }
    }

    #[test]
    fn bitmap_moves_from_the_arena_to_the_heap() {
        static ARENA: BootstrapArena<1> = BootstrapArena::new();
        let map = [MemoryRegion::usable(0, 256 * FRAME_SIZE)];
        // Frames 0..5 hold the kernel tree, 60 and 61 the loader's bitmap.
        let bits = [0x1F, 0, 0, 0, 0, 0, 0, 0b0011_0000];
        let info = info(&map, &bits);
        let frames = FrameAllocator::new(FrameBitmapAllocator::empty());

        seed_frames(&frames, &ARENA, &info).unwrap();
        assert_eq!(frames.free_bytes(), (64 - 7) * FRAME_SIZE);
        assert!(frames.is_used(PhysicalAddress::new(100 * FRAME_SIZE)));

        relocate_frames(&frames, &info).unwrap();
        assert_eq!(frames.free_bytes(), (256 - 5) * FRAME_SIZE);
        assert!(!frames.is_used(PhysicalAddress::new(100 * FRAME_SIZE)));
        assert!(!frames.is_used(PhysicalAddress::new(60 * FRAME_SIZE)));
        assert!(frames.is_used(PhysicalAddress::new(4 * FRAME_SIZE)));

        assert_eq!(seed_frames(&frames, &ARENA, &info), Err(BootError::AlreadyBooted));
    }
}

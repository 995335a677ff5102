//! Host stand-ins for physical memory and a booted kernel tree.

use crate::entry::{PageAccess, PageTable, PageTableEntry, Privilege};
use crate::paging::PagingEngine;
use crate::window::{TemporaryWindow, WindowBackend};
use crate::FrameAlloc;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use kernel_info::memory::{
    TEMPORARY_WINDOW_BASE, TEMPORARY_WINDOW_FIRST_FREE_SLOT, TEMPORARY_WINDOW_KERNEL_ROOT_SLOT,
    TEMPORARY_WINDOW_SELF_SLOT,
};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, TableLevel};
use kernel_sync::SpinLock;

#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; FRAME_SIZE as usize]>);

// Safety: tests hand out disjoint frames through the window.
unsafe impl Sync for Frame {}
unsafe impl Send for Frame {}

/// Zero-initialised "physical memory": frame `n` lives at `n * 4096`.
#[derive(Clone)]
pub struct SimulatedRam {
    frames: Arc<[Frame]>,
}

impl SimulatedRam {
    #[must_use]
    pub fn new(frames: usize) -> Self {
        let frames: Vec<Frame> = (0..frames)
            .map(|_| Frame(UnsafeCell::new([0; FRAME_SIZE as usize])))
            .collect();
        Self { frames: frames.into() }
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frames.len() as u64
    }

    /// Host pointer to the byte at physical address `pa`.
    ///
    /// # Panics
    /// If `pa` is outside the simulated memory.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn pointer(&self, pa: PhysicalAddress) -> NonNull<u8> {
        let frame = &self.frames[(pa.as_u64() / FRAME_SIZE) as usize];
        unsafe { NonNull::new_unchecked(frame.0.get().cast::<u8>()).add(pa.frame_offset() as usize) }
    }

    /// Copy simulated memory into `buf`.
    pub fn read(&self, mut pa: PhysicalAddress, buf: &mut [u8]) {
        for byte in buf {
            *byte = unsafe { self.pointer(pa).read() };
            pa += 1;
        }
    }

    /// Copy `data` into simulated memory.
    pub fn write(&self, mut pa: PhysicalAddress, data: &[u8]) {
        for &byte in data {
            unsafe { self.pointer(pa).write(byte) };
            pa += 1;
        }
    }
}

unsafe impl WindowBackend for SimulatedRam {
    fn slot_pointer(&self, _slot: kernel_memory_addresses::VirtualAddress, frame: PhysicalAddress) -> NonNull<u8> {
        self.pointer(frame)
    }

    fn invalidate(&self, _virt: kernel_memory_addresses::VirtualAddress) {}
}

struct FramePool {
    used: Vec<bool>,
    in_use: u64,
}

/// Frame allocator for tests that counts frames in use and rejects double
/// frees.
pub struct CountingFrames {
    pool: SpinLock<FramePool>,
}

impl CountingFrames {
    /// `total` frames of which the first `reserved` are already in use.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(total: u64, reserved: u64) -> Self {
        let used = (0..total).map(|i| i < reserved).collect();
        Self {
            pool: SpinLock::new(FramePool {
                used,
                in_use: reserved.min(total),
            }),
        }
    }

    /// Frames currently in use.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.pool.lock().in_use
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn is_used(&self, frame: PhysicalAddress) -> bool {
        self.pool.lock().used[(frame.as_u64() / FRAME_SIZE) as usize]
    }
}

impl FrameAlloc for CountingFrames {
    fn request_frame(&self) -> Option<PhysicalAddress> {
        self.request_frames(1)
    }

    fn request_frames(&self, count: u64) -> Option<PhysicalAddress> {
        let mut pool = self.pool.lock();
        let count = usize::try_from(count).ok()?;
        let mut run = 0;
        let mut found = None;
        for (i, &used) in pool.used.iter().enumerate() {
            run = if used { 0 } else { run + 1 };
            if run == count {
                found = Some(i + 1 - count);
                break;
            }
        }
        let first = found?;
        pool.used[first..first + count].fill(true);
        pool.in_use += count as u64;
        Some(PhysicalAddress::new(first as u64 * FRAME_SIZE))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn free_frame(&self, frame: PhysicalAddress) {
        let mut pool = self.pool.lock();
        let index = (frame.as_u64() / FRAME_SIZE) as usize;
        assert!(pool.used[index], "double free of {frame:?}");
        pool.used[index] = false;
        pool.in_use -= 1;
    }
}

/// Simulated RAM holding a kernel tree whose top root entry reaches the
/// temporary window, the way the boot loader leaves it.
///
/// | frame | content |
/// |-------|---------|
/// | 0     | reserved |
/// | 1     | kernel root |
/// | 2     | window leaf table (slot 0: root, slot 1: itself) |
/// | 3, 4  | upper and middle table leading to the window |
pub struct SimulatedMachine {
    pub ram: SimulatedRam,
    pub frames: CountingFrames,
    pub window: TemporaryWindow<SimulatedRam>,
    pub kernel_root: PhysicalAddress,
}

impl SimulatedMachine {
    /// First frame not used by the kernel tree.
    pub const FIRST_FREE_FRAME: u64 = 5;

    /// # Panics
    /// If `frames` cannot hold the kernel tree.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        assert!(frames as u64 > Self::FIRST_FREE_FRAME, "not enough simulated frames");
        let ram = SimulatedRam::new(frames);
        let frame = |n: u64| PhysicalAddress::new(n * FRAME_SIZE);
        let table = |n: u64| unsafe { ram.pointer(frame(n)).cast::<PageTable>().as_mut() };

        let base = TEMPORARY_WINDOW_BASE;
        table(1)[base.table_index(TableLevel::Root)] = PageTableEntry::table(frame(3), Privilege::Kernel);
        table(3)[base.table_index(TableLevel::Upper)] = PageTableEntry::table(frame(4), Privilege::Kernel);
        table(4)[base.table_index(TableLevel::Middle)] = PageTableEntry::table(frame(2), Privilege::Kernel);
        table(2)[TEMPORARY_WINDOW_KERNEL_ROOT_SLOT] =
            PageTableEntry::leaf(frame(1), PageAccess::ReadWrite, Privilege::Kernel);
        table(2)[TEMPORARY_WINDOW_SELF_SLOT] = PageTableEntry::leaf(frame(2), PageAccess::ReadWrite, Privilege::Kernel);

        let window_table = ram.pointer(frame(2)).cast::<PageTable>();
        let window = unsafe { TemporaryWindow::new(ram.clone(), base, window_table, TEMPORARY_WINDOW_FIRST_FREE_SLOT) };

        Self {
            frames: CountingFrames::new(frames as u64, Self::FIRST_FREE_FRAME),
            ram,
            window,
            kernel_root: frame(1),
        }
    }

    #[must_use]
    pub const fn paging(&self) -> PagingEngine<'_, SimulatedRam, CountingFrames> {
        PagingEngine::new(&self.window, &self.frames, self.kernel_root)
    }
}

//! # Physical Frame Bitmap
//!
//! One bit per 4 KiB frame, 1 = in use. Frames past the end of the bitmap
//! are treated as in use and never handed out.
//!
//! Allocation scans from a cursor below which every frame is known to be in
//! use; freeing a frame below the cursor moves it back, so low frames are
//! reused first. Counters only change when a bit actually flips, which makes
//! double locks and double frees harmless.
//!
//! The bitmap starts out in a [`BootstrapArena`](crate::BootstrapArena),
//! seeded from the boot loader's bitmap, and is moved once into storage
//! sized for all of memory with [`FrameBitmapAllocator::relocate`].

use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame};
use kernel_sync::SpinLock;
use kernel_vmem::FrameAlloc;
use log::{debug, info, warn};

const WORD_BITS: u64 = u64::BITS as u64;

/// Errors of the frame bitmap.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("bitmap storage for {needed} frames holds only {available}")]
    StorageTooSmall { needed: u64, available: u64 },
}

/// Bitmap frame allocator.
pub struct FrameBitmapAllocator {
    bits: &'static mut [u64],
    /// Number of frames tracked by `bits`.
    frames: u64,
    /// Every frame below this index is in use.
    cursor: u64,
    /// Tracked frames in use.
    used: u64,
}

impl FrameBitmapAllocator {
    /// An allocator tracking nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            bits: &mut [],
            frames: 0,
            cursor: 0,
            used: 0,
        }
    }

    /// Track `frames` frames in `storage`, all of them in use.
    ///
    /// # Errors
    /// [`FrameError::StorageTooSmall`] if `storage` has fewer bits.
    pub fn new(storage: &'static mut [u64], frames: u64) -> Result<Self, FrameError> {
        let available = storage.len() as u64 * WORD_BITS;
        if available < frames {
            return Err(FrameError::StorageTooSmall {
                needed: frames,
                available,
            });
        }
        storage.fill(u64::MAX);
        Ok(Self {
            bits: storage,
            frames,
            cursor: 0,
            used: frames,
        })
    }

    /// Seed from the boot loader's bitmap.
    ///
    /// Only frames inside usable regions can be free; everything else is
    /// locked regardless of `boot_bits`. Frame 0 is always locked. Memory
    /// beyond what `storage` can describe stays out of reach until
    /// [`relocate`](Self::relocate).
    #[must_use]
    pub fn from_boot(storage: &'static mut [u64], boot_bits: &[u8], memory_map: &[MemoryRegion]) -> Self {
        let needed = memory_end(memory_map).div_ceil(FRAME_SIZE);
        let frames = needed.min(storage.len() as u64 * WORD_BITS);
        if frames < needed {
            warn!("bootstrap bitmap covers {frames} of {needed} frames until relocation");
        }
        storage.fill(u64::MAX);

        let mut bitmap = Self {
            bits: storage,
            frames,
            cursor: 0,
            used: frames,
        };
        bitmap.release_usable(memory_map, 0, Some(boot_bits));
        bitmap.lock(PhysicalAddress::zero());
        bitmap.restore_counters();
        info!(
            "frame bitmap seeded: {} KiB free of {} KiB",
            bitmap.free_bytes() / 1024,
            bitmap.total_bytes() / 1024
        );
        bitmap
    }

    /// Move the bitmap into `storage`, growing it to cover all usable memory
    /// in `memory_map`. The new bitmap is complete before it replaces the old
    /// one. Returns the old storage.
    ///
    /// # Errors
    /// [`FrameError::StorageTooSmall`] if `storage` cannot hold the grown
    /// bitmap; nothing changes in that case.
    pub fn relocate(
        &mut self,
        storage: &'static mut [u64],
        memory_map: &[MemoryRegion],
    ) -> Result<&'static mut [u64], FrameError> {
        let frames = memory_end(memory_map).div_ceil(FRAME_SIZE).max(self.frames);
        let available = storage.len() as u64 * WORD_BITS;
        if available < frames {
            return Err(FrameError::StorageTooSmall {
                needed: frames,
                available,
            });
        }

        storage.fill(u64::MAX);
        let carried = word(self.frames.div_ceil(WORD_BITS));
        storage[..carried].copy_from_slice(&self.bits[..carried]);

        let mut grown = Self {
            bits: storage,
            frames,
            cursor: self.cursor,
            used: frames,
        };
        // Frames the old bitmap could not describe were never handed out.
        let old_frames = self.frames;
        grown.release_usable(memory_map, old_frames, None);
        grown.restore_counters();

        let old = core::mem::replace(self, grown);
        debug!("frame bitmap relocated: {old_frames} -> {frames} frames");
        Ok(old.bits)
    }

    /// Recount used and free frames from the bits.
    pub fn restore_counters(&mut self) {
        let full_words = self.frames / WORD_BITS;
        let mut used: u64 = self.bits[..word(full_words)]
            .iter()
            .map(|w| u64::from(w.count_ones()))
            .sum();
        let tail = self.frames % WORD_BITS;
        if tail != 0 {
            let mask = (1u64 << tail) - 1;
            used += u64::from((self.bits[word(full_words)] & mask).count_ones());
        }
        self.used = used;
        self.cursor = (0..self.frames).find(|&i| !self.bit(i)).unwrap_or(self.frames);
    }

    /// One free frame.
    pub fn request_frame(&mut self) -> Option<PhysicalAddress> {
        self.request_frames(1)
    }

    /// `count` contiguous free frames, all marked in use.
    pub fn request_frames(&mut self, count: u64) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        let mut first_free = None;
        let mut run = 0;
        for index in self.cursor..self.frames {
            if self.bit(index) {
                run = 0;
                continue;
            }
            if first_free.is_none() {
                first_free = Some(index);
            }
            run += 1;
            if run == count {
                let start = index + 1 - count;
                for i in start..=index {
                    self.set(i);
                }
                self.used += count;
                self.cursor = match first_free {
                    Some(skipped) if skipped < start => skipped,
                    _ => index + 1,
                };
                return Some(PhysicalFrame::from_number(start).start_address());
            }
        }
        None
    }

    /// Mark the frame containing `addr` in use.
    pub fn lock(&mut self, addr: PhysicalAddress) {
        let index = addr.frame().number();
        if index < self.frames && !self.bit(index) {
            self.set(index);
            self.used += 1;
        }
    }

    /// Mark the frame containing `addr` free.
    pub fn free(&mut self, addr: PhysicalAddress) {
        let index = addr.frame().number();
        if index == 0 {
            warn!("ignoring attempt to free frame 0");
            return;
        }
        if index < self.frames && self.bit(index) {
            self.clear(index);
            self.used -= 1;
            if index < self.cursor {
                self.cursor = index;
            }
        }
    }

    pub fn lock_range(&mut self, addr: PhysicalAddress, count: u64) {
        for i in 0..count {
            self.lock(addr + i * FRAME_SIZE);
        }
    }

    pub fn free_range(&mut self, addr: PhysicalAddress, count: u64) {
        for i in 0..count {
            self.free(addr + i * FRAME_SIZE);
        }
    }

    /// Whether the frame containing `addr` is in use.
    #[must_use]
    pub fn is_used(&self, addr: PhysicalAddress) -> bool {
        let index = addr.frame().number();
        index >= self.frames || self.bit(index)
    }

    #[must_use]
    pub const fn frame_count(&self) -> u64 {
        self.frames
    }

    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.frames * FRAME_SIZE
    }

    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.used * FRAME_SIZE
    }

    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        (self.frames - self.used) * FRAME_SIZE
    }

    /// The raw bitmap words.
    #[must_use]
    pub fn words(&self) -> &[u64] {
        self.bits
    }

    /// Clear the bits of usable frames at or above `from`, keeping those
    /// `boot_bits` marks in use.
    fn release_usable(&mut self, memory_map: &[MemoryRegion], from: u64, boot_bits: Option<&[u8]>) {
        for region in memory_map.iter().filter(|r| r.kind == MemoryRegionKind::Usable) {
            let first = region.start.as_u64().div_ceil(FRAME_SIZE).max(from);
            let last = (region.end().as_u64() / FRAME_SIZE).min(self.frames);
            for index in first..last {
                if !boot_bits.is_some_and(|bits| boot_bit(bits, index)) {
                    self.clear(index);
                }
            }
        }
    }

    fn bit(&self, index: u64) -> bool {
        self.bits[word(index / WORD_BITS)] & (1 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: u64) {
        self.bits[word(index / WORD_BITS)] |= 1 << (index % WORD_BITS);
    }

    fn clear(&mut self, index: u64) {
        self.bits[word(index / WORD_BITS)] &= !(1 << (index % WORD_BITS));
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn word(index: u64) -> usize {
    index as usize
}

/// Whether the boot loader's byte-wise bitmap marks `index` in use. Frames
/// past its end were never touched by the loader.
#[allow(clippy::cast_possible_truncation)]
fn boot_bit(bits: &[u8], index: u64) -> bool {
    bits.get((index / 8) as usize).is_some_and(|b| b & (1 << (index % 8)) != 0)
}

fn memory_end(memory_map: &[MemoryRegion]) -> u64 {
    memory_map
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| r.end().as_u64())
        .max()
        .unwrap_or(0)
}

/// The frame bitmap behind a lock, shared by the paging engine, the heap
/// and the process manager.
pub struct FrameAllocator {
    bitmap: SpinLock<FrameBitmapAllocator>,
}

impl FrameAllocator {
    #[must_use]
    pub const fn new(bitmap: FrameBitmapAllocator) -> Self {
        Self {
            bitmap: SpinLock::new(bitmap),
        }
    }

    /// Run `f` with the bitmap locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut FrameBitmapAllocator) -> R) -> R {
        self.bitmap.with_lock(f)
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.with(|b| b.free_bytes())
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.with(|b| b.used_bytes())
    }

    #[must_use]
    pub fn is_used(&self, addr: PhysicalAddress) -> bool {
        self.with(|b| b.is_used(addr))
    }

    pub fn lock(&self, addr: PhysicalAddress) {
        self.with(|b| b.lock(addr));
    }

    pub fn lock_range(&self, addr: PhysicalAddress, count: u64) {
        self.with(|b| b.lock_range(addr, count));
    }

    /// See [`FrameBitmapAllocator::relocate`]; `old_frames` (the boot
    /// loader's bitmap pages) are freed through the new bitmap once it is in
    /// place.
    ///
    /// # Errors
    /// See [`FrameBitmapAllocator::relocate`].
    pub fn relocate(
        &self,
        storage: &'static mut [u64],
        memory_map: &[MemoryRegion],
        old_frames: Option<(PhysicalAddress, u64)>,
    ) -> Result<&'static mut [u64], FrameError> {
        self.with(|bitmap| {
            let old = bitmap.relocate(storage, memory_map)?;
            if let Some((base, count)) = old_frames {
                bitmap.free_range(base, count);
            }
            Ok(old)
        })
    }
}

impl FrameAlloc for FrameAllocator {
    fn request_frame(&self) -> Option<PhysicalAddress> {
        self.with(FrameBitmapAllocator::request_frame)
    }

    fn request_frames(&self, count: u64) -> Option<PhysicalAddress> {
        self.with(|b| b.request_frames(count))
    }

    fn free_frame(&self, frame: PhysicalAddress) {
        self.with(|b| b.free(frame));
    }

    fn free_frames(&self, base: PhysicalAddress, count: u64) {
        self.with(|b| b.free_range(base, count));
    }
}

//! # Temporary Window
//!
//! A single reserved leaf table whose slots map arbitrary physical frames
//! for a short time. Page tables of inactive address spaces, freshly
//! allocated frames and executable images are all reached through it.
//!
//! Slots are handed out by a cursor that only moves forward while slots are
//! taken and is rewound when a lower slot is released. Every slot below the
//! cursor is therefore occupied, and acquiring a slot is a short scan from
//! the cursor that skips occupied entries.
//!
//! ```text
//!   slot:   0    1    2    3    4    5    6   ...  511
//!         [root][self][ A ][ B ][   ][ C ][   ]     [   ]
//!                               ^ cursor
//! ```

use crate::entry::{PageAccess, PageTable, PageTableEntry, Privilege};
use core::marker::PhantomData;
use core::ptr::NonNull;
use kernel_memory_addresses::{ENTRIES_PER_TABLE, FRAME_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;
use log::trace;

/// Number of slots a single paging walk may hold at once: one per level plus
/// one for zeroing a freshly allocated table.
pub const WALK_SLOTS: usize = 5;

/// Errors of the temporary window.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WindowError {
    #[error("all temporary window slots are in use")]
    Exhausted,
}

/// Makes a window slot's memory reachable from the running code.
///
/// # Safety
/// [`slot_pointer`](Self::slot_pointer) must return a pointer to
/// [`FRAME_SIZE`] readable and writable bytes that alias `frame` for as long
/// as the slot's entry stays unchanged.
pub unsafe trait WindowBackend {
    /// Pointer to the contents of `frame`, which was just installed at `slot`.
    fn slot_pointer(&self, slot: VirtualAddress, frame: PhysicalAddress) -> NonNull<u8>;

    /// Drop any cached translation of `virt`.
    fn invalidate(&self, virt: VirtualAddress);
}

/// The MMU itself: slots are read through their virtual address.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[derive(Debug, Default, Copy, Clone)]
pub struct MmuWindow;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
unsafe impl WindowBackend for MmuWindow {
    #[inline]
    fn slot_pointer(&self, slot: VirtualAddress, _frame: PhysicalAddress) -> NonNull<u8> {
        // Window slots live at the top of the higher half and are never null.
        unsafe { NonNull::new_unchecked(slot.as_mut_ptr()) }
    }

    #[inline]
    fn invalidate(&self, virt: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
        }
    }
}

/// The reserved leaf table and its slot cursor.
pub struct TemporaryWindow<B: WindowBackend> {
    backend: B,
    base: VirtualAddress,
    table: NonNull<PageTableEntry>,
    first_free: usize,
    cursor: SpinLock<usize>,
}

// Safety: the table is only touched with the cursor lock held.
unsafe impl<B: WindowBackend + Send> Send for TemporaryWindow<B> {}
unsafe impl<B: WindowBackend + Sync> Sync for TemporaryWindow<B> {}

impl<B: WindowBackend> TemporaryWindow<B> {
    /// Take over the window leaf table.
    ///
    /// # Safety
    /// - `table` must point to the leaf table that translates the 2 MiB at
    ///   `base`, and stay writable for the window's lifetime.
    /// - Slots below `first_free` are left alone forever; nothing else may
    ///   modify the slots at or above it.
    pub unsafe fn new(backend: B, base: VirtualAddress, table: NonNull<PageTable>, first_free: usize) -> Self {
        debug_assert!(first_free < ENTRIES_PER_TABLE);
        debug_assert_eq!(base.table_index(kernel_memory_addresses::TableLevel::Leaf), 0);
        Self {
            backend,
            base,
            table: table.cast(),
            first_free,
            cursor: SpinLock::new(first_free),
        }
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Virtual address of `slot`.
    #[must_use]
    pub const fn slot_address(&self, slot: usize) -> VirtualAddress {
        self.base.offset(slot as u64 * FRAME_SIZE)
    }

    /// Number of slots that can be handed out in total.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        ENTRIES_PER_TABLE - self.first_free
    }

    /// Number of slots currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        let _cursor = self.cursor.lock();
        (self.first_free..ENTRIES_PER_TABLE)
            .filter(|&slot| self.entry(slot).present())
            .count()
    }

    /// Number of slots that are still free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use()
    }

    /// Map `frame` into the next free slot.
    ///
    /// # Errors
    /// [`WindowError::Exhausted`] if every slot is in use.
    pub fn map(&self, frame: PhysicalAddress) -> Result<TemporaryMapping<'_, B>, WindowError> {
        let frame = frame.align_down();
        let mut cursor = self.cursor.lock();

        debug_assert!(
            !(self.first_free..ENTRIES_PER_TABLE)
                .any(|slot| self.entry(slot).present() && self.entry(slot).address() == frame),
            "{frame:?} is already in the temporary window"
        );

        let slot = (*cursor..ENTRIES_PER_TABLE)
            .find(|&slot| !self.entry(slot).present())
            .ok_or(WindowError::Exhausted)?;

        self.set_entry(
            slot,
            PageTableEntry::leaf(frame, PageAccess::ReadWrite, Privilege::Kernel),
        );
        *cursor = slot + 1;

        let virt = self.slot_address(slot);
        self.backend.invalidate(virt);
        let ptr = self.backend.slot_pointer(virt, frame);
        trace!("window slot {slot} -> {frame:?}");

        Ok(TemporaryMapping {
            window: self,
            slot,
            frame,
            ptr,
            _not_send: PhantomData,
        })
    }

    /// Release a slot by address.
    ///
    /// Dropping the [`TemporaryMapping`] does the same; this is for callers
    /// that consumed the guard with [`TemporaryMapping::leak`].
    pub fn unmap(&self, virt: VirtualAddress) {
        let offset = virt.as_u64().wrapping_sub(self.base.as_u64());
        let slot = usize::try_from(offset / FRAME_SIZE).unwrap_or(usize::MAX);
        debug_assert!(
            (self.first_free..ENTRIES_PER_TABLE).contains(&slot),
            "{virt:?} is not a temporary window slot"
        );
        if (self.first_free..ENTRIES_PER_TABLE).contains(&slot) {
            self.release(slot);
        }
    }

    /// Drop the cached translation of `virt`.
    pub fn flush(&self, virt: VirtualAddress) {
        self.backend.invalidate(virt);
    }

    /// Copy the contents of frame `from` into frame `to`.
    ///
    /// # Errors
    /// Needs two free slots.
    pub fn copy_frame(&self, from: PhysicalAddress, to: PhysicalAddress) -> Result<(), WindowError> {
        let source = self.map(from)?;
        let mut target = self.map(to)?;
        target.bytes_mut().copy_from_slice(source.bytes());
        Ok(())
    }

    /// Fill a frame with zeros.
    ///
    /// # Errors
    /// Needs one free slot.
    pub fn zero_frame(&self, frame: PhysicalAddress) -> Result<(), WindowError> {
        self.map(frame)?.zero();
        Ok(())
    }

    /// Write `data` to physical memory starting at `at`, one frame at a time.
    ///
    /// # Errors
    /// Needs one free slot.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_physical(&self, mut at: PhysicalAddress, mut data: &[u8]) -> Result<(), WindowError> {
        while !data.is_empty() {
            let offset = at.frame_offset() as usize;
            let n = (FRAME_SIZE as usize - offset).min(data.len());
            self.map(at)?.bytes_mut()[offset..offset + n].copy_from_slice(&data[..n]);
            at += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    /// Read physical memory starting at `at` into `buf`.
    ///
    /// # Errors
    /// Needs one free slot.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_physical(&self, mut at: PhysicalAddress, mut buf: &mut [u8]) -> Result<(), WindowError> {
        while !buf.is_empty() {
            let offset = at.frame_offset() as usize;
            let n = (FRAME_SIZE as usize - offset).min(buf.len());
            let (head, tail) = buf.split_at_mut(n);
            head.copy_from_slice(&self.map(at)?.bytes()[offset..offset + n]);
            at += n as u64;
            buf = tail;
        }
        Ok(())
    }

    fn release(&self, slot: usize) {
        let mut cursor = self.cursor.lock();
        self.set_entry(slot, PageTableEntry::new());
        self.backend.invalidate(self.slot_address(slot));
        if slot < *cursor {
            *cursor = slot;
        }
    }

    fn entry(&self, slot: usize) -> PageTableEntry {
        unsafe { self.table.add(slot).read_volatile() }
    }

    fn set_entry(&self, slot: usize, entry: PageTableEntry) {
        unsafe { self.table.add(slot).write_volatile(entry) }
    }
}

/// A live window slot. Dropping it unmaps the slot.
pub struct TemporaryMapping<'w, B: WindowBackend> {
    window: &'w TemporaryWindow<B>,
    slot: usize,
    frame: PhysicalAddress,
    ptr: NonNull<u8>,
    _not_send: PhantomData<*mut u8>,
}

impl<B: WindowBackend> TemporaryMapping<'_, B> {
    /// Where the frame is visible.
    #[must_use]
    pub const fn virt(&self) -> VirtualAddress {
        self.window.slot_address(self.slot)
    }

    /// The mapped frame.
    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub const fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), FRAME_SIZE as usize) }
    }

    pub const fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), FRAME_SIZE as usize) }
    }

    /// View the frame as a page table.
    #[must_use]
    pub const fn table(&self) -> &PageTable {
        unsafe { self.ptr.cast::<PageTable>().as_ref() }
    }

    pub const fn table_mut(&mut self) -> &mut PageTable {
        unsafe { self.ptr.cast::<PageTable>().as_mut() }
    }

    /// Fill the frame with zeros.
    pub fn zero(&mut self) {
        self.bytes_mut().fill(0);
    }

    /// Unmap now.
    pub fn release(self) {}

    /// Keep the slot mapped and return its address. The slot must later be
    /// released with [`TemporaryWindow::unmap`].
    #[must_use]
    pub fn leak(self) -> VirtualAddress {
        let virt = self.virt();
        core::mem::forget(self);
        virt
    }
}

impl<B: WindowBackend> Drop for TemporaryMapping<'_, B> {
    fn drop(&mut self) {
        self.window.release(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::SimulatedMachine;
    use crate::window::WindowError;
    use kernel_info::memory::{TEMPORARY_WINDOW_BASE, TEMPORARY_WINDOW_FIRST_FREE_SLOT};
    use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};

    #[test]
    fn nested_mappings_get_distinct_slots() {
        let machine = SimulatedMachine::new(32);
        let a = machine.window.map(PhysicalAddress::new(0x8000)).unwrap();
        let b = machine.window.map(PhysicalAddress::new(0x9000)).unwrap();
        assert_ne!(a.virt(), b.virt());
        assert_eq!(
            a.virt(),
            TEMPORARY_WINDOW_BASE.offset(TEMPORARY_WINDOW_FIRST_FREE_SLOT as u64 * FRAME_SIZE)
        );
        assert_eq!(machine.window.in_use(), 2);
    }

    #[test]
    fn release_rewinds_cursor() {
        let machine = SimulatedMachine::new(32);
        let a = machine.window.map(PhysicalAddress::new(0x8000)).unwrap();
        let first = a.virt();
        let b = machine.window.map(PhysicalAddress::new(0x9000)).unwrap();
        drop(a);
        let c = machine.window.map(PhysicalAddress::new(0xA000)).unwrap();
        assert_eq!(c.virt(), first);
        assert_ne!(c.virt(), b.virt());
    }

    #[test]
    fn writes_reach_the_frame() {
        let machine = SimulatedMachine::new(32);
        {
            let mut m = machine.window.map(PhysicalAddress::new(0x8000)).unwrap();
            m.bytes_mut()[17] = 0xAB;
        }
        let mut byte = [0u8; 1];
        machine.ram.read(PhysicalAddress::new(0x8000 + 17), &mut byte);
        assert_eq!(byte[0], 0xAB);
    }

    #[test]
    fn exhaustion_is_reported() {
        let machine = SimulatedMachine::new(1024);
        let capacity = machine.window.capacity();
        let held: Vec<_> = (0..capacity as u64)
            .map(|i| machine.window.map(PhysicalAddress::new((i + 8) * FRAME_SIZE)).unwrap())
            .collect();
        assert_eq!(
            machine.window.map(PhysicalAddress::new(0x1_0000_0000)).err(),
            Some(WindowError::Exhausted)
        );
        drop(held);
        assert_eq!(machine.window.in_use(), 0);
    }

    #[test]
    fn physical_access_spans_frames() {
        let machine = SimulatedMachine::new(32);
        let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let at = PhysicalAddress::new(0x8000 + 4000);
        machine.window.write_physical(at, &payload).unwrap();

        let mut back = vec![0u8; payload.len()];
        machine.window.read_physical(at, &mut back).unwrap();
        assert_eq!(back, payload);

        machine
            .window
            .copy_frame(PhysicalAddress::new(0x9000), PhysicalAddress::new(0xB000))
            .unwrap();
        let mut copied = [0u8; 16];
        machine.ram.read(PhysicalAddress::new(0xB000), &mut copied);
        assert_eq!(copied[..], payload[96..112]);
        assert_eq!(machine.window.in_use(), 0);
    }

    #[test]
    fn leaked_slot_is_released_by_address() {
        let machine = SimulatedMachine::new(32);
        let virt = machine.window.map(PhysicalAddress::new(0x8000)).unwrap().leak();
        assert_eq!(machine.window.in_use(), 1);
        machine.window.unmap(virt);
        assert_eq!(machine.window.in_use(), 0);
    }
}

//! # Paging Engine
//!
//! Builds, inspects and tears down four-level page-table trees. Every table
//! is reached through the [temporary window](crate::window), so the engine
//! works on any address space, active or not.
//!
//! ## Ownership
//!
//! Addresses at or above the kernel boundary belong to the shared kernel
//! region. A process tree borrows the kernel's tables there through
//! [`PagingEngine::inject_kernel_mappings`] and never frees them. Upper
//! tables hanging off the kernel root's shared entries are kept even when
//! they become empty, as process roots may still point at them.
//!
//! ## Failure
//!
//! [`map`](PagingEngine::map) and [`unmap`](PagingEngine::unmap) are
//! all-or-nothing. A map that runs out of frames, or hits an existing
//! mapping, unmaps whatever it installed (tables included) before it
//! returns the error.

use crate::FrameAlloc;
use crate::entry::{PageAccess, PageFlags, PageTableEntry, Privilege};
use crate::window::{TemporaryWindow, WALK_SLOTS, WindowBackend, WindowError};
use kernel_info::memory::KERNEL_HEAP_START;
use kernel_memory_addresses::{ENTRIES_PER_TABLE, FRAME_SIZE, PhysicalAddress, TableLevel, VirtualAddress};
use log::{trace, warn};

/// Errors of the mapping operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical frames for page tables")]
    OutOfFrames,
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("{0:?} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("physical and virtual address differ in their page offset")]
    Misaligned,
    #[error("range leaves its canonical half")]
    InvalidRange,
}

/// A run of unmapped virtual address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FreeRange {
    pub start: VirtualAddress,
    /// Bytes found free from `start`; at least the requested size.
    pub len: u64,
}

/// Page-table operations bound to a window, a frame source and the kernel
/// root table.
pub struct PagingEngine<'a, B: WindowBackend, F: FrameAlloc + ?Sized> {
    window: &'a TemporaryWindow<B>,
    frames: &'a F,
    kernel_root: PhysicalAddress,
    kernel_boundary: VirtualAddress,
}

impl<B: WindowBackend, F: FrameAlloc + ?Sized> Clone for PagingEngine<'_, B, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: WindowBackend, F: FrameAlloc + ?Sized> Copy for PagingEngine<'_, B, F> {}

/// The part of a range that still has to be walked.
struct Walk {
    virt: VirtualAddress,
    remaining: u64,
}

impl Walk {
    /// Bytes from the cursor to the end of its `level` entry, capped at what
    /// is left.
    const fn step(&self, level: TableLevel) -> u64 {
        let span = level.entry_span();
        let into = self.virt.as_u64() & (span - 1);
        let step = span - into;
        if step < self.remaining { step } else { self.remaining }
    }

    const fn advance(&mut self, bytes: u64) {
        self.virt = self.virt.offset(bytes);
        self.remaining -= bytes;
    }
}

struct MapWalk {
    walk: Walk,
    phys: PhysicalAddress,
    leaf: PageTableEntry,
    privilege: Privilege,
}

impl<'a, B: WindowBackend, F: FrameAlloc + ?Sized> PagingEngine<'a, B, F> {
    /// An engine for the tree rooted at `kernel_root`, sharing everything at
    /// and above [`KERNEL_HEAP_START`].
    pub const fn new(window: &'a TemporaryWindow<B>, frames: &'a F, kernel_root: PhysicalAddress) -> Self {
        Self {
            window,
            frames,
            kernel_root,
            kernel_boundary: KERNEL_HEAP_START,
        }
    }

    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalAddress {
        self.kernel_root
    }

    #[must_use]
    pub const fn kernel_boundary(&self) -> VirtualAddress {
        self.kernel_boundary
    }

    #[must_use]
    pub const fn window(&self) -> &'a TemporaryWindow<B> {
        self.window
    }

    #[must_use]
    pub const fn frames(&self) -> &'a F {
        self.frames
    }

    /// Allocate and clear a root table for a new address space.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] or a window error; nothing is leaked.
    pub fn new_root(&self) -> Result<PhysicalAddress, MapError> {
        self.new_table()
    }

    /// Map `size` bytes at `virt` to `phys` in the tree at `root`.
    ///
    /// Both addresses must share their page offset; the range is widened to
    /// whole pages. Returns the number of bytes mapped.
    ///
    /// # Errors
    /// - [`MapError::AlreadyMapped`] if any page of the range is present.
    /// - [`MapError::OutOfFrames`] if a table could not be allocated.
    /// - [`MapError::Misaligned`] / [`MapError::InvalidRange`] for bad input.
    ///
    /// Nothing stays mapped when an error is returned.
    pub fn map(
        &self,
        root: PhysicalAddress,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
        access: PageAccess,
        privilege: Privilege,
    ) -> Result<u64, MapError> {
        if phys.frame_offset() != virt.page_offset() {
            return Err(MapError::Misaligned);
        }
        if size == 0 {
            return Ok(0);
        }
        let (start, len) = page_range(virt, size)?;
        self.reserve_walk()?;

        let mut walk = MapWalk {
            walk: Walk {
                virt: start,
                remaining: len,
            },
            phys: phys.align_down(),
            leaf: PageTableEntry::leaf(PhysicalAddress::zero(), access, privilege),
            privilege,
        };

        match self.map_level(root, TableLevel::Root, &mut walk) {
            Ok(()) => {
                trace!("mapped {start:?}+{len:#x} -> {:?} in {root:?}", phys.align_down());
                Ok(len)
            }
            Err(error) => {
                let done = walk.walk.virt.as_u64().wrapping_sub(start.as_u64());
                // Tables created for the failing page are empty; include it in
                // the rollback unless it belongs to someone else.
                let undo = match error {
                    MapError::AlreadyMapped(_) => done,
                    _ => (done + FRAME_SIZE).min(len),
                };
                if undo > 0
                    && let Err(e) = self.unmap_pages(root, start, undo)
                {
                    warn!("rollback of {start:?}+{undo:#x} failed: {e}");
                }
                Err(error)
            }
        }
    }

    /// Unmap `size` bytes at `virt`, freeing tables that become empty.
    ///
    /// Absent pages count as unmapped. Leaf frames are not freed; they
    /// belong to whoever mapped them. Returns the number of bytes covered.
    ///
    /// # Errors
    /// [`MapError::InvalidRange`] for a range outside one canonical half or
    /// a window error, in both cases before anything changed.
    pub fn unmap(&self, root: PhysicalAddress, virt: VirtualAddress, size: u64) -> Result<u64, MapError> {
        if size == 0 {
            return Ok(0);
        }
        let (start, len) = page_range(virt, size)?;
        self.reserve_walk()?;
        self.unmap_pages(root, start, len)?;
        trace!("unmapped {start:?}+{len:#x} in {root:?}");
        Ok(len)
    }

    /// Map a range into the kernel tree.
    ///
    /// # Errors
    /// See [`map`](Self::map).
    pub fn map_kernel(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
        access: PageAccess,
    ) -> Result<u64, MapError> {
        self.map(self.kernel_root, phys, virt, size, access, Privilege::Kernel)
    }

    /// Unmap a range from the kernel tree.
    ///
    /// # Errors
    /// See [`unmap`](Self::unmap).
    pub fn unmap_kernel(&self, virt: VirtualAddress, size: u64) -> Result<u64, MapError> {
        self.unmap(self.kernel_root, virt, size)
    }

    /// The leaf entry translating `virt`, if present.
    ///
    /// # Errors
    /// Fails if the window has no free slot.
    pub fn entry(&self, root: PhysicalAddress, virt: VirtualAddress) -> Result<Option<PageTableEntry>, WindowError> {
        let mut frame = root;
        let mut level = TableLevel::Root;
        loop {
            let entry = self.window.map(frame)?.table()[virt.table_index(level)];
            if !entry.present() {
                return Ok(None);
            }
            match level.next() {
                Some(next) if !entry.huge() => {
                    frame = entry.address();
                    level = next;
                }
                _ => return Ok(Some(entry)),
            }
        }
    }

    /// Physical address `virt` translates to in the tree at `root`.
    ///
    /// # Errors
    /// Fails if the window has no free slot.
    pub fn translate(&self, root: PhysicalAddress, virt: VirtualAddress) -> Result<Option<PhysicalAddress>, WindowError> {
        let mut frame = root;
        let mut level = TableLevel::Root;
        loop {
            let entry = self.window.map(frame)?.table()[virt.table_index(level)];
            if !entry.present() {
                return Ok(None);
            }
            match level.next() {
                Some(next) if !entry.huge() => {
                    frame = entry.address();
                    level = next;
                }
                _ => {
                    let offset = virt.as_u64() & (level.entry_span() - 1);
                    return Ok(Some(entry.address() + offset));
                }
            }
        }
    }

    /// Find at least `size` bytes of unmapped address space at or after
    /// `hint`, without leaving the canonical half `hint` is in.
    ///
    /// An absent entry at any level counts as free for its whole span, so the
    /// returned length may exceed `size`.
    ///
    /// # Errors
    /// Fails if the window has no free slot.
    pub fn find_free_virtual_range(
        &self,
        root: PhysicalAddress,
        hint: VirtualAddress,
        size: u64,
    ) -> Result<Option<FreeRange>, WindowError> {
        let wanted = size.max(1).div_ceil(FRAME_SIZE).saturating_mul(FRAME_SIZE);
        let last = if hint.is_higher_half() {
            u64::MAX
        } else {
            VirtualAddress::LOWER_HALF_END - 1
        };
        let Some(mut addr) = hint.as_u64().checked_next_multiple_of(FRAME_SIZE) else {
            return Ok(None);
        };

        let mut run_start = addr;
        let mut run_len = 0u64;
        while run_len < wanted {
            if addr > last {
                return Ok(None);
            }
            if let Some(free) = self.probe(root, VirtualAddress::new(addr))? {
                run_len += free;
                match addr.checked_add(free) {
                    Some(next) => addr = next,
                    None if run_len >= wanted => break,
                    None => return Ok(None),
                }
            } else {
                let Some(next) = addr.checked_add(FRAME_SIZE) else {
                    return Ok(None);
                };
                addr = next;
                run_start = addr;
                run_len = 0;
            }
        }

        Ok(Some(FreeRange {
            start: VirtualAddress::new(run_start),
            len: run_len,
        }))
    }

    /// Free every table of the tree at `root` below the kernel boundary, then
    /// the root itself. Leaf frames are left to their owners. Returns the
    /// number of frames released.
    ///
    /// # Errors
    /// Fails before freeing anything if the window is too full to walk.
    pub fn delete_address_space(&self, root: PhysicalAddress) -> Result<u64, WindowError> {
        debug_assert_ne!(root, self.kernel_root, "refusing to delete the kernel tree");
        self.reserve_walk()?;
        let mut freed = 0;
        self.for_each_owned_table(root, TableLevel::Root, 0, &mut |frame| {
            self.frames.free_frame(frame);
            freed += 1;
        })?;
        self.frames.free_frame(root);
        trace!("deleted address space {root:?} ({} tables)", freed + 1);
        Ok(freed + 1)
    }

    /// Number of frames [`delete_address_space`](Self::delete_address_space)
    /// would release, root included.
    ///
    /// # Errors
    /// Fails if the window has no free slot.
    pub fn table_frame_count(&self, root: PhysicalAddress) -> Result<u64, WindowError> {
        let mut count = 1;
        self.for_each_owned_table(root, TableLevel::Root, 0, &mut |_| count += 1)?;
        Ok(count)
    }

    /// Copy the kernel's shared mappings into the tree at `root`.
    ///
    /// Only entries the process lacks are filled in; where both trees have a
    /// different table for the same span, the walk descends into both.
    /// Copied entries start with a clear accessed bit.
    ///
    /// # Errors
    /// Fails if the window has no free slot.
    pub fn inject_kernel_mappings(&self, root: PhysicalAddress) -> Result<(), WindowError> {
        if root == self.kernel_root {
            return Ok(());
        }
        self.merge_shared(self.kernel_root, root, TableLevel::Root, 0)
    }

    /// Set `flags` on every present page in the range. Returns the number of
    /// pages changed.
    ///
    /// # Errors
    /// See [`unmap`](Self::unmap).
    pub fn set_flags(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
        flags: PageFlags,
    ) -> Result<u64, MapError> {
        self.update_flags(root, virt, size, flags, true)
    }

    /// Clear `flags` on every present page in the range. Returns the number
    /// of pages changed.
    ///
    /// # Errors
    /// See [`unmap`](Self::unmap).
    pub fn clear_flags(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
        flags: PageFlags,
    ) -> Result<u64, MapError> {
        self.update_flags(root, virt, size, flags, false)
    }

    fn reserve_walk(&self) -> Result<(), WindowError> {
        if self.window.available() < WALK_SLOTS {
            return Err(WindowError::Exhausted);
        }
        Ok(())
    }

    fn new_table(&self) -> Result<PhysicalAddress, MapError> {
        let frame = self.frames.request_frame().ok_or(MapError::OutOfFrames)?;
        match self.window.map(frame) {
            Ok(mut table) => {
                table.zero();
                Ok(frame)
            }
            Err(e) => {
                self.frames.free_frame(frame);
                Err(e.into())
            }
        }
    }

    fn map_level(&self, table_frame: PhysicalAddress, level: TableLevel, walk: &mut MapWalk) -> Result<(), MapError> {
        let mut table = self.window.map(table_frame)?;
        for index in walk.walk.virt.table_index(level)..ENTRIES_PER_TABLE {
            if walk.walk.remaining == 0 {
                break;
            }
            let entry = table.table()[index];

            let Some(next) = level.next() else {
                if entry.present() {
                    return Err(MapError::AlreadyMapped(walk.walk.virt));
                }
                table.table_mut()[index] = walk.leaf.with_address(walk.phys);
                walk.walk.advance(FRAME_SIZE);
                walk.phys += FRAME_SIZE;
                continue;
            };

            let child = if entry.present() {
                if entry.huge() {
                    return Err(MapError::AlreadyMapped(walk.walk.virt));
                }
                if walk.privilege == Privilege::User && !entry.user() {
                    table.table_mut()[index] = entry.with_user(true);
                }
                entry.address()
            } else {
                let frame = self.new_table()?;
                table.table_mut()[index] = PageTableEntry::table(frame, walk.privilege);
                frame
            };
            self.map_level(child, next, walk)?;
        }
        Ok(())
    }

    fn unmap_pages(&self, root: PhysicalAddress, start: VirtualAddress, len: u64) -> Result<(), WindowError> {
        let mut walk = Walk {
            virt: start,
            remaining: len,
        };
        self.unmap_level(root, TableLevel::Root, &mut walk).map(|_| ())
    }

    /// Returns whether the table is empty afterwards.
    fn unmap_level(&self, table_frame: PhysicalAddress, level: TableLevel, walk: &mut Walk) -> Result<bool, WindowError> {
        let mut table = self.window.map(table_frame)?;
        for index in walk.virt.table_index(level)..ENTRIES_PER_TABLE {
            if walk.remaining == 0 {
                break;
            }
            let entry = table.table()[index];

            if level == TableLevel::Leaf {
                if entry.present() {
                    table.table_mut()[index] = PageTableEntry::new();
                    self.window.flush(walk.virt);
                }
                walk.advance(FRAME_SIZE);
            } else if let Some(next) = level.next().filter(|_| entry.present() && !entry.huge()) {
                let shared = level == TableLevel::Root && self.is_shared(walk.virt);
                if self.unmap_level(entry.address(), next, walk)? && !shared {
                    table.table_mut()[index] = PageTableEntry::new();
                    self.frames.free_frame(entry.address());
                }
            } else {
                walk.advance(walk.step(level));
            }
        }
        Ok(table.table().is_empty())
    }

    fn update_flags(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
        flags: PageFlags,
        on: bool,
    ) -> Result<u64, MapError> {
        if size == 0 {
            return Ok(0);
        }
        let (start, len) = page_range(virt, size)?;
        self.reserve_walk()?;
        let mut walk = Walk {
            virt: start,
            remaining: len,
        };
        let mut changed = 0;
        self.update_level(root, TableLevel::Root, &mut walk, flags, on, &mut changed)?;
        Ok(changed)
    }

    fn update_level(
        &self,
        table_frame: PhysicalAddress,
        level: TableLevel,
        walk: &mut Walk,
        flags: PageFlags,
        on: bool,
        changed: &mut u64,
    ) -> Result<(), WindowError> {
        let mut table = self.window.map(table_frame)?;
        for index in walk.virt.table_index(level)..ENTRIES_PER_TABLE {
            if walk.remaining == 0 {
                break;
            }
            let entry = table.table()[index];

            if level == TableLevel::Leaf {
                if entry.present() {
                    table.table_mut()[index] = entry.with_flags(flags, on);
                    self.window.flush(walk.virt);
                    *changed += 1;
                }
                walk.advance(FRAME_SIZE);
            } else if let Some(next) = level.next().filter(|_| entry.present() && !entry.huge()) {
                // A user page is only reachable through user tables.
                if on && flags.user() && !entry.user() {
                    table.table_mut()[index] = entry.with_user(true);
                }
                self.update_level(entry.address(), next, walk, flags, on, changed)?;
            } else {
                walk.advance(walk.step(level));
            }
        }
        Ok(())
    }

    /// Free bytes from `virt` to the end of the absent entry covering it, or
    /// `None` if `virt` is mapped.
    fn probe(&self, root: PhysicalAddress, virt: VirtualAddress) -> Result<Option<u64>, WindowError> {
        let mut frame = root;
        let mut level = TableLevel::Root;
        loop {
            let entry = self.window.map(frame)?.table()[virt.table_index(level)];
            if !entry.present() {
                let span = level.entry_span();
                return Ok(Some(span - (virt.as_u64() & (span - 1))));
            }
            match level.next() {
                Some(next) if !entry.huge() => {
                    frame = entry.address();
                    level = next;
                }
                _ => return Ok(None),
            }
        }
    }

    /// Post-order walk over the tables below `table_frame` whose span starts
    /// below the kernel boundary.
    fn for_each_owned_table(
        &self,
        table_frame: PhysicalAddress,
        level: TableLevel,
        base: u64,
        visit: &mut impl FnMut(PhysicalAddress),
    ) -> Result<(), WindowError> {
        let Some(next) = level.next() else {
            return Ok(());
        };
        let table = self.window.map(table_frame)?;
        for index in 0..ENTRIES_PER_TABLE {
            let start = VirtualAddress::canonical(base + index as u64 * level.entry_span());
            if self.is_shared(start) {
                break;
            }
            let entry = table.table()[index];
            if !entry.present() || entry.huge() {
                continue;
            }
            self.for_each_owned_table(entry.address(), next, start.as_u64(), visit)?;
            visit(entry.address());
        }
        Ok(())
    }

    fn merge_shared(
        &self,
        source: PhysicalAddress,
        target: PhysicalAddress,
        level: TableLevel,
        base: u64,
    ) -> Result<(), WindowError> {
        let theirs = self.window.map(source)?;
        let mut ours = self.window.map(target)?;
        let span = level.entry_span();
        let boundary = self.kernel_boundary.as_u64();

        for index in 0..ENTRIES_PER_TABLE {
            let start = VirtualAddress::canonical(base + index as u64 * span).as_u64();
            if start + (span - 1) < boundary {
                continue;
            }
            let kernel = theirs.table()[index];
            if !kernel.present() {
                continue;
            }
            let own = ours.table()[index];
            if !own.present() {
                if start >= boundary {
                    ours.table_mut()[index] = kernel.with_accessed(false);
                }
            } else if own.address() != kernel.address()
                && !own.huge()
                && !kernel.huge()
                && let Some(next) = level.next()
            {
                self.merge_shared(kernel.address(), own.address(), next, start)?;
            }
        }
        Ok(())
    }

    const fn is_shared(&self, virt: VirtualAddress) -> bool {
        virt.as_u64() >= self.kernel_boundary.as_u64()
    }
}

/// Widen `size` bytes at `virt` to whole pages.
fn page_range(virt: VirtualAddress, size: u64) -> Result<(VirtualAddress, u64), MapError> {
    let start = virt.align_down();
    let bytes = size.checked_add(virt.page_offset()).ok_or(MapError::InvalidRange)?;
    let len = bytes
        .div_ceil(FRAME_SIZE)
        .checked_mul(FRAME_SIZE)
        .ok_or(MapError::InvalidRange)?;
    let last = start.as_u64().checked_add(len - 1).ok_or(MapError::InvalidRange)?;
    if !start.is_higher_half() && last >= VirtualAddress::LOWER_HALF_END {
        return Err(MapError::InvalidRange);
    }
    Ok((start, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedMachine;
    use kernel_info::memory::{TEMPORARY_WINDOW_BASE, USER_CODE_BASE, USER_STACK_TOP};

    const PAGE: u64 = FRAME_SIZE;

    fn data(frame: u64) -> PhysicalAddress {
        PhysicalAddress::new(frame * PAGE)
    }

    #[test]
    fn map_translate_unmap_reclaims_tables() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        let root = paging.new_root().unwrap();
        let before = machine.frames.used();

        let mapped = paging
            .map(root, data(40), USER_CODE_BASE, 3 * PAGE, PageAccess::ReadWrite, Privilege::User)
            .unwrap();
        assert_eq!(mapped, 3 * PAGE);
        assert_eq!(machine.frames.used(), before + 3, "upper, middle and leaf table");
        assert_eq!(paging.table_frame_count(root).unwrap(), 4);

        for page in 0..3 {
            let va = USER_CODE_BASE + page * PAGE + 0x10;
            assert_eq!(paging.translate(root, va).unwrap(), Some(data(40 + page) + 0x10));
        }
        let leaf = paging.entry(root, USER_CODE_BASE).unwrap().unwrap();
        assert!(leaf.user() && leaf.writable());

        assert_eq!(paging.unmap(root, USER_CODE_BASE, 3 * PAGE).unwrap(), 3 * PAGE);
        assert_eq!(paging.translate(root, USER_CODE_BASE).unwrap(), None);
        assert_eq!(machine.frames.used(), before);
        assert_eq!(paging.table_frame_count(root).unwrap(), 1);
        assert_eq!(machine.window.in_use(), 0);
    }

    #[test]
    fn partial_unmap_keeps_tables_in_use() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        let root = paging.new_root().unwrap();
        paging
            .map(root, data(40), USER_CODE_BASE, 2 * PAGE, PageAccess::ReadOnly, Privilege::User)
            .unwrap();
        let with_tables = machine.frames.used();

        paging.unmap(root, USER_CODE_BASE, PAGE).unwrap();
        assert_eq!(machine.frames.used(), with_tables);
        assert_eq!(paging.translate(root, USER_CODE_BASE + PAGE).unwrap(), Some(data(41)));
    }

    #[test]
    fn overlapping_map_is_rejected_and_rolled_back() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        let root = paging.new_root().unwrap();
        let taken = USER_CODE_BASE + 2 * PAGE;
        paging
            .map(root, data(50), taken, PAGE, PageAccess::ReadWrite, Privilege::User)
            .unwrap();
        let before = machine.frames.used();

        let err = paging
            .map(root, data(40), USER_CODE_BASE, 3 * PAGE, PageAccess::ReadWrite, Privilege::User)
            .unwrap_err();
        assert_eq!(err, MapError::AlreadyMapped(taken));
        assert_eq!(paging.translate(root, USER_CODE_BASE).unwrap(), None);
        assert_eq!(paging.translate(root, USER_CODE_BASE + PAGE).unwrap(), None);
        assert_eq!(paging.translate(root, taken).unwrap(), Some(data(50)));
        assert_eq!(machine.frames.used(), before);
    }

    #[test]
    fn running_out_of_frames_leaves_no_tables_behind() {
        // Frames 5, 6 and 7 are free: one for the root, two short of a walk.
        let machine = SimulatedMachine::new(8);
        let paging = machine.paging();
        let root = paging.new_root().unwrap();
        let before = machine.frames.used();

        let err = paging
            .map(root, data(40), USER_CODE_BASE, PAGE, PageAccess::ReadWrite, Privilege::User)
            .unwrap_err();
        assert_eq!(err, MapError::OutOfFrames);
        assert_eq!(machine.frames.used(), before);
        assert_eq!(paging.table_frame_count(root).unwrap(), 1);
    }

    #[test]
    fn rejects_bad_ranges() {
        let machine = SimulatedMachine::new(16);
        let paging = machine.paging();
        let root = paging.new_root().unwrap();
        assert_eq!(
            paging.map(root, PhysicalAddress::new(0x1001), USER_CODE_BASE, PAGE, PageAccess::ReadOnly, Privilege::User),
            Err(MapError::Misaligned)
        );
        assert_eq!(
            paging.map(root, data(3), USER_STACK_TOP, 2 * PAGE, PageAccess::ReadOnly, Privilege::User),
            Err(MapError::InvalidRange)
        );
        assert_eq!(paging.unmap(root, USER_CODE_BASE, 0), Ok(0));
    }

    #[test]
    fn absent_ranges_count_as_unmapped() {
        let machine = SimulatedMachine::new(16);
        let paging = machine.paging();
        let root = paging.new_root().unwrap();
        let before = machine.frames.used();
        assert_eq!(paging.unmap(root, USER_CODE_BASE, 5 * PAGE), Ok(5 * PAGE));
        assert_eq!(machine.frames.used(), before);
    }

    #[test]
    fn free_range_search_skips_mapped_pages() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        let root = paging.new_root().unwrap();

        let found = paging.find_free_virtual_range(root, USER_CODE_BASE, 3 * PAGE).unwrap().unwrap();
        assert_eq!(found.start, USER_CODE_BASE);
        assert!(found.len >= 3 * PAGE);

        paging
            .map(root, data(40), USER_CODE_BASE + PAGE, PAGE, PageAccess::ReadOnly, Privilege::User)
            .unwrap();
        let found = paging.find_free_virtual_range(root, USER_CODE_BASE, 2 * PAGE).unwrap().unwrap();
        assert_eq!(found.start, USER_CODE_BASE + 2 * PAGE);
    }

    #[test]
    fn free_range_search_stays_in_its_half() {
        let machine = SimulatedMachine::new(16);
        let paging = machine.paging();
        let root = paging.new_root().unwrap();
        assert_eq!(paging.find_free_virtual_range(root, USER_STACK_TOP, 2 * PAGE).unwrap(), None);
        let last = paging.find_free_virtual_range(root, USER_STACK_TOP, PAGE).unwrap().unwrap();
        assert_eq!(last.start, USER_STACK_TOP);
        assert_eq!(last.len, PAGE);
    }

    #[test]
    fn delete_releases_every_table_but_not_data() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        let before = machine.frames.used();
        let root = paging.new_root().unwrap();

        paging
            .map(root, data(40), USER_CODE_BASE, PAGE, PageAccess::ReadOnly, Privilege::User)
            .unwrap();
        paging
            .map(root, data(41), USER_STACK_TOP - PAGE, PAGE, PageAccess::ReadWrite, Privilege::User)
            .unwrap();
        assert_eq!(paging.table_frame_count(root).unwrap(), 7);

        assert_eq!(paging.delete_address_space(root).unwrap(), 7);
        assert_eq!(machine.frames.used(), before);
    }

    #[test]
    fn injection_shares_the_kernel_half() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        paging
            .map_kernel(data(30), KERNEL_HEAP_START, PAGE, PageAccess::ReadWrite)
            .unwrap();

        let root = paging.new_root().unwrap();
        paging
            .map(root, data(40), USER_CODE_BASE, PAGE, PageAccess::ReadOnly, Privilege::User)
            .unwrap();
        let owned = paging.table_frame_count(root).unwrap();

        // Pretend the CPU walked the window through the kernel root.
        {
            let mut kernel = machine.window.map(machine.kernel_root).unwrap();
            let top = kernel.table()[511];
            kernel.table_mut()[511] = top.with_accessed(true);
        }

        paging.inject_kernel_mappings(root).unwrap();
        assert_eq!(paging.translate(root, KERNEL_HEAP_START).unwrap(), Some(data(30)));
        assert_eq!(
            paging.translate(root, TEMPORARY_WINDOW_BASE).unwrap(),
            Some(machine.kernel_root)
        );
        assert_eq!(paging.translate(root, USER_CODE_BASE).unwrap(), Some(data(40)));

        let copied = machine.window.map(root).unwrap().table()[511];
        assert!(!copied.accessed());

        let before_delete = machine.frames.used();
        paging.delete_address_space(root).unwrap();
        assert_eq!(machine.frames.used(), before_delete - owned);
        assert_eq!(paging.translate(machine.kernel_root, KERNEL_HEAP_START).unwrap(), Some(data(30)));
    }

    #[test]
    fn injection_never_overwrites_process_entries() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        paging
            .map_kernel(data(30), KERNEL_HEAP_START, PAGE, PageAccess::ReadWrite)
            .unwrap();

        let root = paging.new_root().unwrap();
        let own = KERNEL_HEAP_START + 5 * PAGE;
        paging
            .map(root, data(40), own, PAGE, PageAccess::ReadOnly, Privilege::Kernel)
            .unwrap();

        paging.inject_kernel_mappings(root).unwrap();
        assert_eq!(paging.translate(root, own).unwrap(), Some(data(40)));
        assert_eq!(paging.translate(root, KERNEL_HEAP_START).unwrap(), Some(data(30)));
        assert_eq!(paging.translate(machine.kernel_root, own).unwrap(), None);
    }

    #[test]
    fn shared_upper_tables_survive_kernel_unmap() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        let before = machine.frames.used();
        paging
            .map_kernel(data(30), KERNEL_HEAP_START, PAGE, PageAccess::ReadWrite)
            .unwrap();
        paging.unmap_kernel(KERNEL_HEAP_START, PAGE).unwrap();

        assert_eq!(machine.frames.used(), before + 1);
        let root_entry = machine.window.map(machine.kernel_root).unwrap().table()[384];
        assert!(root_entry.present());
    }

    #[test]
    fn flags_change_on_present_pages_only() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        let root = paging.new_root().unwrap();
        paging
            .map(root, data(40), USER_CODE_BASE, 2 * PAGE, PageAccess::ReadWrite, Privilege::Kernel)
            .unwrap();

        let writable = PageFlags::new().with_writable(true);
        assert_eq!(paging.clear_flags(root, USER_CODE_BASE, 4 * PAGE, writable), Ok(2));
        assert!(!paging.entry(root, USER_CODE_BASE).unwrap().unwrap().writable());

        let user = PageFlags::new().with_user(true);
        assert_eq!(paging.set_flags(root, USER_CODE_BASE, PAGE, user), Ok(1));
        let top = machine.window.map(root).unwrap().table()[0];
        assert!(top.user(), "intermediate entries follow the user bit");
        assert_eq!(paging.translate(root, USER_CODE_BASE + PAGE).unwrap(), Some(data(41)));
    }
}

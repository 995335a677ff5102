//! # Kernel Heap
//!
//! A growable heap made of segments laid out back to back between `start`
//! and `end`:
//!
//! ```text
//! start                                                             end
//! +--------+--------------+--------+-------------+--------+----------+
//! | header | data (size)  | header | data (size) | header | data ... |
//! +--------+--------------+--------+-------------+--------+----------+
//! ```
//!
//! Each [`SegmentHeader`] links to its neighbours, so `next` always equals
//! the end of the current segment's data. Two free segments are never
//! adjacent. When no free segment fits, the heap asks its [`HeapGrowth`]
//! backend to back more pages at `end` and retries, up to the ceiling.
//!
//! Aligned allocations carve an aligned segment out of a larger one and keep
//! the unaligned front part as a *padding* segment, which is released
//! together with the aligned one.
//!
//! Every header is checked on the way; a broken link, a size running past
//! `end` or a missing magic value means the heap is corrupt and panics.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull, null_mut};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, MapError, PageAccess, PagingEngine, WindowBackend};
use log::{debug, info, trace};

/// Allocation granularity and minimum data size.
pub const GRANULE: usize = 8;

/// Bytes taken by a segment header.
pub const HEADER: usize = size_of::<SegmentHeader>();

const SEGMENT_MAGIC: u32 = 0x5345_474D;

#[bitfield(u64)]
struct SegmentFlags {
    free: bool,
    /// Front part of an aligned allocation.
    padding: bool,
    #[bits(30)]
    _rsvd: u32,
    magic: u32,
}

/// Header in front of every segment's data.
#[repr(C)]
pub struct SegmentHeader {
    prev: *mut SegmentHeader,
    next: *mut SegmentHeader,
    /// Data bytes following the header.
    size: usize,
    flags: SegmentFlags,
}

const _: () = assert!(HEADER == 32);

impl SegmentHeader {
    fn data(this: *mut Self) -> usize {
        this as usize + HEADER
    }

    fn end(this: *mut Self) -> usize {
        Self::data(this) + unsafe { (*this).size }
    }
}

/// An allocation: points at the segment's data.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SegmentHandle(NonNull<u8>);

impl SegmentHandle {
    /// # Safety
    /// `ptr` must have been returned by a [`Heap`] allocation.
    #[must_use]
    pub const unsafe fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    fn header(self) -> *mut SegmentHeader {
        self.0.as_ptr().wrapping_sub(HEADER).cast()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("growth would pass the heap ceiling")]
    CeilingReached,
    #[error("out of physical frames for the heap")]
    OutOfFrames,
    #[error("failed to map heap pages: {0}")]
    Map(#[from] MapError),
}

/// Backs heap pages with memory.
pub trait HeapGrowth {
    /// Make `pages` pages from `at` readable and writable.
    ///
    /// # Errors
    /// Nothing may stay mapped when this fails.
    fn grow(&mut self, at: VirtualAddress, pages: u64) -> Result<(), HeapError>;
}

/// Grows the heap with frames mapped into the kernel tree.
pub struct KernelHeapGrowth<'a, B: WindowBackend, F: FrameAlloc + ?Sized> {
    paging: PagingEngine<'a, B, F>,
}

impl<'a, B: WindowBackend, F: FrameAlloc + ?Sized> KernelHeapGrowth<'a, B, F> {
    #[must_use]
    pub const fn new(paging: PagingEngine<'a, B, F>) -> Self {
        Self { paging }
    }
}

impl<B: WindowBackend, F: FrameAlloc + ?Sized> HeapGrowth for KernelHeapGrowth<'_, B, F> {
    fn grow(&mut self, at: VirtualAddress, pages: u64) -> Result<(), HeapError> {
        let frames = self.paging.frames();
        let base = frames.request_frames(pages).ok_or(HeapError::OutOfFrames)?;
        if let Err(e) = self.paging.map_kernel(base, at, pages * FRAME_SIZE, PageAccess::ReadWrite) {
            frames.free_frames(base, pages);
            return Err(e.into());
        }
        trace!("heap grew by {pages} pages at {at:?} backed by {base:?}");
        Ok(())
    }
}

/// Counters over the segment list.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub segments: usize,
    pub free_segments: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    /// Current end of the heap.
    pub end: usize,
}

/// The segment-list heap.
pub struct Heap<G: HeapGrowth> {
    start: usize,
    end: usize,
    ceiling: usize,
    head: *mut SegmentHeader,
    tail: *mut SegmentHeader,
    growth: G,
}

// Safety: the segments are only reached through the heap's `&mut self`.
unsafe impl<G: HeapGrowth + Send> Send for Heap<G> {}

impl<G: HeapGrowth> Heap<G> {
    /// A heap that will occupy `[start, ceiling)` once initialised.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(start: VirtualAddress, ceiling: VirtualAddress, growth: G) -> Self {
        Self {
            start: start.as_u64() as usize,
            end: start.as_u64() as usize,
            ceiling: ceiling.as_u64() as usize,
            head: null_mut(),
            tail: null_mut(),
            growth,
        }
    }

    /// Back the first `pages` pages and make them one free segment.
    ///
    /// # Errors
    /// If growth fails or the ceiling leaves no room.
    pub fn init(&mut self, pages: u64) -> Result<(), HeapError> {
        self.grow(pages.max(1))?;
        info!(
            "kernel heap at {:#x}, {} KiB",
            self.start,
            (self.end - self.start) / 1024
        );
        Ok(())
    }

    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    pub const fn growth(&self) -> &G {
        &self.growth
    }

    /// First fit for `size` bytes, growing the heap on a miss.
    pub fn allocate(&mut self, size: usize) -> Option<SegmentHandle> {
        let size = round_size(size)?;
        let segment = self.find_or_grow(size)?;
        unsafe {
            (*segment).flags.set_free(false);
            self.split(segment, size);
        }
        Some(SegmentHandle(unsafe { NonNull::new_unchecked(SegmentHeader::data(segment) as *mut u8) }))
    }

    /// `size` bytes whose address is a multiple of `alignment`.
    ///
    /// # Panics
    /// If `alignment` is not a power of two.
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate_aligned(&mut self, alignment: usize, size: usize) -> Option<SegmentHandle> {
        assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
        if alignment <= GRANULE {
            return self.allocate(size);
        }
        let size = round_size(size)?;
        let raw_size = size.checked_add(alignment)?.checked_add(2 * HEADER)?;
        let raw = self.find_or_grow(raw_size)?;

        unsafe {
            let raw_end = SegmentHeader::end(raw);
            let aligned_data = align_up((SegmentHeader::data(raw) + HEADER) as u64, alignment as u64) as usize;
            let aligned = (aligned_data - HEADER) as *mut SegmentHeader;

            aligned.write(SegmentHeader {
                prev: raw,
                next: (*raw).next,
                size: raw_end - aligned_data,
                flags: SegmentFlags::new().with_magic(SEGMENT_MAGIC),
            });
            if (*raw).next.is_null() {
                self.tail = aligned;
            } else {
                (*(*raw).next).prev = aligned;
            }
            (*raw).next = aligned;
            (*raw).size = aligned as usize - SegmentHeader::data(raw);
            (*raw).flags = (*raw).flags.with_free(false).with_padding(true);

            self.split(aligned, size);
            Some(SegmentHandle(NonNull::new_unchecked(aligned_data as *mut u8)))
        }
    }

    /// Release an allocation and merge it with its free neighbours.
    ///
    /// # Panics
    /// On a double free or if `handle` does not lead to a valid header.
    pub fn free(&mut self, handle: SegmentHandle) {
        let segment = handle.header();
        self.validate(segment);
        unsafe {
            assert!(
                !(*segment).flags.free() && !(*segment).flags.padding(),
                "heap: invalid free of segment at {segment:p}"
            );
            (*segment).flags.set_free(true);
            self.merge_forward(segment);

            let prev = (*segment).prev;
            if !prev.is_null() && (*prev).flags.padding() {
                (*prev).flags = (*prev).flags.with_free(true).with_padding(false);
                self.merge_forward(prev);
                self.merge_backward(prev);
            } else {
                self.merge_backward(segment);
            }
        }
    }

    /// Walk every segment, validating as it goes.
    ///
    /// # Panics
    /// If the heap is corrupt.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            end: self.end,
            ..HeapStats::default()
        };
        let mut current = self.head;
        while !current.is_null() {
            self.validate(current);
            let segment = unsafe { &*current };
            stats.segments += 1;
            if segment.flags.free() {
                stats.free_segments += 1;
                stats.free_bytes += segment.size;
            } else {
                stats.used_bytes += segment.size;
            }
            current = segment.next;
        }
        stats
    }

    fn find_or_grow(&mut self, size: usize) -> Option<*mut SegmentHeader> {
        if let Some(found) = self.first_fit(size) {
            return Some(found);
        }
        let tail_free = if self.tail.is_null() || unsafe { !(*self.tail).flags.free() } {
            0
        } else {
            unsafe { (*self.tail).size + HEADER }
        };
        let missing = (size + HEADER).saturating_sub(tail_free);
        let pages = (missing as u64).div_ceil(FRAME_SIZE);
        if let Err(e) = self.grow(pages) {
            debug!("heap cannot grow by {pages} pages: {e}");
            return None;
        }
        self.first_fit(size)
    }

    fn first_fit(&self, size: usize) -> Option<*mut SegmentHeader> {
        let mut current = self.head;
        while !current.is_null() {
            self.validate(current);
            let segment = unsafe { &*current };
            if segment.flags.free() && segment.size >= size {
                return Some(current);
            }
            current = segment.next;
        }
        None
    }

    #[allow(clippy::cast_possible_truncation)]
    fn grow(&mut self, pages: u64) -> Result<(), HeapError> {
        let bytes = (pages * FRAME_SIZE) as usize;
        if self.end.checked_add(bytes).is_none_or(|end| end > self.ceiling) {
            return Err(HeapError::CeilingReached);
        }
        self.growth.grow(VirtualAddress::new(self.end as u64), pages)?;

        let at = self.end as *mut SegmentHeader;
        self.end += bytes;
        unsafe {
            if !self.tail.is_null() && (*self.tail).flags.free() {
                (*self.tail).size += bytes;
                return Ok(());
            }
            at.write(SegmentHeader {
                prev: self.tail,
                next: null_mut(),
                size: bytes - HEADER,
                flags: SegmentFlags::new().with_free(true).with_magic(SEGMENT_MAGIC),
            });
            if self.tail.is_null() {
                self.head = at;
            } else {
                (*self.tail).next = at;
            }
        }
        self.tail = at;
        Ok(())
    }

    /// Shrink a segment to `size` and turn the rest into a free segment,
    /// unless the rest could not hold a header plus one granule.
    unsafe fn split(&mut self, segment: *mut SegmentHeader, size: usize) {
        unsafe {
            if (*segment).size < size + HEADER + GRANULE {
                return;
            }
            let rest = (SegmentHeader::data(segment) + size) as *mut SegmentHeader;
            rest.write(SegmentHeader {
                prev: segment,
                next: (*segment).next,
                size: (*segment).size - size - HEADER,
                flags: SegmentFlags::new().with_free(true).with_magic(SEGMENT_MAGIC),
            });
            if (*segment).next.is_null() {
                self.tail = rest;
            } else {
                (*(*segment).next).prev = rest;
            }
            (*segment).next = rest;
            (*segment).size = size;
            self.merge_forward(rest);
        }
    }

    /// Absorb the next segment if it is free.
    unsafe fn merge_forward(&mut self, segment: *mut SegmentHeader) {
        unsafe {
            let next = (*segment).next;
            if next.is_null() || !(*next).flags.free() || !(*segment).flags.free() {
                return;
            }
            self.validate(next);
            (*segment).size += HEADER + (*next).size;
            (*segment).next = (*next).next;
            if (*next).next.is_null() {
                self.tail = segment;
            } else {
                (*(*next).next).prev = segment;
            }
            // Stale headers must not pass validation.
            (*next).flags = SegmentFlags::new();
        }
    }

    unsafe fn merge_backward(&mut self, segment: *mut SegmentHeader) {
        unsafe {
            let prev = (*segment).prev;
            if !prev.is_null() && (*prev).flags.free() {
                self.merge_forward(prev);
            }
        }
    }

    fn validate(&self, segment: *mut SegmentHeader) {
        let at = segment as usize;
        assert!(
            at >= self.start && at + HEADER <= self.end && at % GRANULE == 0,
            "heap: segment {segment:p} outside [{:#x}, {:#x})",
            self.start,
            self.end
        );
        let header = unsafe { &*segment };
        assert!(
            header.flags.magic() == SEGMENT_MAGIC,
            "heap: segment {segment:p} has no valid header"
        );
        let end = SegmentHeader::data(segment).checked_add(header.size);
        assert!(
            end.is_some_and(|end| end <= self.end),
            "heap: segment {segment:p} of {} bytes runs past the heap end",
            header.size
        );
        if header.next.is_null() {
            assert!(ptr::eq(segment, self.tail), "heap: segment {segment:p} ends the list early");
        } else {
            assert!(
                header.next as usize == SegmentHeader::end(segment),
                "heap: segment {segment:p} links to a non-adjacent {:p}",
                header.next
            );
            assert!(
                ptr::eq(unsafe { (*header.next).prev }, segment),
                "heap: segment {:p} does not link back to {segment:p}",
                header.next
            );
        }
        if header.prev.is_null() {
            assert!(ptr::eq(segment, self.head), "heap: segment {segment:p} has no predecessor");
        }
    }
}

fn round_size(size: usize) -> Option<usize> {
    size.max(GRANULE).checked_next_multiple_of(GRANULE)
}

/// The heap behind a lock, usable as the global allocator once initialised.
pub struct LockedHeap<G: HeapGrowth> {
    heap: SpinLock<Option<Heap<G>>>,
}

impl<G: HeapGrowth> LockedHeap<G> {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            heap: SpinLock::new(None),
        }
    }

    /// Install an initialised heap.
    pub fn init(&self, heap: Heap<G>) {
        self.heap.with_lock(|slot| *slot = Some(heap));
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heap.with_lock(|slot| slot.is_some())
    }

    /// Run `f` on the heap, or return `None` before [`init`](Self::init).
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<G>) -> R) -> Option<R> {
        self.heap.with_lock(|slot| slot.as_mut().map(f))
    }
}

unsafe impl<G: HeapGrowth + Send> GlobalAlloc for LockedHeap<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_heap(|heap| heap.allocate_aligned(layout.align(), layout.size()))
            .flatten()
            .map_or(null_mut(), SegmentHandle::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        self.with_heap(|heap| heap.free(SegmentHandle(ptr)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::testing::SimulatedMachine;

    /// Stands in for the page tables: hands out pages of a leaked buffer.
    struct BufferGrowth {
        pages: u64,
    }

    impl HeapGrowth for BufferGrowth {
        fn grow(&mut self, _at: VirtualAddress, pages: u64) -> Result<(), HeapError> {
            self.pages += pages;
            Ok(())
        }
    }

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    fn heap(pages: usize, initial: u64) -> Heap<BufferGrowth> {
        let buffer: &'static mut [Page] = Vec::from_iter((0..pages).map(|_| Page([0; 4096]))).leak();
        let start = buffer.as_mut_ptr() as u64;
        let mut heap = Heap::new(
            VirtualAddress::new(start),
            VirtualAddress::new(start + pages as u64 * FRAME_SIZE),
            BufferGrowth { pages: 0 },
        );
        heap.init(initial).unwrap();
        heap
    }

    #[test]
    fn allocations_are_carved_in_order() {
        let mut heap = heap(4, 1);
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(1).unwrap();
        assert_eq!(a.as_ptr() as usize, heap.start() + HEADER);
        assert_eq!(b.as_ptr() as usize, heap.start() + HEADER + 104 + HEADER);

        let stats = heap.stats();
        assert_eq!(stats.segments, 3);
        assert_eq!(stats.used_bytes, 104 + 8);
        assert_eq!(stats.free_bytes, 4096 - 3 * HEADER - 112);
    }

    #[test]
    fn freeing_coalesces_without_growth() {
        let mut heap = heap(4, 1);
        let before = heap.stats();

        let a = heap.allocate(200).unwrap();
        let b = heap.allocate(300).unwrap();
        let c = heap.allocate(400).unwrap();
        heap.free(b);
        heap.free(a);
        heap.free(c);

        assert_eq!(heap.stats(), before);
        assert_eq!(heap.stats().segments, 1);
        assert_eq!(heap.growth().pages, 1);
    }

    #[test]
    fn adjacent_free_blocks_serve_their_combined_size() {
        for reverse in [false, true] {
            let mut heap = heap(4, 1);
            let a = heap.allocate(256).unwrap();
            let b = heap.allocate(512).unwrap();
            let _fence = heap.allocate(64).unwrap();
            if reverse {
                heap.free(b);
                heap.free(a);
            } else {
                heap.free(a);
                heap.free(b);
            }

            let merged = heap.allocate(256 + 512 + HEADER).unwrap();
            assert_eq!(merged.as_ptr(), a.as_ptr());
            assert_eq!(heap.growth().pages, 1);
        }
    }

    #[test]
    fn small_remainders_stay_in_the_allocation() {
        let mut heap = heap(1, 1);
        let whole = 4096 - HEADER;
        let a = heap.allocate(whole - HEADER - 4).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.used_bytes, whole);
        heap.free(a);
        assert_eq!(heap.stats().free_bytes, whole);
    }

    #[test]
    fn misses_grow_the_heap() {
        let mut heap = heap(8, 1);
        let big = heap.allocate(3 * 4096).unwrap();
        assert_eq!(heap.growth().pages, 4);
        assert_eq!(heap.end() - heap.start(), 4 * 4096);
        unsafe { big.as_ptr().write_bytes(0xAB, 3 * 4096) };

        heap.free(big);
        let stats = heap.stats();
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.free_bytes, 4 * 4096 - HEADER);
    }

    #[test]
    fn growth_stops_at_the_ceiling() {
        let mut heap = heap(2, 1);
        assert!(heap.allocate(2 * 4096).is_none());
        assert!(heap.allocate(4000).is_some());
    }

    #[test]
    fn aligned_allocation_keeps_padding_in_front() {
        let mut heap = heap(4, 1);
        let before = heap.stats();

        let aligned = heap.allocate_aligned(64, 100).unwrap();
        assert_eq!(aligned.as_ptr() as usize % 64, 0);
        unsafe { aligned.as_ptr().write_bytes(0x5A, 100) };

        let stats = heap.stats();
        assert_eq!(stats.segments, 3, "padding, aligned, rest");
        assert_eq!(stats.free_segments, 1);

        heap.free(aligned);
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn aligned_and_plain_allocations_interleave() {
        let mut heap = heap(8, 1);
        let before = heap.stats();

        let a = heap.allocate(24).unwrap();
        let b = heap.allocate_aligned(4096, 512).unwrap();
        let c = heap.allocate(40).unwrap();
        assert_eq!(b.as_ptr() as usize % 4096, 0);

        heap.free(a);
        heap.free(c);
        heap.free(b);
        let after = heap.stats();
        assert_eq!(after.segments, 1);
        assert_eq!(after.free_bytes, after.end - heap.start() - HEADER);
        assert!(after.end >= before.end);
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn double_free_panics() {
        let mut heap = heap(2, 1);
        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();
        heap.free(a);
        heap.free(a);
    }

    #[test]
    #[should_panic(expected = "heap: segment")]
    fn corrupted_header_panics() {
        let mut heap = heap(2, 1);
        let a = heap.allocate(64).unwrap();
        // Overrun into the next segment's header.
        unsafe { a.as_ptr().write_bytes(0xFF, 64 + HEADER) };
        let _ = heap.allocate(64);
    }

    #[test]
    fn global_alloc_respects_layout() {
        let locked = LockedHeap::empty();
        assert!(unsafe { locked.alloc(Layout::from_size_align(8, 8).unwrap()) }.is_null());
        locked.init(heap(4, 1));

        let layouts = [(16, 8), (100, 32), (7, 1), (256, 256)];
        let blocks: Vec<_> = layouts
            .iter()
            .map(|&(size, align)| {
                let layout = Layout::from_size_align(size, align).unwrap();
                let ptr = unsafe { locked.alloc(layout) };
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % align, 0);
                (ptr, layout)
            })
            .collect();
        for (ptr, layout) in blocks {
            unsafe { locked.dealloc(ptr, layout) };
        }
        assert_eq!(locked.with_heap(|h| h.stats().segments), Some(1));
    }

    #[test]
    fn kernel_growth_maps_fresh_frames() {
        let machine = SimulatedMachine::new(64);
        let paging = machine.paging();
        let mut growth = KernelHeapGrowth::new(paging);
        let at = kernel_vmem::info::KERNEL_HEAP_START;

        growth.grow(at, 2).unwrap();
        let first = paging.translate(machine.kernel_root, at).unwrap().unwrap();
        let second = paging.translate(machine.kernel_root, at + FRAME_SIZE).unwrap().unwrap();
        assert_eq!(second, first + FRAME_SIZE);
        assert!(machine.frames.is_used(first));

        // Overlapping growth is rejected and leaves no frames behind.
        let used = machine.frames.used();
        assert!(matches!(growth.grow(at, 1), Err(HeapError::Map(MapError::AlreadyMapped(_)))));
        assert_eq!(machine.frames.used(), used);
    }
}

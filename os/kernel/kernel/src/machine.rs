//! Bare-metal bring-up: the statics behind the frame allocator, the
//! temporary window and the global allocator.

use crate::Kernel;
use crate::boot::{BootError, init_logging, relocate_frames, seed_frames};
use core::ptr::NonNull;
use kernel_alloc::{BootstrapArena, FrameAllocator, FrameBitmapAllocator, Heap, KernelHeapGrowth, LockedHeap};
use kernel_info::boot::BootInfo;
use kernel_info::config::KernelConfig;
use kernel_info::memory::{KERNEL_HEAP_CEILING, KERNEL_HEAP_START, TEMPORARY_WINDOW_BASE, TEMPORARY_WINDOW_FIRST_FREE_SLOT};
use kernel_sync::StaticCell;
use kernel_vmem::{MmuWindow, PageTable, PagingEngine, TemporaryWindow};
use log::{LevelFilter, info, warn};

/// Words of bootstrap bitmap in the kernel image; enough for 512 MiB.
const BOOTSTRAP_WORDS: usize = 2048;

static ARENA: BootstrapArena<BOOTSTRAP_WORDS> = BootstrapArena::new();
static FRAMES: FrameAllocator = FrameAllocator::new(FrameBitmapAllocator::empty());
static WINDOW: StaticCell<TemporaryWindow<MmuWindow>> = StaticCell::new();

#[global_allocator]
static HEAP: LockedHeap<KernelHeapGrowth<'static, MmuWindow, FrameAllocator>> = LockedHeap::empty();

/// Take over memory from the boot loader and spawn its modules.
///
/// # Safety
/// `info` must describe the running machine: `kernel_root` is loaded in
/// `CR3` and `window_table_virt` maps `window_table` read-write. Call once,
/// with interrupts disabled.
///
/// # Errors
/// A second call, an invalid `config`, or running out of memory before the
/// heap is up.
pub unsafe fn boot(info: &BootInfo<'_>, config: KernelConfig) -> Result<Kernel<'static, MmuWindow>, BootError> {
    init_logging(LevelFilter::Debug);
    config.validate()?;
    seed_frames(&FRAMES, &ARENA, info)?;

    let table = NonNull::new(info.window_table_virt.as_mut_ptr::<PageTable>()).ok_or(BootError::WindowTableMissing)?;
    // Safety: the caller guarantees the window table mapping.
    let window = unsafe {
        TemporaryWindow::new(
            MmuWindow,
            TEMPORARY_WINDOW_BASE,
            table,
            TEMPORARY_WINDOW_FIRST_FREE_SLOT,
        )
    };
    let window = WINDOW.put(window).map_err(|_| BootError::AlreadyBooted)?;
    let paging = PagingEngine::new(window, &FRAMES, info.kernel_root);

    let mut heap = Heap::new(KERNEL_HEAP_START, KERNEL_HEAP_CEILING, KernelHeapGrowth::new(paging));
    heap.init(config.initial_heap_pages)?;
    HEAP.init(heap);
    relocate_frames(&FRAMES, info)?;

    let mut kernel = Kernel::new(paging, config)?;
    for module in info.modules {
        match kernel.spawn_module(module) {
            Ok(pid) => info!("boot module {} is process {pid}", module.name),
            Err(e) => warn!("boot module {} not started: {e}", module.name),
        }
    }
    Ok(kernel)
}

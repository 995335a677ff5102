//! # Kernel Boot Information
//!
//! What the boot loader leaves behind for the memory manager: a memory map,
//! a bootstrap frame bitmap it used while loading, the root table it switched
//! to, the leaf table backing the temporary window and the executable images
//! it loaded into physical memory.

use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, VirtualAddress};

/// Type tag of a physical memory extent.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM.
    Usable = 1,
    /// Firmware or hardware reserved.
    Reserved = 2,
    /// ACPI tables, reclaimable once parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// Defective RAM.
    BadMemory = 5,
}

/// A type-tagged extent of the physical memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub len: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn usable(start: u64, len: u64) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            len,
            kind: MemoryRegionKind::Usable,
        }
    }

    /// One past the last byte of the region.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.len)
    }
}

/// An executable image the boot loader placed in physical memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootModule<'a> {
    /// Path or command line the module was registered under.
    pub name: &'a str,
    pub base: PhysicalAddress,
    pub size: u64,
}

/// Everything the memory manager needs to take over from the boot loader.
#[derive(Debug, Copy, Clone)]
pub struct BootInfo<'a> {
    /// Physical memory map.
    pub memory_map: &'a [MemoryRegion],

    /// One bit per 4 KiB frame, 1 = in use. Frames beyond its end are
    /// considered used until the allocator is relocated.
    pub bootstrap_bitmap: &'a [u8],

    /// Frames backing `bootstrap_bitmap`, or `None` if it lives in the
    /// kernel image. Released once the bitmap has been relocated.
    pub bootstrap_bitmap_frames: Option<(PhysicalAddress, u64)>,

    /// Root table currently loaded in `CR3`.
    pub kernel_root: PhysicalAddress,

    /// Leaf table reserved for temporary mappings.
    pub window_table: PhysicalAddress,

    /// Where `window_table` itself is readable and writable.
    pub window_table_virt: VirtualAddress,

    /// Loaded executable images.
    pub modules: &'a [BootModule<'a>],
}

impl BootInfo<'_> {
    /// Highest physical address covered by a usable region.
    #[must_use]
    pub fn usable_memory_end(&self) -> PhysicalAddress {
        self.memory_map
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
            .map(MemoryRegion::end)
            .max()
            .unwrap_or_default()
    }

    /// Number of frames needed to track all usable memory.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.usable_memory_end().as_u64().div_ceil(FRAME_SIZE)
    }

    /// Look up a module by name.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&BootModule<'_>> {
        self.modules.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_end_ignores_reserved_regions() {
        let map = [
            MemoryRegion::usable(0x1000, 0x9_F000),
            MemoryRegion {
                start: PhysicalAddress::new(0xF000_0000),
                len: 0x1000,
                kind: MemoryRegionKind::Reserved,
            },
            MemoryRegion::usable(0x10_0000, 0x70_0000),
        ];
        let info = BootInfo {
            memory_map: &map,
            bootstrap_bitmap: &[],
            bootstrap_bitmap_frames: None,
            kernel_root: PhysicalAddress::new(0x1000),
            window_table: PhysicalAddress::new(0x2000),
            window_table_virt: VirtualAddress::new(0xFFFF_FFFF_8000_1000),
            modules: &[],
        };
        assert_eq!(info.usable_memory_end().as_u64(), 0x80_0000);
        assert_eq!(info.frame_count(), 0x800);
    }
}

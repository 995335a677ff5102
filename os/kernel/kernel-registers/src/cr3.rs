use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3: root table base register (PCID disabled).
#[bitfield(u64)]
pub struct Cr3 {
    #[bits(3)]
    _rsvd0: u8,

    /// Page-level write-through for root table accesses.
    pub pwt: bool,

    /// Page-level cache disable for root table accesses.
    pub pcd: bool,

    #[bits(7)]
    _rsvd1: u8,

    /// Root table frame number (physical address >> 12).
    #[bits(40)]
    root_frame: u64,

    #[bits(12)]
    _rsvd2: u16,
}

impl Cr3 {
    /// `CR3` value selecting the root table at `root`, write-back cached.
    #[must_use]
    pub fn for_root(root: PhysicalAddress) -> Self {
        debug_assert!(root.is_frame_aligned(), "root table must be 4K-aligned");
        Self::new().with_root_frame(root.as_u64() >> 12)
    }

    /// Physical address of the root table.
    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_frame() << 12)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

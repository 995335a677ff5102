//! The processor as the scheduler sees it.

use crate::tss::Tss64;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_proc::Cpu;
use kernel_registers::Cr3;

/// Loads `CR3` and the TSS ring-0 stack on dispatch.
pub struct MachineCpu<'t> {
    tss: &'t mut Tss64,
    cr3: Cr3,
    /// Top of the stack in the kernel half that belongs to no process.
    kernel_owned_stack: VirtualAddress,
}

impl<'t> MachineCpu<'t> {
    /// `root` is the address space currently loaded, `kernel_owned_stack`
    /// the top of a stack mapped in every tree.
    pub fn new(tss: &'t mut Tss64, root: PhysicalAddress, kernel_owned_stack: VirtualAddress) -> Self {
        Self {
            tss,
            cr3: Cr3::for_root(root),
            kernel_owned_stack,
        }
    }

    /// Adopt the address space currently loaded in `CR3`.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn from_hardware(tss: &'t mut Tss64, kernel_owned_stack: VirtualAddress) -> Self {
        use kernel_registers::LoadRegisterUnsafe;
        // Safety: the kernel runs in ring 0.
        let cr3 = unsafe { Cr3::load_unsafe() };
        Self {
            tss,
            cr3,
            kernel_owned_stack,
        }
    }

    /// Root table of the active address space.
    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        self.cr3.root()
    }

    #[must_use]
    pub const fn kernel_stack(&self) -> VirtualAddress {
        self.tss.rsp0()
    }
}

impl Cpu for MachineCpu<'_> {
    fn switch_address_space(&mut self, root: PhysicalAddress) {
        if self.cr3.root() == root {
            return;
        }
        self.cr3 = Cr3::for_root(root);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            use kernel_registers::StoreRegisterUnsafe;
            // Safety: the scheduler only dispatches roots that carry the
            // kernel mappings.
            unsafe { self.cr3.store_unsafe() };
        }
    }

    fn set_kernel_stack(&mut self, top: VirtualAddress) {
        self.tss.set_rsp0(top);
    }

    /// Ring-0 entries land on the kernel-owned stack until the next
    /// dispatch; the trap exit path unwinds onto `rsp0`.
    fn switch_to_kernel_stack(&mut self) {
        self.tss.set_rsp0(self.kernel_owned_stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNED_STACK: VirtualAddress = VirtualAddress::new(0xFFFF_FFFF_8010_0000);

    #[test]
    fn dispatch_updates_cr3_and_rsp0() {
        let mut tss = Tss64::new();
        let mut cpu = MachineCpu::new(&mut tss, PhysicalAddress::new(0x1000), OWNED_STACK);
        cpu.switch_address_space(PhysicalAddress::new(0x7000));
        cpu.set_kernel_stack(VirtualAddress::new(0xFFFF_C000_0000_0000));
        assert_eq!(cpu.root(), PhysicalAddress::new(0x7000));
        assert_eq!(cpu.kernel_stack().as_u64(), 0xFFFF_C000_0000_0000);
    }

    #[test]
    fn leaving_a_process_moves_onto_the_owned_stack() {
        let mut tss = Tss64::new();
        let mut cpu = MachineCpu::new(&mut tss, PhysicalAddress::new(0x7000), OWNED_STACK);
        cpu.set_kernel_stack(VirtualAddress::new(0xFFFF_C000_0000_0000));
        cpu.switch_to_kernel_stack();
        cpu.switch_address_space(PhysicalAddress::new(0x1000));
        assert_eq!(cpu.kernel_stack(), OWNED_STACK);
        assert_eq!(cpu.root(), PhysicalAddress::new(0x1000));
    }
}

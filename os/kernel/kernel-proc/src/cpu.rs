//! Saved register state and the CPU operations the scheduler needs.

use kernel_info::memory::{
    KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, PROCESS_DEFAULT_RFLAGS, USER_CODE_SELECTOR,
    USER_DATA_SELECTOR,
};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::Privilege;

/// General purpose registers in the order the interrupt stubs push them.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// What `iretq` pops.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct InterruptStack {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// `fxsave` area.
#[repr(C, align(16))]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FpuState(pub [u8; 512]);

impl Default for FpuState {
    fn default() -> Self {
        Self([0; 512])
    }
}

impl core::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FpuState { .. }")
    }
}

/// Everything needed to resume a process.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CpuState {
    pub regs: GeneralRegisters,
    pub stack: InterruptStack,
    pub fpu: FpuState,
}

impl CpuState {
    /// Initial state of a user process.
    #[must_use]
    pub fn user(entry: VirtualAddress, stack: VirtualAddress) -> Self {
        Self {
            stack: InterruptStack {
                rip: entry.as_u64(),
                cs: USER_CODE_SELECTOR,
                rflags: PROCESS_DEFAULT_RFLAGS,
                rsp: stack.as_u64(),
                ss: USER_DATA_SELECTOR,
            },
            ..Self::default()
        }
    }

    /// State of code running on a kernel stack.
    #[must_use]
    pub fn kernel(entry: VirtualAddress, stack: VirtualAddress) -> Self {
        Self {
            stack: InterruptStack {
                rip: entry.as_u64(),
                cs: KERNEL_CODE_SELECTOR,
                rflags: PROCESS_DEFAULT_RFLAGS,
                rsp: stack.as_u64(),
                ss: KERNEL_DATA_SELECTOR,
            },
            ..Self::default()
        }
    }

    /// Privilege level the state runs at, from the `CPL` bits of `cs`.
    #[must_use]
    pub const fn privilege(&self) -> Privilege {
        if self.stack.cs & 3 == 3 {
            Privilege::User
        } else {
            Privilege::Kernel
        }
    }
}

/// Hardware side of a context switch.
pub trait Cpu {
    /// Load `root` into `CR3`.
    fn switch_address_space(&mut self, root: PhysicalAddress);

    /// Stack the CPU switches to on the next entry into ring 0 (`TSS.rsp0`).
    fn set_kernel_stack(&mut self, top: VirtualAddress);

    /// Continue on the kernel-owned stack. The kernel stack of the current
    /// process is not touched again, so it can be released.
    fn switch_to_kernel_stack(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_follows_the_code_selector() {
        let user = CpuState::user(VirtualAddress::new(0x40_0000), VirtualAddress::new(0x7000));
        assert_eq!(user.privilege(), Privilege::User);
        assert_eq!(user.stack.rflags, 0x202);
        assert_eq!(user.stack.ss, 0x1B);

        let kernel = CpuState::kernel(VirtualAddress::new(0xFFFF_FFFF_8000_0000), VirtualAddress::new(0x7000));
        assert_eq!(kernel.privilege(), Privilege::Kernel);
    }
}

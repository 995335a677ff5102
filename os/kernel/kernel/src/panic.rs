//! Fatal error reporting.

use core::fmt;
use kernel_proc::{CpuState, Pid};
use kernel_registers::Rflags;

/// Renders a fatal condition with the register state it happened in.
///
/// ```text
/// kernel panic: page fault at 0xffffc00000000000 in kernel mode
/// process 3
/// rax=0000000000000000 rbx=0000000000000000 rcx=0000000000000000 rdx=0000000000000000
/// ...
/// rip=ffffffff80001000 cs=0008 ss=0010 rsp=ffffc00000000000
/// rflags=0000000000000202 [------I--] IOPL=0
/// ```
pub struct PanicReport<'a> {
    message: &'a dyn fmt::Display,
    pid: Option<Pid>,
    state: Option<&'a CpuState>,
}

impl<'a> PanicReport<'a> {
    #[must_use]
    pub const fn new(message: &'a dyn fmt::Display) -> Self {
        Self {
            message,
            pid: None,
            state: None,
        }
    }

    #[must_use]
    pub const fn with_state(mut self, pid: Pid, state: &'a CpuState) -> Self {
        self.pid = Some(pid);
        self.state = Some(state);
        self
    }
}

impl fmt::Display for PanicReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "kernel panic: {}", self.message)?;
        if let Some(pid) = self.pid {
            writeln!(f, "process {pid}")?;
        }
        let Some(state) = self.state else {
            return Ok(());
        };

        let r = &state.regs;
        let rows = [
            [("rax", r.rax), ("rbx", r.rbx), ("rcx", r.rcx), ("rdx", r.rdx)],
            [("rsi", r.rsi), ("rdi", r.rdi), ("rbp", r.rbp), ("r8", r.r8)],
            [("r9", r.r9), ("r10", r.r10), ("r11", r.r11), ("r12", r.r12)],
        ];
        for row in rows {
            let mut sep = "";
            for (name, value) in row {
                write!(f, "{sep}{name}={value:016x}")?;
                sep = " ";
            }
            writeln!(f)?;
        }
        writeln!(f, "r13={:016x} r14={:016x} r15={:016x}", r.r13, r.r14, r.r15)?;

        let s = &state.stack;
        writeln!(f, "rip={:016x} cs={:04x} ss={:04x} rsp={:016x}", s.rip, s.cs, s.ss, s.rsp)?;
        write!(f, "rflags={:016x} {}", s.rflags, Rflags::from_bits(s.rflags))
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    let message = info.message();
    log::error!("{}", PanicReport::new(&message));
    if let Some(location) = info.location() {
        log::error!("at {location}");
    }
    loop {
        // Safety: interrupts stay masked; nothing wakes the CPU again.
        unsafe { core::arch::asm!("cli; hlt", options(nomem, nostack)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn report_lists_registers_and_flags() {
        let mut state = CpuState::user(VirtualAddress::new(0x40_0000), VirtualAddress::new(0x7FFF_FFFF_EFF8));
        state.regs.rax = 0xDEAD;
        state.stack.rflags = 0x246;
        let message = "stack overflow";
        let report = PanicReport::new(&message).with_state(4, &state).to_string();

        let lines: Vec<_> = report.lines().collect();
        assert_eq!(lines[0], "kernel panic: stack overflow");
        assert_eq!(lines[1], "process 4");
        assert!(lines[2].starts_with("rax=000000000000dead rbx="));
        assert_eq!(
            lines[6],
            "rip=0000000000400000 cs=0023 ss=001b rsp=00007fffffffeff8"
        );
        assert_eq!(lines[7], "rflags=0000000000000246 [-P-Z--I--] IOPL=0");
    }

    #[test]
    fn report_without_state_is_one_line() {
        let message = "out of frames";
        assert_eq!(PanicReport::new(&message).to_string(), "kernel panic: out of frames\n");
    }
}

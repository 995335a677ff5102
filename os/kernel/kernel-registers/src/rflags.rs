use bitfield_struct::bitfield;
use core::fmt;

/// RFLAGS as saved in an interrupt frame or a process' CPU state.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    pub carry: bool, // 0
    /// Always 1.
    #[bits(default = true)]
    _fixed1: bool, // 1
    pub parity: bool, // 2
    #[bits(default = false)]
    _rsvd3: bool, // 3
    pub adjust: bool, // 4
    #[bits(default = false)]
    _rsvd5: bool, // 5
    pub zero: bool,      // 6
    pub sign: bool,      // 7
    pub trap: bool,      // 8
    pub interrupt: bool, // 9
    pub direction: bool, // 10
    pub overflow: bool,  // 11
    #[bits(2)]
    pub iopl: u8, // 12-13
    pub nested_task: bool, // 14
    #[bits(default = false)]
    _rsvd15: bool, // 15
    pub resume: bool, // 16
    #[bits(default = false)]
    _rsvd17: bool, // 17
    pub alignment_check: bool, // 18
    pub virtual_interrupt: bool, // 19
    pub virtual_interrupt_pending: bool, // 20
    pub cpuid: bool, // 21
    #[bits(42, default = 0)]
    _rsvd22: u64,
}

impl Rflags {
    /// Flags a freshly created process starts with: only interrupts enabled.
    #[must_use]
    pub const fn process_default() -> Self {
        Self::new().with_interrupt(true)
    }

    /// Read the live register.
    #[cfg(all(feature = "asm", target_arch = "x86_64"))]
    #[must_use]
    pub fn read() -> Self {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        Self::from_bits(r)
    }
}

/// Compact rendering used by panic reports, e.g. `[-P-Z--I--] IOPL=0`.
impl fmt::Display for Rflags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.carry(), 'C'),
            (self.parity(), 'P'),
            (self.adjust(), 'A'),
            (self.zero(), 'Z'),
            (self.sign(), 'S'),
            (self.trap(), 'T'),
            (self.interrupt(), 'I'),
            (self.direction(), 'D'),
            (self.overflow(), 'O'),
        ];
        f.write_str("[")?;
        for (set, c) in flags {
            write!(f, "{}", if set { c } else { '-' })?;
        }
        write!(f, "] IOPL={}", self.iopl())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_default_matches_0x202() {
        assert_eq!(Rflags::process_default().into_bits(), 0x202);
    }

    #[test]
    fn display_lists_set_flags() {
        let flags = Rflags::from_bits(0x246);
        assert_eq!(flags.to_string(), "[-P-Z--I--] IOPL=0");
    }
}

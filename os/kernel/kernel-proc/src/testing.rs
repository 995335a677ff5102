//! Test doubles for the hardware the scheduler drives, and a builder for
//! small ELF images.

use crate::cpu::{Cpu, CpuState};
use crate::scheduler::{TickCallback, TimerError, TimerSource};
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// One request made of a [`RecordingCpu`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CpuEvent {
    AddressSpace(PhysicalAddress),
    KernelStack(VirtualAddress),
    KernelOwnedStack,
}

/// Records what a dispatch asked of the CPU.
#[derive(Debug, Default)]
pub struct RecordingCpu {
    pub roots: Vec<PhysicalAddress>,
    pub kernel_stacks: Vec<VirtualAddress>,
    /// Every request in order.
    pub events: Vec<CpuEvent>,
}

impl RecordingCpu {
    /// Root table of the address space loaded last.
    #[must_use]
    pub fn active_root(&self) -> Option<PhysicalAddress> {
        self.roots.last().copied()
    }
}

impl Cpu for RecordingCpu {
    fn switch_address_space(&mut self, root: PhysicalAddress) {
        self.roots.push(root);
        self.events.push(CpuEvent::AddressSpace(root));
    }

    fn set_kernel_stack(&mut self, top: VirtualAddress) {
        self.kernel_stacks.push(top);
        self.events.push(CpuEvent::KernelStack(top));
    }

    fn switch_to_kernel_stack(&mut self) {
        self.events.push(CpuEvent::KernelOwnedStack);
    }
}

/// A timer that only ticks when told to.
#[derive(Debug, Default)]
pub struct ManualTimer {
    interval_ms: Option<u64>,
    callback: Option<TickCallback>,
}

impl ManualTimer {
    #[must_use]
    pub const fn interval_ms(&self) -> Option<u64> {
        self.interval_ms
    }

    #[must_use]
    pub const fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Run the registered callback on `state`. Returns `false` if there is
    /// none.
    pub fn tick(&self, state: &mut CpuState) -> bool {
        self.callback.map(|callback| callback(state)).is_some()
    }
}

impl TimerSource for ManualTimer {
    fn set_interval(&mut self, ms: u64) -> Result<(), TimerError> {
        if ms == 0 {
            return Err(TimerError::UnsupportedInterval(ms));
        }
        self.interval_ms = Some(ms);
        Ok(())
    }

    fn register_periodic_callback(&mut self, callback: TickCallback) -> Result<(), TimerError> {
        if self.callback.is_some() {
            return Err(TimerError::Busy);
        }
        self.callback = Some(callback);
        Ok(())
    }
}

struct Segment {
    kind: u32,
    flags: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Assembles a static x86-64 ELF executable.
pub struct ElfBuilder {
    entry: u64,
    machine: u16,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    #[must_use]
    pub const fn new(entry: u64) -> Self {
        Self {
            entry,
            machine: 62,
            segments: Vec::new(),
        }
    }

    /// Add a `PT_LOAD` segment of `memsz` bytes at `vaddr` starting with
    /// `data`. Read-only segments are executable.
    #[must_use]
    pub fn segment(mut self, vaddr: u64, data: &[u8], memsz: u64, writable: bool) -> Self {
        let flags = PF_R | if writable { PF_W } else { PF_X };
        self.segments.push(Segment {
            kind: PT_LOAD,
            flags,
            vaddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    /// Request a dynamic loader.
    #[must_use]
    pub fn interpreter(mut self, path: &str) -> Self {
        let mut data = path.as_bytes().to_vec();
        data.push(0);
        let memsz = data.len() as u64;
        self.segments.insert(
            0,
            Segment {
                kind: PT_INTERP,
                flags: PF_R,
                vaddr: 0,
                data,
                memsz,
            },
        );
        self
    }

    #[must_use]
    pub const fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// # Panics
    /// With more than `u16::MAX` segments.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        const EHSIZE: u64 = 64;
        const PHENTSIZE: u64 = 56;

        let phnum = u16::try_from(self.segments.len()).expect("too many segments");
        let mut data_at = EHSIZE + PHENTSIZE * u64::from(phnum);

        let mut image = Vec::new();
        image.extend_from_slice(b"\x7FELF");
        image.extend_from_slice(&[2, 1, 1, 0]);
        image.resize(16, 0);
        image.extend_from_slice(&2u16.to_le_bytes());
        image.extend_from_slice(&self.machine.to_le_bytes());
        image.extend_from_slice(&1u32.to_le_bytes());
        image.extend_from_slice(&self.entry.to_le_bytes());
        image.extend_from_slice(&EHSIZE.to_le_bytes());
        image.extend_from_slice(&0u64.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&64u16.to_le_bytes());
        image.extend_from_slice(&56u16.to_le_bytes());
        image.extend_from_slice(&phnum.to_le_bytes());
        image.extend_from_slice(&[0; 6]);

        for segment in &self.segments {
            let filesz = segment.data.len() as u64;
            image.extend_from_slice(&segment.kind.to_le_bytes());
            image.extend_from_slice(&segment.flags.to_le_bytes());
            image.extend_from_slice(&data_at.to_le_bytes());
            image.extend_from_slice(&segment.vaddr.to_le_bytes());
            image.extend_from_slice(&segment.vaddr.to_le_bytes());
            image.extend_from_slice(&filesz.to_le_bytes());
            image.extend_from_slice(&segment.memsz.to_le_bytes());
            image.extend_from_slice(&0x1000u64.to_le_bytes());
            data_at += filesz;
        }
        for segment in &self.segments {
            image.extend_from_slice(&segment.data);
        }
        image
    }
}

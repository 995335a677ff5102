use crate::cpu::CpuState;
use crate::fd::FdTable;
use alloc::vec::Vec;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{PageAccess, Privilege};

pub type Pid = u64;

/// Lifecycle of a process.
///
/// ```text
/// Building ──► Runnable ◄──► Running ──► Zombie ──► Reclaimed
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessState {
    /// Address space under construction.
    Building,
    /// Queued, waiting for the CPU.
    Runnable,
    /// Dispatched.
    Running,
    /// Terminated; resources released, exit status not yet collected.
    Zombie,
    /// Exit status collected.
    Reclaimed,
}

/// A run of physical frames owned by a process and where it is mapped.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SegmentClaim {
    pub base: PhysicalAddress,
    pub pages: u64,
    pub virt: VirtualAddress,
    pub access: PageAccess,
    pub privilege: Privilege,
}

impl SegmentClaim {
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.pages * FRAME_SIZE
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }

    /// One past the last mapped byte.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.virt.offset(self.len())
    }
}

/// The segment lists of a process.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClaimKind {
    Code,
    Stack,
    KernelStack,
    Heap,
    Args,
}

impl ClaimKind {
    /// Order in which claims are released.
    pub const ALL: [Self; 5] = [Self::Code, Self::Stack, Self::Heap, Self::KernelStack, Self::Args];
}

/// Where things are in a process' address space.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ProcessLayout {
    pub entry: VirtualAddress,
    /// Lowest and one past the highest byte of the loaded image.
    pub image_start: VirtualAddress,
    pub image_end: VirtualAddress,
    pub argc: u64,
    /// User address of `argv[0]`, zero without arguments.
    pub argv: VirtualAddress,
    pub heap_start: VirtualAddress,
    /// Current program break.
    pub program_break: VirtualAddress,
    pub stack_top: VirtualAddress,
    /// Lowest mapped byte of the user stack.
    pub stack_bottom: VirtualAddress,
    pub kernel_stack_top: VirtualAddress,
}

/// A process and everything it owns.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    pub(crate) parent_pid: Pid,
    pub(crate) root: PhysicalAddress,
    pub(crate) state: ProcessState,
    /// State to resume with.
    pub current: CpuState,
    /// Last state captured while running in ring 3.
    pub user_mode: CpuState,
    pub(crate) code: Vec<SegmentClaim>,
    pub(crate) stack: Vec<SegmentClaim>,
    pub(crate) kernel_stack: Vec<SegmentClaim>,
    pub(crate) heap: Vec<SegmentClaim>,
    pub(crate) args: Vec<SegmentClaim>,
    pub fds: FdTable,
    pub(crate) exit_status: Option<i32>,
    pub(crate) layout: ProcessLayout,
}

impl Process {
    pub(crate) fn new(pid: Pid, parent_pid: Pid) -> Self {
        Self {
            pid,
            parent_pid,
            root: PhysicalAddress::zero(),
            state: ProcessState::Building,
            current: CpuState::default(),
            user_mode: CpuState::default(),
            code: Vec::new(),
            stack: Vec::new(),
            kernel_stack: Vec::new(),
            heap: Vec::new(),
            args: Vec::new(),
            fds: FdTable::new(),
            exit_status: None,
            layout: ProcessLayout::default(),
        }
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub const fn parent_pid(&self) -> Pid {
        self.parent_pid
    }

    /// Root table of the address space; zero once destroyed.
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    #[must_use]
    pub const fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    #[must_use]
    pub const fn layout(&self) -> &ProcessLayout {
        &self.layout
    }

    #[must_use]
    pub fn claims(&self, kind: ClaimKind) -> &[SegmentClaim] {
        match kind {
            ClaimKind::Code => &self.code,
            ClaimKind::Stack => &self.stack,
            ClaimKind::KernelStack => &self.kernel_stack,
            ClaimKind::Heap => &self.heap,
            ClaimKind::Args => &self.args,
        }
    }

    pub(crate) fn claims_mut(&mut self, kind: ClaimKind) -> &mut Vec<SegmentClaim> {
        match kind {
            ClaimKind::Code => &mut self.code,
            ClaimKind::Stack => &mut self.stack,
            ClaimKind::KernelStack => &mut self.kernel_stack,
            ClaimKind::Heap => &mut self.heap,
            ClaimKind::Args => &mut self.args,
        }
    }

    /// Frames held by all segment lists.
    #[must_use]
    pub fn claimed_pages(&self) -> u64 {
        ClaimKind::ALL
            .iter()
            .flat_map(|&kind| self.claims(kind))
            .map(|claim| claim.pages)
            .sum()
    }

    /// Whether the page tables and frames have been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.root.is_zero() && self.claimed_pages() == 0
    }
}

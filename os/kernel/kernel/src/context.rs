//! The kernel context: process manager and scheduler behind the entry points
//! the timer, page-fault and system-call handlers call into.

use crate::KernelError;
use crate::panic::PanicReport;
use alloc::format;
use kernel_alloc::FrameAllocator;
use kernel_info::boot::BootModule;
use kernel_info::config::{ConfigError, KernelConfig};
use kernel_memory_addresses::VirtualAddress;
use kernel_proc::{
    Cpu, CpuState, Dispatch, ExecutableSource, ImageSource, Pid, Placement, ProcessDescriptor, ProcessManager,
    Scheduler, TickCallback, TickOutcome, TimerSource,
};
use kernel_vmem::{FrameAlloc, PageAccess, PagingEngine, Privilege, WindowBackend};
use log::{debug, info, warn};

/// Exit status of a process killed by an unresolvable page fault.
pub const KILLED_STATUS: i32 = -1;

/// Result of [`Kernel::page_fault`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The stack was grown; retry the faulting instruction.
    Resolved,
    /// The process was terminated and the next one dispatched.
    Killed(Dispatch),
}

/// Result of [`Kernel::wait`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Wait {
    Reaped { pid: Pid, status: i32 },
    /// Children exist but none has terminated yet.
    Pending,
    NoChildren,
}

pub struct Kernel<'a, B: WindowBackend, F: FrameAlloc + ?Sized = FrameAllocator> {
    manager: ProcessManager<'a, B, F>,
    scheduler: Scheduler,
}

impl<'a, B: WindowBackend, F: FrameAlloc + ?Sized> Kernel<'a, B, F> {
    /// # Errors
    /// `config` is inconsistent.
    pub fn new(paging: PagingEngine<'a, B, F>, config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "kernel core ready: {} ms quantum, {} pages of user stack",
            config.quantum_ms, config.user_stack_pages
        );
        Ok(Self {
            manager: ProcessManager::new(paging, config),
            scheduler: Scheduler::new(&config),
        })
    }

    #[must_use]
    pub const fn manager(&self) -> &ProcessManager<'a, B, F> {
        &self.manager
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub const fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// # Errors
    /// The timer rejected the configured interval or the callback.
    pub fn start_timer<T: TimerSource + ?Sized>(
        &mut self,
        timer: &mut T,
        callback: TickCallback,
    ) -> Result<(), KernelError> {
        Ok(self.scheduler.start(timer, callback)?)
    }

    /// Create a process from `descriptor` and queue it.
    ///
    /// # Errors
    /// See [`ProcessManager::create`].
    pub fn spawn(&mut self, descriptor: &ProcessDescriptor<'_>) -> Result<Pid, KernelError> {
        let pid = self.scheduler.next_pid();
        let process = self.manager.create(descriptor, pid)?;
        self.scheduler.queue(process);
        info!("spawned process {pid}: {}", descriptor.command_line);
        Ok(pid)
    }

    /// Spawn an image the boot loader placed in physical memory.
    ///
    /// # Errors
    /// See [`spawn`](Self::spawn).
    pub fn spawn_module(&mut self, module: &BootModule<'_>) -> Result<Pid, KernelError> {
        let image = ImageSource::Physical {
            base: module.base,
            size: module.size,
        };
        let kind = image.kind(self.manager.paging().window())?;
        self.spawn(&ProcessDescriptor::new(image, kind, module.name))
    }

    /// Switch to the next process.
    ///
    /// # Errors
    /// See [`Scheduler::dispatch`].
    pub fn schedule<C: Cpu + ?Sized>(&mut self, cpu: &mut C) -> Result<Dispatch, KernelError> {
        Ok(self.scheduler.dispatch(cpu, &self.manager)?)
    }

    /// Timer interrupt with the interrupted state in `frame`. Once the
    /// quantum is used up the next process is dispatched and `frame` holds
    /// the state to return to.
    ///
    /// # Errors
    /// See [`schedule`](Self::schedule).
    pub fn timer_tick<C: Cpu + ?Sized>(
        &mut self,
        frame: &mut CpuState,
        cpu: &mut C,
    ) -> Result<Option<Dispatch>, KernelError> {
        match self.scheduler.on_timer_tick(frame) {
            TickOutcome::Continue => Ok(None),
            TickOutcome::Reschedule => self.resume_next(frame, cpu).map(Some),
        }
    }

    /// Give up the rest of the quantum.
    ///
    /// # Errors
    /// See [`schedule`](Self::schedule).
    pub fn yield_now<C: Cpu + ?Sized>(&mut self, frame: &mut CpuState, cpu: &mut C) -> Result<Dispatch, KernelError> {
        self.scheduler.yield_now(frame);
        self.resume_next(frame, cpu)
    }

    /// Terminate the current process with `status` and dispatch the next.
    ///
    /// # Errors
    /// [`KernelError::NoCurrentProcess`], or see [`schedule`](Self::schedule).
    pub fn exit<C: Cpu + ?Sized>(
        &mut self,
        status: i32,
        frame: &mut CpuState,
        cpu: &mut C,
    ) -> Result<Dispatch, KernelError> {
        let pid = self.current_pid()?;
        self.leave_current(cpu);
        self.scheduler.terminate(pid, status, &self.manager)?;
        if status != 0 {
            debug!("process {pid} exited with error status {status}");
        }
        self.resume_next(frame, cpu)
    }

    /// Duplicate the current process, which trapped with `frame`. The child
    /// resumes from the same point with `rax = 0`.
    ///
    /// # Errors
    /// [`KernelError::NoCurrentProcess`], or see [`ProcessManager::clone`].
    pub fn fork(&mut self, frame: &CpuState) -> Result<Pid, KernelError> {
        let pid = self.scheduler.next_pid();
        let parent = self.scheduler.current_mut().ok_or(KernelError::NoCurrentProcess)?;
        parent.user_mode = *frame;
        parent.current = *frame;

        let mut child = self.manager.clone(parent, pid)?;
        child.current.regs.rax = 0;
        child.user_mode.regs.rax = 0;
        self.scheduler.queue(child);
        Ok(pid)
    }

    /// Replace the current process with the program named by the first word
    /// of `command_line`. On failure the caller keeps running untouched.
    ///
    /// # Errors
    /// [`KernelError::NoCurrentProcess`], a missing or invalid executable,
    /// or exhaustion while building the replacement.
    pub fn exec<S, C>(
        &mut self,
        source: &S,
        command_line: &str,
        frame: &mut CpuState,
        cpu: &mut C,
    ) -> Result<Dispatch, KernelError>
    where
        S: ExecutableSource + ?Sized,
        C: Cpu + ?Sized,
    {
        let descriptor = ProcessDescriptor::open(source, self.manager.paging().window(), command_line)?;
        let current = self.scheduler.current().ok_or(KernelError::NoCurrentProcess)?;
        let pid = current.pid();
        let replacement = self.manager.create_replacement(current, &descriptor)?;
        self.leave_current(cpu);
        self.scheduler.replace(pid, replacement, &self.manager)?;
        info!("process {pid} now runs {command_line}");
        self.resume_next(frame, cpu)
    }

    /// Move the current program break by `increment`; returns the old break.
    ///
    /// # Errors
    /// See [`ProcessManager::grow_heap`].
    pub fn sbrk(&mut self, increment: u64) -> Result<VirtualAddress, KernelError> {
        let process = self.scheduler.current_mut().ok_or(KernelError::NoCurrentProcess)?;
        Ok(self.manager.grow_heap(process, increment)?)
    }

    /// # Errors
    /// See [`ProcessManager::map_anonymous`].
    pub fn mmap(&mut self, placement: Placement, size: u64, access: PageAccess) -> Result<VirtualAddress, KernelError> {
        let process = self.scheduler.current_mut().ok_or(KernelError::NoCurrentProcess)?;
        Ok(self.manager.map_anonymous(process, placement, size, access)?)
    }

    /// Page fault at `fault` raised with `frame`. Faults just below the user
    /// stack grow it; any other fault from user mode kills the process.
    ///
    /// # Panics
    /// On faults without a current process, and on kernel-mode faults that
    /// are not stack growth.
    ///
    /// # Errors
    /// See [`exit`](Self::exit).
    pub fn page_fault<C: Cpu + ?Sized>(
        &mut self,
        fault: VirtualAddress,
        frame: &mut CpuState,
        cpu: &mut C,
    ) -> Result<FaultOutcome, KernelError> {
        let Some(process) = self.scheduler.current_mut() else {
            let message = format!("page fault at {fault:?} without a process");
            panic!("{}", PanicReport::new(&message));
        };
        let pid = process.pid();
        let Err(e) = self.manager.grow_stack(process, fault) else {
            return Ok(FaultOutcome::Resolved);
        };

        if frame.privilege() == Privilege::Kernel {
            let message = format!("page fault at {fault:?} in kernel mode: {e}");
            panic!("{}", PanicReport::new(&message).with_state(pid, frame));
        }
        warn!("process {pid} killed: page fault at {fault:?}: {e}");
        self.exit(KILLED_STATUS, frame, cpu).map(FaultOutcome::Killed)
    }

    /// Collect a terminated child of the current process.
    ///
    /// # Errors
    /// [`KernelError::NoCurrentProcess`].
    pub fn wait(&mut self) -> Result<Wait, KernelError> {
        let parent = self.current_pid()?;
        if let Some((pid, status)) = self.scheduler.reap_child(parent) {
            return Ok(Wait::Reaped { pid, status });
        }
        Ok(if self.scheduler.child_count(parent) == 0 {
            Wait::NoChildren
        } else {
            Wait::Pending
        })
    }

    fn current_pid(&self) -> Result<Pid, KernelError> {
        self.scheduler
            .current()
            .map(kernel_proc::Process::pid)
            .ok_or(KernelError::NoCurrentProcess)
    }

    /// Move off the current process's kernel stack and address space so both
    /// can be released.
    fn leave_current<C: Cpu + ?Sized>(&self, cpu: &mut C) {
        cpu.switch_to_kernel_stack();
        cpu.switch_address_space(self.manager.paging().kernel_root());
    }

    fn resume_next<C: Cpu + ?Sized>(&mut self, frame: &mut CpuState, cpu: &mut C) -> Result<Dispatch, KernelError> {
        let dispatch = self.schedule(cpu)?;
        if let Dispatch::Resume { state, .. } = &dispatch {
            *frame = *state;
        }
        Ok(dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::FrameBitmapAllocator;
    use kernel_info::boot::{BootInfo, MemoryRegion};
    use kernel_info::memory::USER_CODE_BASE;
    use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
    use kernel_proc::testing::{CpuEvent, ElfBuilder, ManualTimer, RecordingCpu};
    use kernel_proc::{ExecError, ExecutableKind, FileHandle, FsExecutables, ProcessError, ProcessState, ReadFile};
    use kernel_vmem::testing::{SimulatedMachine, SimulatedRam};

    const SPIN: &[u8] = b"\xEB\xFE";

    /// A frame allocator over the simulated machine with its kernel tree
    /// (frames 0 to 4) in use.
    fn frames() -> FrameAllocator {
        let map = [MemoryRegion::usable(0, 256 * FRAME_SIZE)];
        let storage = vec![0u64; 4].leak();
        FrameAllocator::new(FrameBitmapAllocator::from_boot(storage, &[0x1F], &map))
    }

    fn kernel<'a>(machine: &'a SimulatedMachine, frames: &'a FrameAllocator) -> Kernel<'a, SimulatedRam> {
        let paging = PagingEngine::new(&machine.window, frames, machine.kernel_root);
        Kernel::new(paging, KernelConfig::DEFAULT).unwrap()
    }

    fn binary(command_line: &str) -> ProcessDescriptor<'_> {
        ProcessDescriptor::new(ImageSource::Bytes(SPIN), ExecutableKind::Binary, command_line)
    }

    fn resumed(dispatch: Dispatch) -> Pid {
        match dispatch {
            Dispatch::Resume { pid, .. } => pid,
            Dispatch::Halt => panic!("nothing was dispatched"),
        }
    }

    fn ignore_tick(_: &mut CpuState) {}

    /// Notes, whenever the kernel moves off the active stack or root table,
    /// whether that root was still allocated.
    struct LeaveCheck<'f> {
        frames: &'f FrameAllocator,
        active: PhysicalAddress,
        left_live: Vec<bool>,
    }

    impl Cpu for LeaveCheck<'_> {
        fn switch_address_space(&mut self, root: PhysicalAddress) {
            self.left_live.push(self.frames.is_used(self.active));
            self.active = root;
        }

        fn set_kernel_stack(&mut self, _top: VirtualAddress) {}

        fn switch_to_kernel_stack(&mut self) {
            self.left_live.push(self.frames.is_used(self.active));
        }
    }

    struct Files(Vec<(&'static str, Vec<u8>)>);

    impl ReadFile for Files {
        fn read(&self, path: &str) -> Option<&[u8]> {
            self.0.iter().find(|(name, _)| *name == path).map(|(_, data)| data.as_slice())
        }
    }

    #[test]
    fn boot_modules_are_loaded_from_physical_memory() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let image = PhysicalAddress::new(200 * FRAME_SIZE);
        machine.ram.write(image, SPIN);
        frames.lock(image);
        let modules = [BootModule {
            name: "init --verbose",
            base: image,
            size: SPIN.len() as u64,
        }];
        let map = [MemoryRegion::usable(0, 256 * FRAME_SIZE)];
        let info = BootInfo {
            memory_map: &map,
            bootstrap_bitmap: &[0x1F],
            bootstrap_bitmap_frames: None,
            kernel_root: machine.kernel_root,
            window_table: PhysicalAddress::new(2 * FRAME_SIZE),
            window_table_virt: VirtualAddress::new(0xFFFF_FFFF_8000_1000),
            modules: &modules,
        };

        let mut kernel = kernel(&machine, &frames);
        let pid = kernel.spawn_module(info.module("init --verbose").unwrap()).unwrap();
        let process = kernel.scheduler().get(pid).unwrap();
        assert_eq!(process.layout().argc, 2);

        let code = kernel.manager().paging().translate(process.root(), USER_CODE_BASE).unwrap().unwrap();
        assert_ne!(code, image);
        let mut bytes = [0u8; 2];
        machine.ram.read(code, &mut bytes);
        assert_eq!(&bytes, SPIN);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let paging = PagingEngine::new(&machine.window, &frames, machine.kernel_root);
        let config = KernelConfig {
            timer_interval_ms: 0,
            ..KernelConfig::DEFAULT
        };
        assert!(Kernel::new(paging, config).is_err());
    }

    #[test]
    fn timer_ticks_rotate_processes_round_robin() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let mut kernel = kernel(&machine, &frames);
        let mut timer = ManualTimer::default();
        kernel.start_timer(&mut timer, ignore_tick).unwrap();
        assert_eq!(timer.interval_ms(), Some(2));

        for name in ["a", "b", "c"] {
            kernel.spawn(&binary(name)).unwrap();
        }
        let mut cpu = RecordingCpu::default();
        let Dispatch::Resume { pid, state, .. } = kernel.schedule(&mut cpu).unwrap() else {
            panic!("nothing was dispatched");
        };
        let mut frame = state;
        let mut order = vec![pid];
        for _ in 0..6 {
            let mut ticks = 1;
            let dispatch = loop {
                if let Some(dispatch) = kernel.timer_tick(&mut frame, &mut cpu).unwrap() {
                    break dispatch;
                }
                ticks += 1;
            };
            assert_eq!(ticks, KernelConfig::DEFAULT.ticks_per_quantum());
            order.push(resumed(dispatch));
        }

        assert_eq!(order, [1, 2, 3, 1, 2, 3, 1]);
        assert_eq!(frame.stack.rip, USER_CODE_BASE.as_u64());
        assert_eq!(cpu.roots.len(), 7);
    }

    #[test]
    fn fork_resumes_the_child_with_zero() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let mut kernel = kernel(&machine, &frames);
        let mut cpu = RecordingCpu::default();
        kernel.spawn(&binary("init")).unwrap();
        let Dispatch::Resume { state, .. } = kernel.schedule(&mut cpu).unwrap() else {
            panic!("nothing was dispatched");
        };

        let mut frame = state;
        frame.regs.rax = 57;
        frame.regs.rbx = 7;
        let used = frames.used_bytes();
        let child = kernel.fork(&frame).unwrap();
        assert_eq!(child, 2);
        assert!(frames.used_bytes() > used);

        let process = kernel.scheduler().get(child).unwrap();
        assert_eq!(process.parent_pid(), 1);
        assert_eq!(process.current.regs.rbx, 7);
        assert_ne!(process.root(), kernel.scheduler().get(1).unwrap().root());

        assert_eq!(resumed(kernel.yield_now(&mut frame, &mut cpu).unwrap()), child);
        assert_eq!(frame.regs.rax, 0);
        assert_eq!(frame.regs.rbx, 7);
        assert_eq!(kernel.scheduler().get(1).unwrap().current.regs.rax, 57);
    }

    #[test]
    fn exec_replaces_the_caller_only_on_success() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let mut kernel = kernel(&machine, &frames);
        let mut cpu = RecordingCpu::default();
        let files = FsExecutables(Files(vec![
            ("/bin/halt", b"\xF4".to_vec()),
            (
                "/bin/arm",
                ElfBuilder::new(0x40_0000).segment(0x40_0000, SPIN, 0x1000, false).machine(183).build(),
            ),
        ]));

        kernel.spawn(&binary("sh")).unwrap();
        kernel.scheduler_mut().current_mut().unwrap().fds.install(FileHandle(9)).unwrap();
        let mut frame = CpuState::default();
        kernel.schedule(&mut cpu).unwrap();
        let root = kernel.scheduler().current().unwrap().root();
        let used = frames.used_bytes();

        assert_eq!(
            kernel.exec(&files, "/bin/nothing", &mut frame, &mut cpu),
            Err(KernelError::Process(ProcessError::ExecutableNotFound))
        );
        assert_eq!(
            kernel.exec(&files, "/bin/arm -v", &mut frame, &mut cpu),
            Err(KernelError::Process(ProcessError::Exec(ExecError::BadMachine(183))))
        );
        assert_eq!(kernel.scheduler().current().unwrap().root(), root);
        assert_eq!(frames.used_bytes(), used);

        assert!(!cpu.events.contains(&CpuEvent::KernelOwnedStack));

        assert_eq!(resumed(kernel.exec(&files, "/bin/halt -v", &mut frame, &mut cpu).unwrap()), 1);
        let process = kernel.scheduler().current().unwrap();
        assert_ne!(process.root(), root);
        assert!(cpu.events.ends_with(&[
            CpuEvent::KernelOwnedStack,
            CpuEvent::AddressSpace(machine.kernel_root),
            CpuEvent::KernelStack(process.layout().kernel_stack_top),
            CpuEvent::AddressSpace(process.root()),
        ]));
        assert_eq!(process.layout().argc, 2);
        assert_eq!(process.fds.get(0), Some(FileHandle(9)));
        assert_eq!(frame.stack.rip, USER_CODE_BASE.as_u64());
    }

    #[test]
    fn exit_then_wait_collects_the_child() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let idle = frames.used_bytes();
        let mut kernel = kernel(&machine, &frames);
        let mut cpu = RecordingCpu::default();
        kernel.spawn(&binary("init")).unwrap();
        let mut frame = CpuState::default();
        kernel.schedule(&mut cpu).unwrap();
        assert_eq!(kernel.wait(), Ok(Wait::NoChildren));

        let child = kernel.fork(&frame).unwrap();
        assert_eq!(kernel.wait(), Ok(Wait::Pending));
        assert_eq!(resumed(kernel.yield_now(&mut frame, &mut cpu).unwrap()), child);
        assert_eq!(resumed(kernel.exit(3, &mut frame, &mut cpu).unwrap()), 1);
        assert_eq!(kernel.scheduler().get(child).unwrap().state(), ProcessState::Zombie);

        assert_eq!(kernel.wait(), Ok(Wait::Reaped { pid: child, status: 3 }));
        assert_eq!(kernel.wait(), Ok(Wait::NoChildren));
        assert_eq!(kernel.exit(0, &mut frame, &mut cpu), Ok(Dispatch::Halt));
        assert_eq!(cpu.active_root(), Some(machine.kernel_root));
        assert_eq!(cpu.events.last(), Some(&CpuEvent::AddressSpace(machine.kernel_root)));
        assert_eq!(frames.used_bytes(), idle);
        assert_eq!(kernel.exit(0, &mut frame, &mut cpu), Err(KernelError::NoCurrentProcess));
    }

    #[test]
    fn heap_and_anonymous_memory_come_from_the_current_process() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let mut kernel = kernel(&machine, &frames);
        let mut cpu = RecordingCpu::default();
        assert_eq!(kernel.sbrk(0x1000), Err(KernelError::NoCurrentProcess));

        kernel.spawn(&binary("init")).unwrap();
        kernel.schedule(&mut cpu).unwrap();
        let heap_start = kernel.scheduler().current().unwrap().layout().heap_start;
        assert_eq!(kernel.sbrk(0x2000), Ok(heap_start));
        assert_eq!(kernel.sbrk(0), Ok(heap_start + 0x2000));

        let at = VirtualAddress::new(0x5000_0000);
        assert_eq!(kernel.mmap(Placement::Fixed(at), 0x2000, PageAccess::ReadWrite), Ok(at));
        assert_eq!(
            kernel.mmap(Placement::Fixed(at), 0x1000, PageAccess::ReadOnly),
            Err(KernelError::Process(ProcessError::MappingCollision(at)))
        );
    }

    #[test]
    fn page_faults_grow_the_stack_or_kill_the_process() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let mut kernel = kernel(&machine, &frames);
        let mut cpu = RecordingCpu::default();
        kernel.spawn(&binary("init")).unwrap();
        let Dispatch::Resume { state, .. } = kernel.schedule(&mut cpu).unwrap() else {
            panic!("nothing was dispatched");
        };
        let mut frame = state;

        let bottom = kernel.scheduler().current().unwrap().layout().stack_bottom;
        let below = bottom - 0x100;
        assert_eq!(kernel.page_fault(below, &mut frame, &mut cpu), Ok(FaultOutcome::Resolved));
        let process = kernel.scheduler().current().unwrap();
        assert_eq!(process.layout().stack_bottom, below.align_down());
        assert!(kernel.manager().paging().translate(process.root(), below).unwrap().is_some());

        let wild = VirtualAddress::new(0x10);
        assert_eq!(
            kernel.page_fault(wild, &mut frame, &mut cpu),
            Ok(FaultOutcome::Killed(Dispatch::Halt))
        );
        let zombie = kernel.scheduler().get(1).unwrap();
        assert_eq!(zombie.exit_status(), Some(KILLED_STATUS));
        assert_eq!(cpu.active_root(), Some(machine.kernel_root));
        assert!(cpu.events.ends_with(&[CpuEvent::KernelOwnedStack, CpuEvent::AddressSpace(machine.kernel_root)]));
    }

    #[test]
    fn dying_processes_are_left_before_their_frames_are_released() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let mut kernel = kernel(&machine, &frames);
        let files = FsExecutables(Files(vec![("/bin/halt", b"\xF4".to_vec())]));
        let mut cpu = LeaveCheck {
            frames: &frames,
            active: machine.kernel_root,
            left_live: Vec::new(),
        };
        kernel.spawn(&binary("a")).unwrap();
        kernel.spawn(&binary("b")).unwrap();
        let mut frame = CpuState::default();
        kernel.schedule(&mut cpu).unwrap();

        let a = cpu.active;
        assert_eq!(resumed(kernel.exit(0, &mut frame, &mut cpu).unwrap()), 2);
        assert!(!frames.is_used(a));

        let b = cpu.active;
        assert_eq!(resumed(kernel.exec(&files, "/bin/halt", &mut frame, &mut cpu).unwrap()), 2);
        assert!(!frames.is_used(b));
        assert_ne!(cpu.active, b);

        let replaced = cpu.active;
        assert_eq!(
            kernel.page_fault(VirtualAddress::new(0x10), &mut frame, &mut cpu),
            Ok(FaultOutcome::Killed(Dispatch::Halt))
        );
        assert!(!frames.is_used(replaced));
        assert_eq!(cpu.active, machine.kernel_root);

        assert!(cpu.left_live.len() >= 9);
        assert!(cpu.left_live.iter().all(|&live| live));
    }

    #[test]
    #[should_panic(expected = "kernel panic: page fault")]
    fn kernel_faults_without_a_process_panic() {
        let machine = SimulatedMachine::new(256);
        let frames = frames();
        let mut kernel = kernel(&machine, &frames);
        let mut frame = CpuState::kernel(VirtualAddress::new(0xFFFF_FFFF_8000_0000), VirtualAddress::new(0x8000));
        let _ = kernel.page_fault(VirtualAddress::new(0x1000), &mut frame, &mut RecordingCpu::default());
    }
}

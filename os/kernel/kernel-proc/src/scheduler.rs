//! Round-robin scheduling over a running queue and a zombie queue.
//!
//! The head of the running queue is the current process. A timer tick adds
//! the timer interval to a millisecond counter; once a quantum has passed
//! the interrupted registers are saved into the current process and the next
//! one is dispatched. Dispatching moves a head that has already run to the
//! tail, so every process gets the CPU once per round.

use crate::cpu::{Cpu, CpuState};
use crate::manager::ProcessManager;
use crate::process::{Pid, Process, ProcessState};
use alloc::collections::VecDeque;
use kernel_info::config::KernelConfig;
use kernel_info::memory::KERNEL_DATA_SELECTOR;
use kernel_sync::IrqGuard;
use kernel_vmem::{FrameAlloc, Privilege, WindowBackend, WindowError};
use log::{debug, info, trace, warn};

/// Handler the timer calls with the interrupted register state.
pub type TickCallback = fn(&mut CpuState);

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TimerError {
    #[error("timer interval of {0} ms is not supported")]
    UnsupportedInterval(u64),
    #[error("a periodic callback is already registered")]
    Busy,
}

/// A periodic interrupt source.
pub trait TimerSource {
    /// # Errors
    /// The interval cannot be programmed.
    fn set_interval(&mut self, ms: u64) -> Result<(), TimerError>;

    /// # Errors
    /// No further callback can be registered.
    fn register_periodic_callback(&mut self, callback: TickCallback) -> Result<(), TimerError>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("no process with pid {0}")]
    NoSuchProcess(Pid),
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Window(#[from] WindowError),
}

/// What the interrupt handler does after a tick.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TickOutcome {
    /// Return to the interrupted code.
    Continue,
    /// The quantum is used up; the state was saved, dispatch the next process.
    Reschedule,
}

/// Result of [`Scheduler::dispatch`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dispatch {
    /// Nothing to run.
    Halt,
    /// Restore `state` at `privilege` in the address space just switched to.
    Resume {
        pid: Pid,
        state: CpuState,
        privilege: Privilege,
    },
}

pub struct Scheduler {
    running: VecDeque<Process>,
    zombies: VecDeque<Process>,
    elapsed_ms: u64,
    interval_ms: u64,
    quantum_ms: u64,
}

impl Scheduler {
    #[must_use]
    pub const fn new(config: &KernelConfig) -> Self {
        Self {
            running: VecDeque::new(),
            zombies: VecDeque::new(),
            elapsed_ms: 0,
            interval_ms: config.timer_interval_ms,
            quantum_ms: config.quantum_ms,
        }
    }

    /// Program `timer` and hook `callback` to its ticks.
    ///
    /// # Errors
    /// The timer rejected the interval or the callback.
    pub fn start<T: TimerSource + ?Sized>(&mut self, timer: &mut T, callback: TickCallback) -> Result<(), SchedulerError> {
        self.elapsed_ms = 0;
        timer.set_interval(self.interval_ms)?;
        timer.register_periodic_callback(callback)?;
        info!(
            "scheduler started: {} ms ticks, {} ms quantum",
            self.interval_ms, self.quantum_ms
        );
        Ok(())
    }

    /// Append `process` to the running queue.
    pub fn queue(&mut self, mut process: Process) {
        debug!("queued process {}", process.pid());
        process.set_state(ProcessState::Runnable);
        self.running.push_back(process);
    }

    #[must_use]
    pub fn current(&self) -> Option<&Process> {
        self.running.front()
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        self.running.front_mut()
    }

    /// A running or zombie process by pid.
    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.running.iter().chain(&self.zombies).find(|p| p.pid() == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.running.iter_mut().find(|p| p.pid() == pid)
    }

    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.get(pid).is_some()
    }

    /// Number of processes in the running queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.running.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn zombies(&self) -> impl Iterator<Item = &Process> {
        self.zombies.iter()
    }

    /// Account one timer tick; on quantum expiry save `frame` into the
    /// current process.
    pub fn on_timer_tick(&mut self, frame: &CpuState) -> TickOutcome {
        let _irq = IrqGuard::new();
        self.elapsed_ms += self.interval_ms;
        if self.elapsed_ms < self.quantum_ms {
            return TickOutcome::Continue;
        }
        self.elapsed_ms = 0;
        self.save(frame);
        TickOutcome::Reschedule
    }

    /// Give up the rest of the quantum.
    pub fn yield_now(&mut self, frame: &CpuState) -> TickOutcome {
        let _irq = IrqGuard::new();
        self.elapsed_ms = 0;
        self.save(frame);
        TickOutcome::Reschedule
    }

    fn save(&mut self, frame: &CpuState) {
        let Some(process) = self.running.front_mut() else {
            return;
        };
        match frame.privilege() {
            Privilege::User => {
                process.user_mode = *frame;
                process.current = *frame;
            }
            Privilege::Kernel => {
                process.current = *frame;
                process.current.stack.ss = KERNEL_DATA_SELECTOR;
            }
        }
    }

    /// Pick the next process and load its address space and kernel stack.
    ///
    /// # Errors
    /// The kernel mappings could not be injected; the process stays queued.
    pub fn dispatch<C, B, F>(&mut self, cpu: &mut C, manager: &ProcessManager<'_, B, F>) -> Result<Dispatch, SchedulerError>
    where
        C: Cpu + ?Sized,
        B: WindowBackend,
        F: FrameAlloc + ?Sized,
    {
        let _irq = IrqGuard::new();
        if self.running.len() > 1
            && self.running.front().is_some_and(|p| p.state() == ProcessState::Running)
            && let Some(mut previous) = self.running.pop_front()
        {
            previous.set_state(ProcessState::Runnable);
            self.running.push_back(previous);
        }

        let Some(process) = self.running.front_mut() else {
            trace!("nothing to dispatch");
            return Ok(Dispatch::Halt);
        };
        manager.paging().inject_kernel_mappings(process.root())?;
        cpu.set_kernel_stack(process.layout().kernel_stack_top);
        cpu.switch_address_space(process.root());
        process.set_state(ProcessState::Running);
        trace!("dispatching process {}", process.pid());

        Ok(Dispatch::Resume {
            pid: process.pid(),
            state: process.current,
            privilege: process.current.privilege(),
        })
    }

    /// Release the resources of `pid` and keep it as a zombie until its
    /// parent collects `exit_code`. Returns the number of frames released.
    ///
    /// # Errors
    /// [`SchedulerError::NoSuchProcess`] if `pid` is not running.
    pub fn terminate<B, F>(
        &mut self,
        pid: Pid,
        exit_code: i32,
        manager: &ProcessManager<'_, B, F>,
    ) -> Result<u64, SchedulerError>
    where
        B: WindowBackend,
        F: FrameAlloc + ?Sized,
    {
        let _irq = IrqGuard::new();
        let Some(mut process) = self.take_running(pid) else {
            warn!("cannot terminate unknown process {pid}");
            return Err(SchedulerError::NoSuchProcess(pid));
        };
        let freed = manager.destroy(&mut process);
        process.exit_status = Some(exit_code);
        process.set_state(ProcessState::Zombie);
        debug!("process {pid} exited with {exit_code}, {freed} frames released");
        self.zombies.push_back(process);
        Ok(freed)
    }

    /// Swap the running process `old_pid` for `new`, releasing the old one.
    /// `new` is queued at the tail.
    ///
    /// # Errors
    /// [`SchedulerError::NoSuchProcess`]; `new` is released in that case.
    pub fn replace<B, F>(
        &mut self,
        old_pid: Pid,
        mut new: Process,
        manager: &ProcessManager<'_, B, F>,
    ) -> Result<(), SchedulerError>
    where
        B: WindowBackend,
        F: FrameAlloc + ?Sized,
    {
        let _irq = IrqGuard::new();
        let Some(mut old) = self.take_running(old_pid) else {
            warn!("cannot replace unknown process {old_pid}");
            manager.destroy(&mut new);
            return Err(SchedulerError::NoSuchProcess(old_pid));
        };
        manager.destroy(&mut old);
        old.set_state(ProcessState::Reclaimed);
        debug!("process {old_pid} replaced");
        self.queue(new);
        Ok(())
    }

    /// One more than the highest pid in either queue.
    #[must_use]
    pub fn next_pid(&self) -> Pid {
        self.running
            .iter()
            .chain(&self.zombies)
            .map(Process::pid)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Running and terminated children of `parent`.
    #[must_use]
    pub fn child_count(&self, parent: Pid) -> usize {
        self.running
            .iter()
            .chain(&self.zombies)
            .filter(|p| p.parent_pid() == parent)
            .count()
    }

    #[must_use]
    pub fn has_terminated_child(&self, parent: Pid) -> bool {
        self.zombies.iter().any(|p| p.parent_pid() == parent)
    }

    /// Collect the oldest terminated child of `parent`.
    pub fn reap_child(&mut self, parent: Pid) -> Option<(Pid, i32)> {
        let index = self.zombies.iter().position(|p| p.parent_pid() == parent)?;
        let mut child = self.zombies.remove(index)?;
        child.set_state(ProcessState::Reclaimed);
        Some((child.pid(), child.exit_status().unwrap_or_default()))
    }

    /// Drop every zombie. Returns how many there were.
    pub fn reap_all(&mut self) -> usize {
        let count = self.zombies.len();
        self.zombies.clear();
        count
    }

    fn take_running(&mut self, pid: Pid) -> Option<Process> {
        let index = self.running.iter().position(|p| p.pid() == pid)?;
        self.running.remove(index)
    }
}

//! # Runtime Configuration

use crate::memory::MAX_USER_STACK_SIZE;
use kernel_memory_addresses::FRAME_SIZE;

/// Tunables of the memory manager and the scheduler.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KernelConfig {
    /// Period of the scheduler timer in milliseconds.
    pub timer_interval_ms: u64,

    /// Time slice a process runs before it is rotated to the back of the
    /// running queue.
    pub quantum_ms: u64,

    /// Initial size of a process' user stack, in pages.
    pub user_stack_pages: u64,

    /// Size of a process' kernel-mode stack, in pages.
    pub kernel_stack_pages: u64,

    /// Upper bound for the user stack when it grows on page faults.
    pub max_user_stack_bytes: u64,

    /// Pages mapped when the kernel heap is first brought up.
    pub initial_heap_pages: u64,
}

impl KernelConfig {
    /// The scheduler timer ticks every 2 ms; a process gets five ticks.
    pub const DEFAULT: Self = Self {
        timer_interval_ms: 2,
        quantum_ms: 5 * 2,
        user_stack_pages: 4,
        kernel_stack_pages: 4,
        max_user_stack_bytes: MAX_USER_STACK_SIZE,
        initial_heap_pages: 4,
    };

    /// Check the values for internal consistency.
    ///
    /// # Errors
    /// Returns the first inconsistency found.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.timer_interval_ms == 0 {
            return Err(ConfigError::ZeroTimerInterval);
        }
        if self.quantum_ms < self.timer_interval_ms {
            return Err(ConfigError::QuantumShorterThanTick {
                quantum_ms: self.quantum_ms,
                interval_ms: self.timer_interval_ms,
            });
        }
        if self.user_stack_pages == 0 || self.kernel_stack_pages == 0 {
            return Err(ConfigError::EmptyStack);
        }
        if self.max_user_stack_bytes < self.user_stack_pages * FRAME_SIZE {
            return Err(ConfigError::StackLimitTooSmall);
        }
        if self.initial_heap_pages == 0 {
            return Err(ConfigError::EmptyHeap);
        }
        Ok(())
    }

    /// Number of timer ticks that make up one quantum.
    #[must_use]
    pub const fn ticks_per_quantum(&self) -> u64 {
        self.quantum_ms.div_ceil(self.timer_interval_ms)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("the timer interval must not be zero")]
    ZeroTimerInterval,
    #[error("quantum of {quantum_ms} ms is shorter than a {interval_ms} ms timer tick")]
    QuantumShorterThanTick { quantum_ms: u64, interval_ms: u64 },
    #[error("stacks need at least one page")]
    EmptyStack,
    #[error("the user stack limit is below the initial stack size")]
    StackLimitTooSmall,
    #[error("the kernel heap needs at least one initial page")]
    EmptyHeap,
}

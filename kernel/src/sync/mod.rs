//! Synchronization primitives.
//!
//! Short critical sections use `spin::Mutex` directly. Sections that must
//! not race with interrupt handlers take an [`IrqGuard`] first. Code that
//! may hold a lock across blocking I/O uses [`SleepLock`], which suspends
//! the calling thread instead of spinning.

mod sleeplock;

pub use sleeplock::{SleepLock, SleepLockGuard};

/// Saved interrupt state. Interrupts are disabled while a guard is live
/// and restored to their previous state on drop.
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    /// Disable interrupts, remembering whether they were enabled.
    pub fn new() -> Self {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let was_enabled = x86_64::instructions::interrupts::are_enabled();
            x86_64::instructions::interrupts::disable();
            Self { was_enabled }
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            Self { was_enabled: false }
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        if self.was_enabled {
            x86_64::instructions::interrupts::enable();
        }
    }
}

/// Run `f` with interrupts masked, restoring the previous state after.
pub fn with_irqs_disabled<R>(f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::new();
    f()
}

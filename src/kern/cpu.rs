//! Execution context, clock and timeouts
//!
//! Locks need to know which execution context holds them and how long a
//! waiter may spin. On a host (`std`) the context is the OS thread and
//! the clock is a monotonic `Instant`. On bare metal both come from the
//! platform via [`set_context_source`] and [`set_clock_source`].

use crate::types::{Bigtime, Error, Result};

/// Identity of an execution context (a kernel thread on a CPU)
pub type ContextId = u64;

/// CPU index
pub type CpuId = u32;

/// No context holds the lock
pub const NO_CONTEXT: ContextId = 0;

#[cfg(any(test, feature = "std"))]
mod host {
    use super::ContextId;
    use crate::types::Bigtime;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::sync::OnceLock;
    use std::time::Instant;

    static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

    std::thread_local! {
        static CONTEXT: ContextId = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_context() -> ContextId {
        CONTEXT.with(|id| *id)
    }

    pub fn system_time() -> Bigtime {
        static BOOT: OnceLock<Instant> = OnceLock::new();
        // Offset by one so a running thread never stamps time zero
        BOOT.get_or_init(Instant::now).elapsed().as_micros() as Bigtime + 1
    }

    pub fn relax() {
        std::thread::yield_now();
    }
}

#[cfg(not(any(test, feature = "std")))]
mod bare {
    use super::ContextId;
    use crate::types::Bigtime;
    use core::sync::atomic::{AtomicI64, Ordering};

    pub static CONTEXT_SOURCE: spin::Once<fn() -> ContextId> = spin::Once::new();
    pub static CLOCK_SOURCE: spin::Once<fn() -> Bigtime> = spin::Once::new();

    // Until the platform timer is up every read advances a tick
    static TICKS: AtomicI64 = AtomicI64::new(1);

    pub fn current_context() -> ContextId {
        CONTEXT_SOURCE.get().map_or(1, |source| source())
    }

    pub fn system_time() -> Bigtime {
        match CLOCK_SOURCE.get() {
            Some(source) => source(),
            None => TICKS.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn relax() {
        core::hint::spin_loop();
    }
}

#[cfg(any(test, feature = "std"))]
use host as platform;

#[cfg(not(any(test, feature = "std")))]
use bare as platform;

/// The current execution context; never [`NO_CONTEXT`]
#[inline]
pub fn current_context() -> ContextId {
    platform::current_context()
}

/// Monotonic time since boot in microseconds
#[inline]
pub fn system_time() -> Bigtime {
    platform::system_time()
}

/// Back off inside a spin-wait loop
#[inline]
pub fn relax() {
    platform::relax()
}

/// Install the platform's current-context query
#[cfg(not(any(test, feature = "std")))]
pub fn set_context_source(source: fn() -> ContextId) {
    bare::CONTEXT_SOURCE.call_once(|| source);
}

/// Install the platform's monotonic clock
#[cfg(not(any(test, feature = "std")))]
pub fn set_clock_source(source: fn() -> Bigtime) {
    bare::CLOCK_SOURCE.call_once(|| source);
}

/// How long a blocking operation may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until woken
    Infinite,
    /// Wait at most this many microseconds from now; zero polls
    Relative(Bigtime),
    /// Wait until this system time
    Absolute(Bigtime),
}

impl Timeout {
    /// Absolute deadline, `None` for an infinite wait
    pub fn deadline(&self) -> Option<Bigtime> {
        match *self {
            Timeout::Infinite => None,
            Timeout::Relative(delta) => Some(system_time().saturating_add(delta.max(0))),
            Timeout::Absolute(at) => Some(at),
        }
    }

    /// A relative zero timeout never blocks
    pub fn is_poll(&self) -> bool {
        matches!(*self, Timeout::Relative(delta) if delta <= 0)
    }

    /// The error reported when the wait ends without success
    pub fn expired_error(&self) -> Error {
        if self.is_poll() {
            Error::WouldBlock
        } else {
            Error::TimedOut
        }
    }
}

/// Fail with the timeout's error once `deadline` has passed
pub fn check_deadline(deadline: Option<Bigtime>, timeout: Timeout) -> Result<()> {
    match deadline {
        Some(at) if system_time() >= at => Err(timeout.expired_error()),
        _ => Ok(()),
    }
}

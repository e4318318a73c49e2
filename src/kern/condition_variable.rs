//! Condition variables
//!
//! A waiter creates a [`ConditionVariableEntry`], adds it to the variable
//! while still holding whatever lock protects the awaited state, drops
//! that lock and then waits on the entry. A notification that arrives in
//! between is not lost: it is recorded in the entry.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use super::cpu::{self, Timeout};
use super::lock::SpinLock;
use crate::types::{Error, Result};

const WAITING: u8 = 0;
const NOTIFIED: u8 = 1;
const ABANDONED: u8 = 2;

struct WaitSlot {
    state: AtomicU8,
    status: SpinLock<Option<Result<()>>>,
}

impl WaitSlot {
    /// Deliver `status` unless the waiter gave up; true if delivered
    fn notify(&self, status: Result<()>) -> bool {
        let mut slot = self.status.lock();
        if self.state.load(Ordering::Acquire) != WAITING {
            return false;
        }
        *slot = Some(status);
        self.state.store(NOTIFIED, Ordering::Release);
        true
    }
}

/// Something a thread can wait for
pub struct ConditionVariable {
    object: SpinLock<(u64, &'static str)>,
    waiters: SpinLock<Vec<Arc<WaitSlot>>>,
}

impl ConditionVariable {
    pub const fn new() -> Self {
        Self {
            object: SpinLock::new((0, "")),
            waiters: SpinLock::new(Vec::new()),
        }
    }

    /// Describe what the variable stands for
    pub fn init(&self, object: u64, description: &'static str) {
        *self.object.lock() = (object, description);
    }

    pub fn object(&self) -> u64 {
        self.object.lock().0
    }

    pub fn description(&self) -> &'static str {
        self.object.lock().1
    }

    /// Register `entry` as a waiter
    pub fn add(&self, entry: &ConditionVariableEntry) {
        entry.slot.state.store(WAITING, Ordering::Release);
        *entry.slot.status.lock() = None;
        self.waiters.lock().push(Arc::clone(&entry.slot));
    }

    /// Wake the oldest live waiter; false if there was none
    pub fn notify_one(&self) -> bool {
        let mut waiters = self.waiters.lock();
        while !waiters.is_empty() {
            let slot = waiters.remove(0);
            if slot.notify(Ok(())) {
                return true;
            }
        }
        false
    }

    /// Wake every waiter; returns how many were woken
    pub fn notify_all(&self) -> usize {
        self.notify_all_with(Ok(()))
    }

    /// Wake every waiter, making their waits return `status`
    pub fn notify_all_with(&self, status: Result<()>) -> usize {
        let waiters = core::mem::take(&mut *self.waiters.lock());
        waiters.iter().filter(|slot| slot.notify(status)).count()
    }

    /// Number of waiters that have not been woken or given up
    pub fn entries_count(&self) -> usize {
        self.waiters
            .lock()
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) == WAITING)
            .count()
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (object, description) = *self.object.lock();
        f.debug_struct("ConditionVariable")
            .field("object", &object)
            .field("description", &description)
            .field("waiters", &self.entries_count())
            .finish()
    }
}

/// One waiter's side of a [`ConditionVariable`]
pub struct ConditionVariableEntry {
    slot: Arc<WaitSlot>,
}

impl ConditionVariableEntry {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(WaitSlot {
                state: AtomicU8::new(ABANDONED),
                status: SpinLock::new(None),
            }),
        }
    }

    /// Block until notified or until the timeout expires
    ///
    /// Returns the status passed by the notifier. An entry that was never
    /// added returns [`Error::EntryNotFound`] at once.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        let deadline = timeout.deadline();
        loop {
            {
                let mut status = self.slot.status.lock();
                match self.slot.state.load(Ordering::Acquire) {
                    NOTIFIED => return status.take().unwrap_or(Ok(())),
                    ABANDONED => return Err(Error::EntryNotFound),
                    _ => {}
                }
                if let Err(error) = cpu::check_deadline(deadline, timeout) {
                    self.slot.state.store(ABANDONED, Ordering::Release);
                    return Err(error);
                }
            }
            cpu::relax();
        }
    }

    /// True once a notification has been delivered
    pub fn is_notified(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) == NOTIFIED
    }
}

impl Default for ConditionVariableEntry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let condition = ConditionVariable::new();
        condition.init(0x1000, "test");
        let entry = ConditionVariableEntry::new();
        condition.add(&entry);
        assert_eq!(condition.entries_count(), 1);

        assert!(condition.notify_one());
        assert_eq!(entry.wait(Timeout::Infinite), Ok(()));
        assert_eq!(condition.entries_count(), 0);
        assert_eq!(condition.description(), "test");
    }

    #[test]
    fn test_wait_times_out() {
        let condition = ConditionVariable::new();
        let entry = ConditionVariableEntry::new();
        condition.add(&entry);

        assert_eq!(entry.wait(Timeout::Relative(0)), Err(Error::WouldBlock));
        assert_eq!(condition.entries_count(), 0);
        // The abandoned entry does not absorb a notification
        assert!(!condition.notify_one());
    }

    #[test]
    fn test_notify_all_with_status() {
        let condition = Arc::new(ConditionVariable::new());
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let entry = ConditionVariableEntry::new();
                condition.add(&entry);
                std::thread::spawn(move || entry.wait(Timeout::Relative(5_000_000)))
            })
            .collect();

        assert_eq!(condition.notify_all_with(Err(Error::Interrupted)), 3);
        for worker in workers {
            assert_eq!(worker.join().unwrap(), Err(Error::Interrupted));
        }
    }

    #[test]
    fn test_debug_shows_object_and_waiters() {
        let condition = ConditionVariable::new();
        condition.init(0x2000, "unwire");
        let entry = ConditionVariableEntry::new();
        condition.add(&entry);

        let text = format!("{:?}", condition);
        assert!(text.contains("8192"));
        assert!(text.contains("\"unwire\""));
        assert!(text.contains("waiters: 1"));
    }

    #[test]
    fn test_wait_without_add() {
        let entry = ConditionVariableEntry::new();
        assert_eq!(entry.wait(Timeout::Infinite), Err(Error::EntryNotFound));
    }
}

//! Thread Management
//!
//! A thread's state is partitioned by the lock that guards it:
//!
//! - immutable after creation: id, serial number, kernel stack
//! - the thread lock ([`LockClass::Thread`]): name, exit status and exit
//!   waiters, user timers
//! - the scheduler lock: run state, priority, CPU, wait information
//! - the time lock: kernel/user time accounting
//! - the team lock: the link to the owning team
//! - the signal lock: pending signals and the block mask
//!
//! Threads live in the [`ThreadRegistry`]; [`ThreadRegistry::get_and_lock`]
//! is the only safe way to go from an id to a locked thread.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use super::condition_variable::{ConditionVariable, ConditionVariableEntry};
use super::cpu::{self, CpuId, Timeout};
use super::lock::{Mutex, MutexGuard, RwSpinLock, SpinLock, SpinLockGuard};
use super::lock_order::LockClass;
use super::referenceable::{KernelReferenceable, Lockable, LockedReference, Reference, ReferenceCount};
use super::signal::{PendingSignals, Signal, SignalSet};
use super::team::Team;
use super::user_timer::{UserTimer, UserTimerList};
use crate::config::{truncated_name, Name};
use crate::types::{Addr, AreaId, Bigtime, Error, Result, SignalNumber, TeamId, ThreadId};

// ============================================================================
// Thread Priority
// ============================================================================

/// Thread priority levels
pub mod priority {
    pub const IDLE: i32 = 0;
    pub const LOWEST_ACTIVE: i32 = 1;
    pub const LOW: i32 = 5;
    pub const NORMAL: i32 = 10;
    pub const DISPLAY: i32 = 15;
    pub const URGENT_DISPLAY: i32 = 20;
    pub const REAL_TIME_DISPLAY: i32 = 100;
    pub const URGENT: i32 = 110;
    pub const REAL_TIME: i32 = 120;

    /// Range accepted by `set_priority`
    pub const MIN_SET: i32 = LOWEST_ACTIVE;
    pub const MAX_SET: i32 = REAL_TIME;
}

// ============================================================================
// Scheduling State
// ============================================================================

/// Run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadState {
    Running,
    Ready,
    Waiting,
    /// New threads start suspended
    #[default]
    Suspended,
    /// Exited; freed at the next reschedule
    FreeOnReschedule,
}

/// What a waiting thread is blocked on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitType {
    #[default]
    None,
    Semaphore,
    ConditionVariable,
    Mutex,
    RwLock,
    Signal,
    Snooze,
    Other,
}

/// Blocking bookkeeping, guarded by the scheduler lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitInfo {
    pub interruptible: bool,
    pub wait_type: WaitType,
    pub object: u64,
    /// `None` while the wait is pending
    pub status: Option<Result<()>>,
}

impl Default for WaitInfo {
    fn default() -> Self {
        Self {
            interruptible: false,
            wait_type: WaitType::None,
            object: 0,
            status: Some(Ok(())),
        }
    }
}

/// Scheduler-owned part of a thread
#[derive(Debug, Clone)]
pub struct SchedulingInfo {
    pub state: ThreadState,
    pub priority: i32,
    /// I/O priority; negative means "follow the thread priority"
    pub io_priority: i32,
    pub cpu: Option<CpuId>,
    pub previous_cpu: Option<CpuId>,
    /// Nesting depth of CPU pinning
    pub pinned_to_cpu: u32,
    pub wait: WaitInfo,
}

impl SchedulingInfo {
    fn new(priority: i32) -> Self {
        Self {
            state: ThreadState::default(),
            priority,
            io_priority: -1,
            cpu: None,
            previous_cpu: None,
            pinned_to_cpu: 0,
            wait: WaitInfo::default(),
        }
    }

    /// Arm a wait; an unblock arriving before [`SchedulingInfo::block`] is kept
    pub fn prepare_to_block(&mut self, interruptible: bool, wait_type: WaitType, object: u64) {
        self.wait = WaitInfo {
            interruptible,
            wait_type,
            object,
            status: None,
        };
    }

    /// Mark the thread waiting; returns the status if it was already unblocked
    pub fn block(&mut self) -> Option<Result<()>> {
        if let Some(status) = self.wait.status {
            return Some(status);
        }
        self.state = ThreadState::Waiting;
        None
    }

    /// End a pending wait with `status`; false if there was none
    pub fn unblock(&mut self, status: Result<()>) -> bool {
        if self.wait.status.is_some() {
            return false;
        }
        self.wait.status = Some(status);
        if self.state == ThreadState::Waiting {
            self.state = ThreadState::Ready;
        }
        true
    }

    /// Interrupt an interruptible wait
    pub fn interrupt(&mut self) -> bool {
        self.wait.interruptible && self.unblock(Err(Error::Interrupted))
    }

    pub fn effective_io_priority(&self) -> i32 {
        if self.io_priority < 0 {
            self.priority
        } else {
            self.io_priority
        }
    }
}

// ============================================================================
// Time Accounting
// ============================================================================

/// CPU time accounting, guarded by the time lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadTimes {
    pub kernel_time: Bigtime,
    pub user_time: Bigtime,
    /// Set by clock_settime on the thread CPU clock
    pub cpu_clock_offset: Bigtime,
    /// Start of the current accounting slice, when running
    pub last_time: Bigtime,
    pub in_kernel: bool,
    pub running: bool,
}

impl ThreadTimes {
    pub fn cpu_time(&self, ignore_current_run: bool) -> Bigtime {
        self.cpu_time_at(cpu::system_time(), ignore_current_run)
    }

    /// Total CPU time as of `now`
    ///
    /// The current run counts unless `ignore_current_run` is set, e.g.
    /// when the scheduler is about to fold it in itself.
    pub fn cpu_time_at(&self, now: Bigtime, ignore_current_run: bool) -> Bigtime {
        let mut time = self.user_time + self.kernel_time + self.cpu_clock_offset;
        if !ignore_current_run && self.running {
            time += now - self.last_time;
        }
        time
    }

    /// User time as of `now`
    pub fn user_time_at(&self, now: Bigtime) -> Bigtime {
        let mut time = self.user_time;
        if self.running && !self.in_kernel {
            time += now - self.last_time;
        }
        time
    }

    /// The thread got a CPU
    pub fn start_run(&mut self, now: Bigtime) {
        self.last_time = now;
        self.running = true;
    }

    /// The thread left its CPU; fold the slice in
    pub fn stop_run(&mut self, now: Bigtime) {
        if self.running {
            self.charge(now);
            self.running = false;
        }
    }

    pub fn enter_kernel(&mut self, now: Bigtime) {
        if self.running {
            self.charge(now);
        }
        self.in_kernel = true;
    }

    pub fn leave_kernel(&mut self, now: Bigtime) {
        if self.running {
            self.charge(now);
        }
        self.in_kernel = false;
    }

    fn charge(&mut self, now: Bigtime) {
        let slice = now - self.last_time;
        if self.in_kernel {
            self.kernel_time += slice;
        } else {
            self.user_time += slice;
        }
        self.last_time = now;
    }
}

// ============================================================================
// Exit
// ============================================================================

/// How a thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadExitReason {
    Exited,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadExitStatus {
    pub status: i32,
    pub reason: ThreadExitReason,
    pub signal: SignalNumber,
}

struct ExitWaiter {
    condition: ConditionVariable,
    status: SpinLock<Option<ThreadExitStatus>>,
}

// ============================================================================
// Thread Structure
// ============================================================================

/// Kernel stack placement; fixed at creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStack {
    pub area: Option<AreaId>,
    pub base: Addr,
    pub top: Addr,
}

/// State guarded by the thread lock
pub struct ThreadLocked {
    pub name: Name,
    exit: Option<ThreadExitStatus>,
    exit_waiters: Vec<Arc<ExitWaiter>>,
    pub user_timers: UserTimerList,
}

struct TeamLink {
    id: TeamId,
    team: Weak<Team>,
}

struct ThreadSignals {
    pending: PendingSignals,
    block_mask: SignalSet,
}

/// A thread control block
pub struct Thread {
    refs: ReferenceCount,
    id: ThreadId,
    serial_number: i64,
    kernel_stack: KernelStack,
    lock: Mutex<ThreadLocked>,
    scheduler: SpinLock<SchedulingInfo>,
    time: SpinLock<ThreadTimes>,
    team: SpinLock<Option<TeamLink>>,
    signals: SpinLock<ThreadSignals>,
}

impl Thread {
    pub fn new(id: ThreadId, serial_number: i64, name: &str, kernel_stack: KernelStack) -> Reference<Self> {
        Reference::new(Self {
            refs: ReferenceCount::new(),
            id,
            serial_number,
            kernel_stack,
            lock: Mutex::new(
                LockClass::Thread,
                "thread",
                ThreadLocked {
                    name: truncated_name(name),
                    exit: None,
                    exit_waiters: Vec::new(),
                    user_timers: UserTimerList::new(),
                },
            ),
            scheduler: SpinLock::new(SchedulingInfo::new(priority::NORMAL)),
            time: SpinLock::new(ThreadTimes::default()),
            team: SpinLock::new(None),
            signals: SpinLock::new(ThreadSignals {
                pending: PendingSignals::new(),
                block_mask: SignalSet::EMPTY,
            }),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Unique across id reuse
    pub fn serial_number(&self) -> i64 {
        self.serial_number
    }

    pub fn kernel_stack(&self) -> KernelStack {
        self.kernel_stack
    }

    pub fn lock(&self) -> MutexGuard<'_, ThreadLocked> {
        self.lock.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, ThreadLocked>> {
        self.lock.try_lock()
    }

    pub fn is_locked_by_current(&self) -> bool {
        self.lock.is_locked_by_current()
    }

    pub fn name(&self) -> Name {
        self.lock.lock().name.clone()
    }

    pub fn scheduler_lock(&self) -> SpinLockGuard<'_, SchedulingInfo> {
        self.scheduler.lock()
    }

    pub fn time_lock(&self) -> SpinLockGuard<'_, ThreadTimes> {
        self.time.lock()
    }

    pub fn state(&self) -> ThreadState {
        self.scheduler.lock().state
    }

    /// Returns the previous state
    pub fn set_state(&self, state: ThreadState) -> ThreadState {
        core::mem::replace(&mut self.scheduler.lock().state, state)
    }

    pub fn priority(&self) -> i32 {
        self.scheduler.lock().priority
    }

    /// Keep the thread on its CPU until the matching [`Thread::unpin`]
    ///
    /// Pinning nests; returns the new depth.
    pub fn pin_to_current_cpu(&self) -> u32 {
        let mut scheduling = self.scheduler.lock();
        scheduling.pinned_to_cpu += 1;
        scheduling.pinned_to_cpu
    }

    pub fn unpin(&self) -> u32 {
        let mut scheduling = self.scheduler.lock();
        crate::kassert!(
            scheduling.pinned_to_cpu > 0,
            "thread {}: unpinned more often than pinned",
            self.id
        );
        scheduling.pinned_to_cpu -= 1;
        scheduling.pinned_to_cpu
    }

    pub fn is_pinned(&self) -> bool {
        self.scheduler.lock().pinned_to_cpu > 0
    }

    /// Set the priority, clamped to the settable range; returns the old one
    pub fn set_priority(&self, priority: i32) -> Result<i32> {
        let mut scheduling = self.scheduler.lock();
        if scheduling.priority == priority::IDLE {
            return Err(Error::NotAllowed);
        }
        let old = scheduling.priority;
        scheduling.priority = priority.clamp(priority::MIN_SET, priority::MAX_SET);
        Ok(old)
    }

    /// Total CPU time, taking the time lock
    pub fn cpu_time(&self, ignore_current_run: bool) -> Bigtime {
        self.time.lock().cpu_time(ignore_current_run)
    }

    // === Team link ===

    pub fn team_id(&self) -> Option<TeamId> {
        self.team.lock().as_ref().map(|link| link.id)
    }

    /// The owning team, unless it is gone or dying
    pub fn team(&self) -> Option<Reference<Team>> {
        let link = self.team.lock();
        link.as_ref().and_then(|link| Reference::upgrade(&link.team))
    }

    pub(crate) fn set_team(&self, team: Option<(TeamId, Weak<Team>)>) {
        *self.team.lock() = team.map(|(id, team)| TeamLink { id, team });
    }

    // === Signals ===

    pub fn add_pending_signal(&self, number: SignalNumber) {
        self.signals.lock().pending.add_signal(number);
    }

    pub fn add_pending_signal_queued(&self, signal: Reference<Signal>) {
        self.signals.lock().pending.add_queued_signal(signal);
    }

    pub fn remove_pending_signal(&self, number: SignalNumber) {
        self.signals.lock().pending.remove_signal(number);
    }

    pub fn remove_pending_signals(&self, mask: SignalSet) {
        self.signals.lock().pending.remove_signals(mask);
    }

    /// Signals pending on the thread itself
    pub fn pending_signals(&self) -> SignalSet {
        self.signals.lock().pending.all_signals()
    }

    /// Signals pending on the thread or its team
    pub fn all_pending_signals(&self) -> SignalSet {
        let own = self.pending_signals();
        match self.team() {
            Some(team) => own.union(team.pending_signals()),
            None => own,
        }
    }

    pub fn sig_block_mask(&self) -> SignalSet {
        self.signals.lock().block_mask
    }

    /// Replace the block mask; kill and stop signals cannot be blocked
    pub fn set_sig_block_mask(&self, mask: SignalSet) -> SignalSet {
        let mut signals = self.signals.lock();
        let old = signals.block_mask;
        signals.block_mask = mask.difference(SignalSet::NON_BLOCKABLE);
        old
    }

    fn non_blocked(&self) -> SignalSet {
        SignalSet::ALL.difference(self.sig_block_mask())
    }

    /// Priority of the best deliverable signal on the thread or its team
    pub fn highest_pending_signal_priority(&self) -> Option<i32> {
        let non_blocked = self.non_blocked();
        let own = self.signals.lock().pending.highest_signal_priority(non_blocked);
        let team = self
            .team()
            .and_then(|team| team.highest_pending_signal_priority(non_blocked));
        own.max(team)
    }

    /// Take the best deliverable signal from the thread or its team
    pub fn dequeue_pending_signal(&self) -> Option<Reference<Signal>> {
        let non_blocked = self.non_blocked();
        let own = self.signals.lock().pending.highest_signal_priority(non_blocked);
        let team = self.team();
        let team_priority = team
            .as_ref()
            .and_then(|team| team.highest_pending_signal_priority(non_blocked));

        match (own, team_priority, team) {
            (_, Some(theirs), Some(team)) if own.map_or(true, |mine| theirs > mine) => {
                team.dequeue_pending_signal(non_blocked)
            }
            _ => self.signals.lock().pending.dequeue_signal(non_blocked),
        }
    }

    // === Exit ===

    /// Record the exit status and wake everyone waiting for it
    ///
    /// The status is written once; later calls return false.
    pub fn exit(&self, status: ThreadExitStatus) -> bool {
        let mut locked = self.lock.lock();
        if locked.exit.is_some() {
            return false;
        }
        locked.exit = Some(status);
        for waiter in locked.exit_waiters.drain(..) {
            *waiter.status.lock() = Some(status);
            waiter.condition.notify_all();
        }
        drop(locked);

        self.scheduler.lock().state = ThreadState::FreeOnReschedule;
        self.time.lock().stop_run(cpu::system_time());
        log::debug!("thread {} exited with {:?}", self.id, status);
        true
    }

    pub fn exit_status(&self) -> Option<ThreadExitStatus> {
        self.lock.lock().exit
    }

    /// Block until the thread exits
    pub fn wait_for_exit(&self, timeout: Timeout) -> Result<ThreadExitStatus> {
        let waiter = Arc::new(ExitWaiter {
            condition: ConditionVariable::new(),
            status: SpinLock::new(None),
        });
        let entry = ConditionVariableEntry::new();
        {
            let mut locked = self.lock.lock();
            if let Some(status) = locked.exit {
                return Ok(status);
            }
            waiter.condition.init(self.id.0 as u64, "thread exit");
            waiter.condition.add(&entry);
            locked.exit_waiters.push(Arc::clone(&waiter));
        }

        let result = entry.wait(timeout);
        let status = *waiter.status.lock();
        match (result, status) {
            (_, Some(status)) => Ok(status),
            (Err(error), None) => {
                self.lock
                    .lock()
                    .exit_waiters
                    .retain(|other| !Arc::ptr_eq(other, &waiter));
                Err(error)
            }
            (Ok(()), None) => Err(Error::Interrupted),
        }
    }

    // === Timers ===

    pub fn add_user_timer(&self, timer: UserTimer) -> i32 {
        self.lock.lock().user_timers.add_timer(timer)
    }

    pub fn remove_user_timer(&self, id: i32) -> Option<UserTimer> {
        self.lock.lock().user_timers.remove_timer(id)
    }

    /// Delete the thread's timers; returns how many user-defined ones went
    pub fn delete_user_timers(&self, user_defined_only: bool) -> usize {
        self.lock.lock().user_timers.delete_timers(user_defined_only)
    }

    pub fn info(&self) -> ThreadInfo {
        let name = self.name();
        let scheduling = self.scheduler.lock().clone();
        let times = *self.time.lock();
        ThreadInfo {
            thread: self.id,
            team: self.team_id(),
            name,
            state: scheduling.state,
            priority: scheduling.priority,
            stack_base: self.kernel_stack.base,
            stack_end: self.kernel_stack.top,
            user_time: times.user_time,
            kernel_time: times.kernel_time,
        }
    }
}

impl KernelReferenceable for Thread {
    fn reference_count(&self) -> &ReferenceCount {
        &self.refs
    }

    fn last_reference_released(&self) {
        self.signals.lock().pending.clear();
        log::trace!("thread {} released", self.id);
    }
}

impl Lockable for Thread {
    type Locked = ThreadLocked;

    fn object_lock(&self) -> &Mutex<ThreadLocked> {
        &self.lock
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("serial_number", &self.serial_number)
            .field("refs", &self.refs)
            .finish()
    }
}

/// A thread reference whose thread lock is held
pub type ThreadLocker = LockedReference<Thread>;

/// Thread information snapshot
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub thread: ThreadId,
    pub team: Option<TeamId>,
    pub name: Name,
    pub state: ThreadState,
    pub priority: i32,
    pub stack_base: Addr,
    pub stack_end: Addr,
    pub user_time: Bigtime,
    pub kernel_time: Bigtime,
}

// ============================================================================
// Thread Registry
// ============================================================================

/// All published threads, by id
pub struct ThreadRegistry {
    threads: RwSpinLock<BTreeMap<ThreadId, Reference<Thread>>>,
    next_id: AtomicI32,
    next_serial: AtomicI64,
    max_threads: usize,
}

impl ThreadRegistry {
    pub fn new(max_threads: usize) -> Self {
        Self {
            threads: RwSpinLock::new(BTreeMap::new()),
            next_id: AtomicI32::new(1),
            next_serial: AtomicI64::new(1),
            max_threads,
        }
    }

    /// Create an unpublished thread with a fresh id
    pub fn create(&self, name: &str, kernel_stack: KernelStack) -> Result<Reference<Thread>> {
        let threads = self.threads.read();
        if threads.len() >= self.max_threads {
            return Err(Error::NoMoreThreads);
        }
        let id = loop {
            let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id <= 0 {
                // Wrapped around
                self.next_id.store(2, Ordering::Relaxed);
                id = 1;
            }
            if !threads.contains_key(&ThreadId(id)) {
                break ThreadId(id);
            }
        };
        drop(threads);

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        Ok(Thread::new(id, serial, name, kernel_stack))
    }

    /// Publish a thread
    pub fn insert(&self, thread: &Reference<Thread>) -> Result<()> {
        let mut threads = self.threads.write();
        if threads.len() >= self.max_threads {
            return Err(Error::NoMoreThreads);
        }
        if threads.contains_key(&thread.id()) {
            return Err(Error::AlreadyExists);
        }
        threads.insert(thread.id(), thread.clone());
        Ok(())
    }

    /// Unpublish a thread; the registry's reference goes to the caller
    pub fn remove(&self, id: ThreadId) -> Option<Reference<Thread>> {
        self.threads.write().remove(&id)
    }

    /// Look a thread up and take a reference
    pub fn get(&self, id: ThreadId) -> Option<Reference<Thread>> {
        self.threads.read().get(&id).cloned()
    }

    /// Look a thread up, reference it and lock it
    ///
    /// The registry lock is dropped before the thread lock is taken; the
    /// thread is checked again afterwards and skipped if it was
    /// unpublished in between.
    pub fn get_and_lock(&self, id: ThreadId) -> Option<ThreadLocker> {
        let thread = self.get(id)?;
        let locked = LockedReference::lock(thread);

        let still_published = self
            .threads
            .read()
            .get(&id)
            .is_some_and(|current| Reference::ptr_eq(current, locked.reference()));
        still_published.then_some(locked)
    }

    pub fn is_alive(&self, id: ThreadId) -> bool {
        self.threads.read().contains_key(&id)
    }

    pub fn count(&self) -> usize {
        self.threads.read().len()
    }

    pub fn snapshot(&self) -> Vec<Reference<Thread>> {
        self.threads.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::signal::{SIGKILL, SIGUSR1};

    fn registry() -> ThreadRegistry {
        ThreadRegistry::new(16)
    }

    #[test]
    fn test_create_and_publish() {
        let threads = registry();
        let thread = threads.create("worker", KernelStack::default()).unwrap();
        assert_eq!(thread.state(), ThreadState::Suspended);
        assert_eq!(thread.priority(), priority::NORMAL);
        assert!(!threads.is_alive(thread.id()));

        threads.insert(&thread).unwrap();
        assert!(threads.is_alive(thread.id()));
        assert_eq!(threads.insert(&thread), Err(Error::AlreadyExists));
        assert_eq!(thread.reference_count().count(), 2);

        let found = threads.get(thread.id()).unwrap();
        assert!(Reference::ptr_eq(&found, &thread));
    }

    #[test]
    fn test_serial_numbers_are_unique() {
        let threads = registry();
        let a = threads.create("a", KernelStack::default()).unwrap();
        let b = threads.create("b", KernelStack::default()).unwrap();
        assert_ne!(a.serial_number(), b.serial_number());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_registry_capacity() {
        let threads = ThreadRegistry::new(1);
        let a = threads.create("a", KernelStack::default()).unwrap();
        threads.insert(&a).unwrap();
        assert_eq!(threads.create("b", KernelStack::default()).err(), Some(Error::NoMoreThreads));
    }

    #[test]
    fn test_get_and_lock_skips_removed_thread() {
        let threads = registry();
        let thread = threads.create("t", KernelStack::default()).unwrap();
        threads.insert(&thread).unwrap();

        {
            let locker = threads.get_and_lock(thread.id()).unwrap();
            assert!(locker.is_locked_by_current());
            assert_eq!(locker.locked().name.as_str(), "t");
        }
        assert!(!thread.lock.is_locked());

        let removed = threads.remove(thread.id()).unwrap();
        drop(removed);
        assert!(threads.get_and_lock(thread.id()).is_none());
        assert_eq!(thread.reference_count().count(), 1);
    }

    #[test]
    fn test_cpu_time() {
        let times = ThreadTimes {
            kernel_time: 10,
            user_time: 5,
            cpu_clock_offset: 0,
            last_time: 100,
            in_kernel: false,
            running: true,
        };
        assert_eq!(times.cpu_time_at(130, false), 45);
        assert_eq!(times.cpu_time_at(130, true), 15);
        assert_eq!(times.user_time_at(130), 35);
    }

    #[test]
    fn test_time_slices_charge_the_right_side() {
        let mut times = ThreadTimes::default();
        times.start_run(100);
        times.enter_kernel(110);
        times.leave_kernel(140);
        times.stop_run(145);
        assert_eq!(times.user_time, 15);
        assert_eq!(times.kernel_time, 30);
        assert_eq!(times.cpu_time_at(1_000, false), 45);
    }

    #[test]
    fn test_block_and_unblock() {
        let threads = registry();
        let thread = threads.create("t", KernelStack::default()).unwrap();
        let mut scheduling = thread.scheduler_lock();

        scheduling.prepare_to_block(true, WaitType::ConditionVariable, 0x10);
        assert_eq!(scheduling.block(), None);
        assert_eq!(scheduling.state, ThreadState::Waiting);
        assert!(scheduling.interrupt());
        assert_eq!(scheduling.state, ThreadState::Ready);
        assert!(!scheduling.unblock(Ok(())));
        assert_eq!(scheduling.wait.status, Some(Err(Error::Interrupted)));

        // An unblock that beats the block is not lost
        scheduling.prepare_to_block(false, WaitType::Snooze, 0);
        assert!(scheduling.unblock(Ok(())));
        assert_eq!(scheduling.block(), Some(Ok(())));
    }

    #[test]
    fn test_set_priority_clamps() {
        let threads = registry();
        let thread = threads.create("t", KernelStack::default()).unwrap();
        assert_eq!(thread.set_priority(500), Ok(priority::NORMAL));
        assert_eq!(thread.priority(), priority::MAX_SET);
        thread.set_priority(-3).unwrap();
        assert_eq!(thread.priority(), priority::MIN_SET);

        thread.scheduler_lock().priority = priority::IDLE;
        assert_eq!(thread.set_priority(10), Err(Error::NotAllowed));
    }

    #[test]
    fn test_exit_is_written_once_and_wakes_waiters() {
        let threads = registry();
        let thread = threads.create("t", KernelStack::default()).unwrap();

        let waiter = {
            let thread = thread.clone();
            std::thread::spawn(move || thread.wait_for_exit(Timeout::Relative(5_000_000)))
        };
        while thread.lock().exit_waiters.is_empty() {
            std::thread::yield_now();
        }

        let status = ThreadExitStatus { status: 3, reason: ThreadExitReason::Exited, signal: 0 };
        assert!(thread.exit(status));
        assert!(!thread.exit(ThreadExitStatus { status: 9, ..status }));
        assert_eq!(waiter.join().unwrap(), Ok(status));
        assert_eq!(thread.exit_status(), Some(status));
        assert_eq!(thread.state(), ThreadState::FreeOnReschedule);
        assert_eq!(thread.wait_for_exit(Timeout::Relative(0)), Ok(status));
    }

    #[test]
    fn test_wait_for_exit_times_out() {
        let threads = registry();
        let thread = threads.create("t", KernelStack::default()).unwrap();
        assert_eq!(thread.wait_for_exit(Timeout::Relative(1_000)), Err(Error::TimedOut));
        assert!(thread.lock().exit_waiters.is_empty());
    }

    #[test]
    fn test_signal_block_mask_keeps_kill() {
        let threads = registry();
        let thread = threads.create("t", KernelStack::default()).unwrap();
        thread.set_sig_block_mask(SignalSet::ALL);
        assert!(!thread.sig_block_mask().contains(SIGKILL));

        thread.add_pending_signal(SIGUSR1);
        thread.add_pending_signal(SIGKILL);
        assert_eq!(thread.dequeue_pending_signal().unwrap().number, SIGKILL);
        assert!(thread.dequeue_pending_signal().is_none());
        assert!(thread.pending_signals().contains(SIGUSR1));
    }

    #[test]
    fn test_pinning_nests() {
        let thread = registry().create("pinned", KernelStack::default()).unwrap();
        assert_eq!(thread.pin_to_current_cpu(), 1);
        assert_eq!(thread.pin_to_current_cpu(), 2);
        assert_eq!(thread.unpin(), 1);
        assert!(thread.is_pinned());
        assert_eq!(thread.unpin(), 0);
        assert!(!thread.is_pinned());
    }

    #[test]
    #[should_panic(expected = "unpinned more often than pinned")]
    fn test_unbalanced_unpin_is_fatal() {
        registry().create("loose", KernelStack::default()).unwrap().unpin();
    }

    #[test]
    fn test_thread_timers() {
        use crate::kern::user_timer::{TimerClock, REAL_TIME_ID};

        let thread = registry().create("timers", KernelStack::default()).unwrap();
        thread.add_user_timer(UserTimer::with_id(REAL_TIME_ID, TimerClock::RealTime, SIGUSR1));
        let id = thread.add_user_timer(UserTimer::new(TimerClock::ThreadTime(thread.id()), SIGUSR1));
        thread.add_user_timer(UserTimer::new(TimerClock::Monotonic, SIGUSR1));

        assert!(thread.remove_user_timer(id).is_some());
        assert_eq!(thread.delete_user_timers(true), 1);
        assert_eq!(thread.lock().user_timers.len(), 1);
        assert_eq!(thread.delete_user_timers(false), 0);
        assert!(thread.lock().user_timers.is_empty());
    }

    #[test]
    fn test_set_state_returns_previous() {
        let thread = registry().create("state", KernelStack::default()).unwrap();
        assert_eq!(thread.set_state(ThreadState::Ready), ThreadState::Suspended);
        assert_eq!(thread.state(), ThreadState::Ready);
    }

    #[test]
    fn test_thread_info() {
        let threads = registry();
        let thread = threads
            .create("info", KernelStack { area: Some(AreaId(4)), base: 0x1000, top: 0x5000 })
            .unwrap();
        let info = thread.info();
        assert_eq!(info.name.as_str(), "info");
        assert_eq!(info.stack_end - info.stack_base, 0x4000);
        assert_eq!(info.team, None);
    }
}

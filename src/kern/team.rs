//! Team Management
//!
//! A team is a process: a container for threads, an address space,
//! pending signals, user timers and job-control bookkeeping. Teams form a
//! tree (parent links are weak, child links counted) and belong to a
//! process group, which belongs to a session.
//!
//! # Locking
//!
//! The team lock guards the team's structure: state, parent/children,
//! group membership, thread list, job-control lists, exit information and
//! user timers. The required order is group, then parent, then child.
//! [`TeamLockSet`] takes these combinations the safe way: it locks the
//! team, *tries* the lock it should have taken first, and on failure
//! backs off, takes both in order and re-validates the link.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

use super::condition_variable::{ConditionVariable, ConditionVariableEntry};
use super::cpu::{self, Timeout};
use super::lock::{Mutex, MutexGuard, RwSpinLock, SeqLock, SpinLock};
use super::lock_order::LockClass;
use super::process_group::{GroupLocked, ProcessGroup};
use super::referenceable::{KernelReferenceable, Lockable, LockedReference, Reference, ReferenceCount};
use super::signal::{PendingSignals, QueuedSignalsCounter, Signal, SignalSet, SI_QUEUE};
use super::thread::Thread;
use super::user_timer::{UserTimer, UserTimerList};
use crate::config::{truncated_name, KernelConfig, Name};
use crate::types::{Bigtime, Error, ProcessGroupId, Result, SessionId, SignalNumber, TeamId, ThreadId};
use crate::vm::address_space::VmAddressSpace;

/// Id of the kernel team
pub const KERNEL_TEAM_ID: TeamId = TeamId(1);

// ============================================================================
// Team State
// ============================================================================

/// Lifecycle of a team; only moves forward, one step at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TeamState {
    /// Being constructed
    Birth,
    Normal,
    /// Being torn down; no new threads, timers or lookups
    Shutdown,
    /// Torn down
    Death,
}

impl TeamState {
    pub fn can_transition_to(self, next: TeamState) -> bool {
        matches!(
            (self, next),
            (TeamState::Birth, TeamState::Normal)
                | (TeamState::Normal, TeamState::Shutdown)
                | (TeamState::Shutdown, TeamState::Death)
        )
    }

    pub fn is_dying(self) -> bool {
        self >= TeamState::Shutdown
    }
}

// ============================================================================
// Exit and Job Control
// ============================================================================

/// What happened to a child, as reported to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    Exited,
    Killed,
    Dumped,
    Stopped,
    Continued,
}

/// Written once, when the team starts dying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamExitInfo {
    pub status: i32,
    pub reason: ChildEvent,
    pub signal: SignalNumber,
    pub signaling_user: u32,
}

/// Job-control state a team reports to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobControlState {
    #[default]
    None,
    Stopped,
    Continued,
    Dead,
}

/// A child event waiting to be collected by the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobControlEntry {
    pub team: TeamId,
    pub group_id: ProcessGroupId,
    pub state: JobControlState,
    pub signal: SignalNumber,
    pub signaling_user: u32,
    pub status: i32,
    pub reason: ChildEvent,
}

/// One of a parent's job-control lists
#[derive(Debug, Default)]
pub struct JobControlChildren {
    entries: VecDeque<JobControlEntry>,
}

impl JobControlChildren {
    fn add(&mut self, entry: JobControlEntry) {
        self.entries.push_back(entry);
    }

    fn remove_team(&mut self, team: TeamId) -> Option<JobControlEntry> {
        let index = self.entries.iter().position(|e| e.team == team)?;
        self.entries.remove(index)
    }

    /// First entry matching a wait target: a team id (> 0), any child
    /// (-1) or a process group (< -1)
    fn position(&self, target: i32) -> Option<usize> {
        self.entries.iter().position(|entry| {
            if target > 0 {
                entry.team.0 == target
            } else if target == -1 {
                true
            } else {
                entry.group_id.0 == -target
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobControlEntry> {
        self.entries.iter()
    }
}

/// Reaped-children bookkeeping
///
/// The CPU time of dead children survives the child team itself.
#[derive(Debug, Default)]
pub struct DeadChildren {
    pub list: JobControlChildren,
    pub count: u32,
    pub kernel_time: Bigtime,
    pub user_time: Bigtime,
}

/// Aggregate CPU time of reaped children
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildTimes {
    pub kernel_time: Bigtime,
    pub user_time: Bigtime,
}

bitflags::bitflags! {
    /// Options for [`Team::wait_for_child`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WaitFlags: u32 {
        const NO_HANG = 0x01;
        const UNTRACED = 0x02;
        const CONTINUED = 0x04;
        const EXITED = 0x08;
        /// Report the event but leave it for a later wait
        const NO_WAIT = 0x20;
    }
}

// ============================================================================
// Team Structure
// ============================================================================

/// Caps shared by every team of a kernel instance
#[derive(Debug)]
pub struct TeamLimits {
    max_user_defined_timers: i32,
    user_defined_timers: AtomicI32,
    max_user_timers_per_team: i32,
    max_queued_signals: i32,
}

impl TeamLimits {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            max_user_defined_timers: config.max_user_defined_timers,
            user_defined_timers: AtomicI32::new(0),
            max_user_timers_per_team: config.max_user_timers_per_team,
            max_queued_signals: config.max_queued_signals,
        }
    }

    pub fn max_user_timers_per_team(&self) -> i32 {
        self.max_user_timers_per_team
    }

    /// User-defined timers alive in the system
    pub fn user_defined_timers(&self) -> i32 {
        self.user_defined_timers.load(Ordering::Acquire)
    }

    pub fn max_user_defined_timers(&self) -> i32 {
        self.max_user_defined_timers
    }
}

struct ParentLink {
    id: TeamId,
    team: Weak<Team>,
}

/// State guarded by the team lock
pub struct TeamLocked {
    pub name: Name,
    pub args: String,
    state: TeamState,
    parent: Option<ParentLink>,
    children: Vec<Reference<Team>>,
    pub(crate) group: Option<Reference<ProcessGroup>>,
    pub(crate) group_id: ProcessGroupId,
    pub(crate) session_id: SessionId,
    threads: Vec<Reference<Thread>>,
    main_thread: Option<ThreadId>,
    pub(crate) job_control_state: JobControlState,
    pub dead_children: DeadChildren,
    pub stopped_children: JobControlChildren,
    pub continued_children: JobControlChildren,
    exit: Option<TeamExitInfo>,
    user_timers: UserTimerList,
}

impl TeamLocked {
    pub fn state(&self) -> TeamState {
        self.state
    }

    /// Advance the lifecycle by exactly one step
    pub fn set_state(&mut self, next: TeamState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::BadStateTransition);
        }
        self.state = next;
        Ok(())
    }

    pub fn parent_id(&self) -> Option<TeamId> {
        self.parent.as_ref().map(|link| link.id)
    }

    pub fn parent(&self) -> Option<Reference<Team>> {
        self.parent.as_ref().and_then(|link| Reference::upgrade(&link.team))
    }

    pub fn children(&self) -> &[Reference<Team>] {
        &self.children
    }

    pub fn group(&self) -> Option<&Reference<ProcessGroup>> {
        self.group.as_ref()
    }

    pub fn group_id(&self) -> ProcessGroupId {
        self.group_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn threads(&self) -> &[Reference<Thread>] {
        &self.threads
    }

    pub fn main_thread(&self) -> Option<ThreadId> {
        self.main_thread
    }

    pub fn job_control_state(&self) -> JobControlState {
        self.job_control_state
    }

    pub fn exit_info(&self) -> Option<TeamExitInfo> {
        self.exit
    }

    /// Record the exit information; later calls are ignored and return false
    pub fn set_exit_info(&mut self, info: TeamExitInfo) -> bool {
        if self.exit.is_some() {
            return false;
        }
        self.exit = Some(info);
        true
    }

    pub fn user_timers(&self) -> &UserTimerList {
        &self.user_timers
    }

    fn find_job_control_entry(&self, target: i32, flags: WaitFlags) -> Option<(JobControlState, usize)> {
        if flags.contains(WaitFlags::EXITED) {
            if let Some(index) = self.dead_children.list.position(target) {
                return Some((JobControlState::Dead, index));
            }
        }
        if flags.contains(WaitFlags::CONTINUED) {
            if let Some(index) = self.continued_children.position(target) {
                return Some((JobControlState::Continued, index));
            }
        }
        if flags.contains(WaitFlags::UNTRACED) {
            if let Some(index) = self.stopped_children.position(target) {
                return Some((JobControlState::Stopped, index));
            }
        }
        None
    }

    /// First child event matching a waitpid-style target and the state flags
    pub fn get_job_control_entry(&self, target: i32, flags: WaitFlags) -> Option<&JobControlEntry> {
        let (state, index) = self.find_job_control_entry(target, flags)?;
        self.list(state)?.entries.get(index)
    }

    /// Queue a child's event on the list for its state
    pub fn add_job_control_entry(&mut self, entry: JobControlEntry) {
        if entry.state == JobControlState::Dead {
            self.dead_children.count += 1;
        }
        if let Some(list) = self.list_for(entry.state) {
            list.add(entry);
        }
    }

    /// Drop the child's entry from the list for `state`
    pub fn remove_job_control_entry(&mut self, team: TeamId, state: JobControlState) -> Option<JobControlEntry> {
        let entry = self.list_for(state)?.remove_team(team)?;
        if state == JobControlState::Dead {
            self.dead_children.count -= 1;
        }
        Some(entry)
    }

    fn list(&self, state: JobControlState) -> Option<&JobControlChildren> {
        match state {
            JobControlState::Dead => Some(&self.dead_children.list),
            JobControlState::Stopped => Some(&self.stopped_children),
            JobControlState::Continued => Some(&self.continued_children),
            JobControlState::None => None,
        }
    }

    fn list_for(&mut self, state: JobControlState) -> Option<&mut JobControlChildren> {
        match state {
            JobControlState::Dead => Some(&mut self.dead_children.list),
            JobControlState::Stopped => Some(&mut self.stopped_children),
            JobControlState::Continued => Some(&mut self.continued_children),
            JobControlState::None => None,
        }
    }
}

/// CPU time of the team's dead threads, guarded by the time lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeamTimes {
    pub dead_threads_kernel_time: Bigtime,
    pub dead_threads_user_time: Bigtime,
    pub cpu_clock_offset: Bigtime,
    pub dead_threads: u32,
}

/// A team control block
pub struct Team {
    refs: ReferenceCount,
    id: TeamId,
    this: Weak<Team>,
    kernel: bool,
    lock: Mutex<TeamLocked>,
    time: SpinLock<TeamTimes>,
    children_times: SeqLock<ChildTimes>,
    signals: SpinLock<PendingSignals>,
    queued_signals: Reference<QueuedSignalsCounter>,
    dead_children_condition: ConditionVariable,
    user_defined_timers: AtomicI32,
    limits: Arc<TeamLimits>,
    address_space: SpinLock<Option<Reference<VmAddressSpace>>>,
}

impl Team {
    pub fn new(id: TeamId, name: &str, kernel: bool, limits: Arc<TeamLimits>) -> Reference<Self> {
        let queued_limit = if kernel { -1 } else { limits.max_queued_signals };
        Reference::new_cyclic(|this| Self {
            refs: ReferenceCount::new(),
            id,
            this: this.clone(),
            kernel,
            lock: Mutex::new(
                LockClass::Team,
                "team",
                TeamLocked {
                    name: truncated_name(name),
                    args: String::new(),
                    state: TeamState::Birth,
                    parent: None,
                    children: Vec::new(),
                    group: None,
                    group_id: ProcessGroupId(-1),
                    session_id: SessionId(-1),
                    threads: Vec::new(),
                    main_thread: None,
                    job_control_state: JobControlState::None,
                    dead_children: DeadChildren::default(),
                    stopped_children: JobControlChildren::default(),
                    continued_children: JobControlChildren::default(),
                    exit: None,
                    user_timers: UserTimerList::new(),
                },
            ),
            time: SpinLock::new(TeamTimes::default()),
            children_times: SeqLock::new(ChildTimes::default()),
            signals: SpinLock::new(PendingSignals::new()),
            queued_signals: QueuedSignalsCounter::new(queued_limit),
            dead_children_condition: ConditionVariable::new(),
            user_defined_timers: AtomicI32::new(0),
            limits,
            address_space: SpinLock::new(None),
        })
    }

    pub fn id(&self) -> TeamId {
        self.id
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn lock(&self) -> MutexGuard<'_, TeamLocked> {
        self.lock.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, TeamLocked>> {
        self.lock.try_lock()
    }

    pub fn is_locked_by_current(&self) -> bool {
        self.lock.is_locked_by_current()
    }

    pub fn state(&self) -> TeamState {
        self.lock.lock().state
    }

    pub fn set_state(&self, next: TeamState) -> Result<()> {
        let mut locked = self.lock.lock();
        let previous = locked.state;
        locked.set_state(next)?;
        log::debug!("team {}: {:?} -> {:?}", self.id, previous, next);
        Ok(())
    }

    pub fn name(&self) -> Name {
        self.lock.lock().name.clone()
    }

    pub fn exit_info(&self) -> Option<TeamExitInfo> {
        self.lock.lock().exit
    }

    pub(crate) fn weak(&self) -> Weak<Team> {
        self.this.clone()
    }

    pub fn time_lock(&self) -> super::lock::SpinLockGuard<'_, TeamTimes> {
        self.time.lock()
    }

    // === Tree ===

    /// Make `child` a child of this team; both locks must be free
    pub fn insert_child(&self, child: &Reference<Team>) {
        self.lock.lock().children.push(child.clone());
        child.lock.lock().parent = Some(ParentLink {
            id: self.id,
            team: self.weak(),
        });
    }

    /// Unlink `child`; returns the reference the child list held
    pub fn remove_child(&self, child: TeamId) -> Option<Reference<Team>> {
        let removed = {
            let mut locked = self.lock.lock();
            let index = locked.children.iter().position(|c| c.id == child)?;
            locked.children.remove(index)
        };
        let mut child_locked = removed.lock.lock();
        if child_locked.parent_id() == Some(self.id) {
            child_locked.parent = None;
        }
        drop(child_locked);
        Some(removed)
    }

    // === Threads ===

    /// Attach a thread; the first one becomes the main thread
    pub fn add_thread(&self, thread: &Reference<Thread>) -> Result<()> {
        let mut locked = self.lock.lock();
        if locked.state.is_dying() {
            return Err(Error::BadTeamId);
        }
        if locked.threads.is_empty() {
            locked.main_thread = Some(thread.id());
        }
        locked.threads.push(thread.clone());
        thread.set_team(Some((self.id, self.weak())));
        Ok(())
    }

    /// Detach a thread, folding its CPU time into the dead-thread totals
    pub fn remove_thread(&self, id: ThreadId) -> Option<Reference<Thread>> {
        let mut locked = self.lock.lock();
        let index = locked.threads.iter().position(|t| t.id() == id)?;
        let thread = locked.threads.remove(index);

        let times = *thread.time_lock();
        {
            let mut team_times = self.time.lock();
            team_times.dead_threads_kernel_time += times.kernel_time;
            team_times.dead_threads_user_time += times.user_time;
            team_times.dead_threads += 1;
        }
        thread.set_team(None);
        Some(thread)
    }

    pub fn thread_count(&self) -> usize {
        self.lock.lock().threads.len()
    }

    /// Total CPU time of live and dead threads
    pub fn cpu_time(&self, ignore_current_run: bool) -> Bigtime {
        let locked = self.lock.lock();
        let now = cpu::system_time();
        let times = *self.time.lock();

        let mut total = times.dead_threads_kernel_time + times.dead_threads_user_time + times.cpu_clock_offset;
        for thread in &locked.threads {
            total += thread.time_lock().cpu_time_at(now, ignore_current_run);
        }
        total
    }

    /// User CPU time of live and dead threads
    pub fn user_cpu_time(&self) -> Bigtime {
        let locked = self.lock.lock();
        let now = cpu::system_time();

        let mut total = self.time.lock().dead_threads_user_time;
        for thread in &locked.threads {
            total += thread.time_lock().user_time_at(now);
        }
        total
    }

    /// CPU time of reaped children; lock-free
    pub fn children_cpu_times(&self) -> ChildTimes {
        self.children_times.read()
    }

    // === User timers ===

    /// Attach a timer; returns its id
    ///
    /// Refused once the team is shutting down. User-defined timers must
    /// also pass [`Team::check_add_user_defined_timer`].
    pub fn add_user_timer(&self, timer: UserTimer) -> Result<i32> {
        let mut locked = self.lock.lock();
        if locked.state.is_dying() {
            return Err(Error::BadTeamId);
        }

        if timer.is_user_defined() {
            if !self.check_add_user_defined_timer() {
                log::warn!("team {}: user-defined timer limit reached", self.id);
                return Err(Error::NoMoreTimers);
            }
            let replaced = locked
                .user_timers
                .timer_for(timer.id())
                .is_some_and(|old| old.is_user_defined());
            if replaced {
                self.user_defined_timers_removed(1);
            }
        }
        Ok(locked.user_timers.add_timer(timer))
    }

    pub fn remove_user_timer(&self, id: i32) -> Option<UserTimer> {
        let timer = self.lock.lock().user_timers.remove_timer(id)?;
        if timer.is_user_defined() {
            self.user_defined_timers_removed(1);
        }
        Some(timer)
    }

    /// Drop timers; returns how many user-defined ones went
    pub fn delete_user_timers(&self, user_defined_only: bool) -> usize {
        let count = self.lock.lock().user_timers.delete_timers(user_defined_only);
        self.user_defined_timers_removed(count as i32);
        count
    }

    /// Reserve room for one more user-defined timer
    ///
    /// Both the per-team and the system-wide cap apply. Either both counts
    /// go up by one, or neither does.
    pub fn check_add_user_defined_timer(&self) -> bool {
        let previous = self.user_defined_timers.fetch_add(1, Ordering::AcqRel);
        if previous >= self.limits.max_user_timers_per_team {
            self.user_defined_timers.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        let previous = self.limits.user_defined_timers.fetch_add(1, Ordering::AcqRel);
        if previous >= self.limits.max_user_defined_timers {
            self.limits.user_defined_timers.fetch_sub(1, Ordering::AcqRel);
            self.user_defined_timers.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Return reservations of `count` user-defined timers
    pub fn user_defined_timers_removed(&self, count: i32) {
        if count == 0 {
            return;
        }
        self.user_defined_timers.fetch_sub(count, Ordering::AcqRel);
        self.limits.user_defined_timers.fetch_sub(count, Ordering::AcqRel);
    }

    pub fn user_defined_timer_count(&self) -> i32 {
        self.user_defined_timers.load(Ordering::Acquire)
    }

    // === Signals ===

    pub fn add_pending_signal(&self, number: SignalNumber) {
        self.signals.lock().add_signal(number);
    }

    /// Queue a signal with its details
    ///
    /// Past the queued-signal limit, `sigqueue` signals fail with
    /// [`Error::WouldBlock`] and the rest degrade to unqueued ones.
    pub fn add_pending_signal_queued(&self, signal: Signal) -> Result<()> {
        match signal.charge_to(&self.queued_signals) {
            Ok(signal) => {
                self.signals.lock().add_queued_signal(Reference::new(signal));
                Ok(())
            }
            Err(signal) if signal.code == SI_QUEUE => Err(Error::WouldBlock),
            Err(signal) => {
                self.signals.lock().add_signal(signal.number);
                Ok(())
            }
        }
    }

    pub fn remove_pending_signal(&self, number: SignalNumber) {
        self.signals.lock().remove_signal(number);
    }

    pub fn remove_pending_signals(&self, mask: SignalSet) {
        self.signals.lock().remove_signals(mask);
    }

    pub fn pending_signals(&self) -> SignalSet {
        self.signals.lock().all_signals()
    }

    pub fn highest_pending_signal_priority(&self, non_blocked: SignalSet) -> Option<i32> {
        self.signals.lock().highest_signal_priority(non_blocked)
    }

    pub fn dequeue_pending_signal(&self, non_blocked: SignalSet) -> Option<Reference<Signal>> {
        self.signals.lock().dequeue_signal(non_blocked)
    }

    pub fn queued_signal_count(&self) -> i32 {
        self.queued_signals.count()
    }

    // === Address space ===

    pub fn address_space(&self) -> Option<Reference<VmAddressSpace>> {
        self.address_space.lock().clone()
    }

    pub fn set_address_space(&self, space: Option<Reference<VmAddressSpace>>) -> Option<Reference<VmAddressSpace>> {
        core::mem::replace(&mut *self.address_space.lock(), space)
    }

    // === Waiting for children ===

    /// Collect a child event, like `waitpid`
    ///
    /// `child` selects a team id (> 0), any child (-1), the caller's own
    /// group (0) or a group (< -1). Without a state flag, only exits are
    /// reported.
    pub fn wait_for_child(&self, child: i32, flags: WaitFlags, timeout: Timeout) -> Result<JobControlEntry> {
        let mut flags = flags;
        if !flags.intersects(WaitFlags::EXITED | WaitFlags::UNTRACED | WaitFlags::CONTINUED) {
            flags |= WaitFlags::EXITED;
        }
        let timeout = match timeout.deadline() {
            Some(deadline) if !timeout.is_poll() => Timeout::Absolute(deadline),
            _ => timeout,
        };

        loop {
            let entry = ConditionVariableEntry::new();
            {
                let mut locked = self.lock.lock();
                let target = if child == 0 { -locked.group_id.0 } else { child };

                if let Some((state, index)) = locked.find_job_control_entry(target, flags) {
                    let no_wait = flags.contains(WaitFlags::NO_WAIT);
                    let Some(list) = locked.list_for(state) else {
                        return Err(Error::EntryNotFound);
                    };
                    let found = if no_wait {
                        list.entries.get(index).copied()
                    } else {
                        list.entries.remove(index)
                    };
                    if state == JobControlState::Dead && !no_wait {
                        locked.dead_children.count -= 1;
                    }
                    return found.ok_or(Error::EntryNotFound);
                }

                if !Self::has_matching_child(&locked, target) {
                    return Err(Error::EntryNotFound);
                }
                if flags.contains(WaitFlags::NO_HANG) {
                    return Err(Error::WouldBlock);
                }
                self.dead_children_condition.add(&entry);
            }
            entry.wait(timeout)?;
        }
    }

    fn has_matching_child(locked: &TeamLocked, target: i32) -> bool {
        if target > 0 {
            locked.children.iter().any(|child| child.id.0 == target)
        } else if target == -1 {
            !locked.children.is_empty()
        } else {
            locked
                .children
                .iter()
                .any(|child| child.lock.lock().group_id.0 == -target)
        }
    }

    pub fn info(&self) -> TeamInfo {
        let locked = self.lock.lock();
        TeamInfo {
            team: self.id,
            name: locked.name.clone(),
            state: locked.state,
            thread_count: locked.threads.len(),
            parent: locked.parent_id(),
            group_id: locked.group_id,
            session_id: locked.session_id,
        }
    }
}

impl KernelReferenceable for Team {
    fn reference_count(&self) -> &ReferenceCount {
        &self.refs
    }

    fn last_reference_released(&self) {
        let timers = self.user_defined_timers.swap(0, Ordering::AcqRel);
        if timers > 0 {
            self.limits.user_defined_timers.fetch_sub(timers, Ordering::AcqRel);
        }
        self.signals.lock().clear();
        log::debug!("team {} released", self.id);
    }
}

impl Lockable for Team {
    type Locked = TeamLocked;

    fn object_lock(&self) -> &Mutex<TeamLocked> {
        &self.lock
    }
}

impl fmt::Debug for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Team")
            .field("id", &self.id)
            .field("kernel", &self.kernel)
            .field("refs", &self.refs)
            .finish()
    }
}

/// Team information snapshot
#[derive(Debug, Clone)]
pub struct TeamInfo {
    pub team: TeamId,
    pub name: Name,
    pub state: TeamState,
    pub thread_count: usize,
    pub parent: Option<TeamId>,
    pub group_id: ProcessGroupId,
    pub session_id: SessionId,
}

/// A team reference whose team lock is held
pub type TeamLocker = LockedReference<Team>;

// ============================================================================
// Composite Lockers
// ============================================================================

/// A team locked together with its parent and/or process group
///
/// Dropping the set unlocks everything it holds.
pub struct TeamLockSet {
    team: Reference<Team>,
    parent: Option<Reference<Team>>,
    group: Option<Reference<ProcessGroup>>,
}

impl TeamLockSet {
    /// Lock `team` and its parent
    ///
    /// With `dont_lock_parent_if_kernel`, a kernel-team parent is left
    /// unlocked and [`TeamLockSet::parent`] returns `None`.
    pub fn lock_team_and_parent(team: &Reference<Team>, dont_lock_parent_if_kernel: bool) -> Self {
        team.lock.raw_lock();
        let parent = Self::lock_parent_of_locked(team, dont_lock_parent_if_kernel);
        Self {
            team: team.clone(),
            parent,
            group: None,
        }
    }

    /// Lock `team` and its process group
    pub fn lock_team_and_process_group(team: &Reference<Team>) -> Self {
        team.lock.raw_lock();
        loop {
            // SAFETY: the team lock is held
            let group = unsafe { &*team.lock.data_ptr() }.group.clone();
            let Some(group) = group else {
                return Self {
                    team: team.clone(),
                    parent: None,
                    group: None,
                };
            };

            if group.object_lock().raw_try_lock() {
                return Self {
                    team: team.clone(),
                    parent: None,
                    group: Some(group),
                };
            }

            // Group first, then the team again
            unsafe { team.lock.raw_unlock() };
            group.object_lock().raw_lock();
            team.lock.raw_lock();

            // SAFETY: the team lock is held
            let unchanged = unsafe { &*team.lock.data_ptr() }
                .group
                .as_ref()
                .is_some_and(|current| Reference::ptr_eq(current, &group));
            if unchanged {
                return Self {
                    team: team.clone(),
                    parent: None,
                    group: Some(group),
                };
            }
            unsafe { group.object_lock().raw_unlock() };
        }
    }

    /// Lock `team`, its parent and its process group
    pub fn lock_team_parent_and_process_group(team: &Reference<Team>) -> Self {
        let mut set = Self::lock_team_and_process_group(team);
        // The group lock is held, so the team cannot change groups while
        // the parent lock is being sorted out
        set.parent = Self::lock_parent_of_locked(team, false);
        set
    }

    /// With `team` locked, lock its parent, backing off if needed
    fn lock_parent_of_locked(team: &Reference<Team>, dont_lock_parent_if_kernel: bool) -> Option<Reference<Team>> {
        loop {
            // SAFETY: the team lock is held
            let parent = unsafe { &*team.lock.data_ptr() }.parent()?;
            if dont_lock_parent_if_kernel && parent.is_kernel() {
                return None;
            }
            if parent.lock.raw_try_lock() {
                return Some(parent);
            }

            // Parent first, then the team again
            unsafe { team.lock.raw_unlock() };
            parent.lock.raw_lock();
            team.lock.raw_lock();

            // SAFETY: the team lock is held
            if unsafe { &*team.lock.data_ptr() }.parent_id() == Some(parent.id) {
                return Some(parent);
            }
            unsafe { parent.lock.raw_unlock() };
        }
    }

    pub fn team(&self) -> &Reference<Team> {
        &self.team
    }

    pub fn parent(&self) -> Option<&Reference<Team>> {
        self.parent.as_ref()
    }

    pub fn group(&self) -> Option<&Reference<ProcessGroup>> {
        self.group.as_ref()
    }

    pub fn team_data(&self) -> &TeamLocked {
        unsafe { &*self.team.lock.data_ptr() }
    }

    pub fn team_data_mut(&mut self) -> &mut TeamLocked {
        unsafe { &mut *self.team.lock.data_ptr() }
    }

    pub fn parent_data(&self) -> Option<&TeamLocked> {
        self.parent.as_ref().map(|p| unsafe { &*p.lock.data_ptr() })
    }

    pub fn parent_data_mut(&mut self) -> Option<&mut TeamLocked> {
        self.parent.as_ref().map(|p| unsafe { &mut *p.lock.data_ptr() })
    }

    pub fn group_data(&self) -> Option<&GroupLocked> {
        self.group.as_ref().map(|g| unsafe { &*g.object_lock().data_ptr() })
    }

    pub fn group_data_mut(&mut self) -> Option<&mut GroupLocked> {
        self.group.as_ref().map(|g| unsafe { &mut *g.object_lock().data_ptr() })
    }

    /// Report a job-control state change to the parent
    ///
    /// Moves the team's entry into the parent's matching list and wakes
    /// the parent's waiters. A dead child's CPU time, including that of
    /// its own reaped children, is added to the parent's totals. Needs
    /// the parent locked; without a parent only the state is recorded.
    pub fn set_job_control_state(&mut self, state: JobControlState, signal: Option<&Signal>) {
        let team_id = self.team.id;
        let (old_state, group_id, exit, own_dead_children) = {
            let data = self.team_data();
            (
                data.job_control_state,
                data.group_id,
                data.exit,
                ChildTimes {
                    kernel_time: data.dead_children.kernel_time,
                    user_time: data.dead_children.user_time,
                },
            )
        };
        if old_state == state {
            return;
        }
        self.team_data_mut().job_control_state = state;

        let Some(parent) = self.parent.clone() else {
            return;
        };

        let entry = JobControlEntry {
            team: team_id,
            group_id,
            state,
            signal: signal.map_or(0, |s| s.number),
            signaling_user: signal.map_or(0, |s| s.sending_user),
            status: exit.map_or(0, |e| e.status),
            reason: match state {
                JobControlState::Stopped => ChildEvent::Stopped,
                JobControlState::Continued => ChildEvent::Continued,
                _ => exit.map_or(ChildEvent::Exited, |e| e.reason),
            },
        };
        let thread_times = *self.team.time.lock();

        let Some(parent_data) = self.parent_data_mut() else {
            return;
        };
        parent_data.remove_job_control_entry(team_id, old_state);
        if state == JobControlState::None {
            return;
        }
        if state == JobControlState::Dead && parent.is_kernel() {
            // The kernel team never waits; its children are reaped here
            log::trace!("team {} reaped by the kernel team", team_id);
            return;
        }
        parent_data.add_job_control_entry(entry);

        if state == JobControlState::Dead {
            parent_data.dead_children.kernel_time +=
                thread_times.dead_threads_kernel_time + own_dead_children.kernel_time;
            parent_data.dead_children.user_time +=
                thread_times.dead_threads_user_time + own_dead_children.user_time;
            let totals = ChildTimes {
                kernel_time: parent_data.dead_children.kernel_time,
                user_time: parent_data.dead_children.user_time,
            };
            parent.children_times.write(|times| *times = totals);
        }
        parent.dead_children_condition.notify_all();
    }

    /// Unlink the team from its parent and take its children
    ///
    /// Needs the parent locked. The children still name this team as
    /// their parent until the caller inserts them elsewhere, which must
    /// happen after the set is dropped.
    pub fn detach_from_parent(&mut self) -> Vec<Reference<Team>> {
        let team_id = self.team.id;
        if let Some(parent_data) = self.parent_data_mut() {
            parent_data.children.retain(|child| child.id != team_id);
        }
        self.team_data_mut().parent = None;
        core::mem::take(&mut self.team_data_mut().children)
    }
}

impl Drop for TeamLockSet {
    fn drop(&mut self) {
        unsafe {
            if let Some(parent) = &self.parent {
                parent.lock.raw_unlock();
            }
            self.team.lock.raw_unlock();
            if let Some(group) = &self.group {
                group.object_lock().raw_unlock();
            }
        }
    }
}

// ============================================================================
// Team Registry
// ============================================================================

/// All published teams, by id
pub struct TeamRegistry {
    teams: RwSpinLock<BTreeMap<TeamId, Reference<Team>>>,
    next_id: AtomicI32,
    max_teams: usize,
    limits: Arc<TeamLimits>,
    kernel_team: spin::Once<Reference<Team>>,
}

impl TeamRegistry {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            teams: RwSpinLock::new(BTreeMap::new()),
            next_id: AtomicI32::new(KERNEL_TEAM_ID.0),
            max_teams: config.max_teams,
            limits: Arc::new(TeamLimits::new(config)),
            kernel_team: spin::Once::new(),
        }
    }

    pub fn limits(&self) -> &Arc<TeamLimits> {
        &self.limits
    }

    /// Create and publish the kernel team
    pub fn bootstrap(&self) -> Result<Reference<Team>> {
        let team = Team::new(KERNEL_TEAM_ID, "kernel_team", true, Arc::clone(&self.limits));
        team.set_state(TeamState::Normal)?;
        self.next_id.fetch_max(KERNEL_TEAM_ID.0 + 1, Ordering::Relaxed);
        self.insert(&team)?;
        self.kernel_team.call_once(|| team.clone());
        log::info!("kernel team {} created", team.id());
        Ok(team)
    }

    pub fn kernel_team(&self) -> Option<&Reference<Team>> {
        self.kernel_team.get()
    }

    /// Create an unpublished user team with a fresh id
    pub fn create(&self, name: &str) -> Result<Reference<Team>> {
        let teams = self.teams.read();
        if teams.len() >= self.max_teams {
            return Err(Error::NoMoreTeams);
        }
        let id = loop {
            let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id <= KERNEL_TEAM_ID.0 {
                self.next_id.store(KERNEL_TEAM_ID.0 + 2, Ordering::Relaxed);
                id = KERNEL_TEAM_ID.0 + 1;
            }
            if !teams.contains_key(&TeamId(id)) {
                break TeamId(id);
            }
        };
        drop(teams);

        Ok(Team::new(id, name, false, Arc::clone(&self.limits)))
    }

    pub fn insert(&self, team: &Reference<Team>) -> Result<()> {
        let mut teams = self.teams.write();
        if teams.len() >= self.max_teams {
            return Err(Error::NoMoreTeams);
        }
        if teams.contains_key(&team.id()) {
            return Err(Error::AlreadyExists);
        }
        teams.insert(team.id(), team.clone());
        Ok(())
    }

    /// Unpublish a team; the registry's reference goes to the caller
    pub fn remove(&self, id: TeamId) -> Option<Reference<Team>> {
        self.teams.write().remove(&id)
    }

    pub fn get(&self, id: TeamId) -> Option<Reference<Team>> {
        self.teams.read().get(&id).cloned()
    }

    /// Look a team up, reference it and lock it
    ///
    /// Teams that are shutting down or dead are treated as gone.
    pub fn get_and_lock(&self, id: TeamId) -> Option<TeamLocker> {
        let team = self.get(id)?;
        let locked = LockedReference::lock(team);
        if locked.locked().state.is_dying() {
            return None;
        }
        Some(locked)
    }

    pub fn is_alive(&self, id: TeamId) -> bool {
        self.teams.read().contains_key(&id)
    }

    pub fn count(&self) -> usize {
        self.teams.read().len()
    }

    pub fn snapshot(&self) -> Vec<Reference<Team>> {
        self.teams.read().values().cloned().collect()
    }
}

//! User timers
//!
//! Ids below [`FIRST_USER_DEFINED_ID`] name the built-in timers every
//! team and thread may have; the rest are created through the timer
//! syscalls and count against the system-wide limit.

use alloc::vec::Vec;

use super::cpu;
use crate::types::{Bigtime, SignalNumber, TeamId, ThreadId};

pub const REAL_TIME_ID: i32 = 0;
pub const TEAM_TOTAL_TIME_ID: i32 = 1;
pub const TEAM_USER_TIME_ID: i32 = 2;
pub const FIRST_USER_DEFINED_ID: i32 = 3;

/// The clock a timer runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerClock {
    RealTime,
    Monotonic,
    TeamTotalTime(TeamId),
    TeamUserTime(TeamId),
    ThreadTime(ThreadId),
}

/// A timer that sends a signal when it fires
#[derive(Debug, Clone)]
pub struct UserTimer {
    id: i32,
    pub clock: TimerClock,
    pub signal: SignalNumber,
    next_time: Option<Bigtime>,
    interval: Bigtime,
    overrun_count: u32,
}

/// Snapshot returned by [`UserTimer::info`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTimerInfo {
    pub remaining_time: Option<Bigtime>,
    pub interval: Bigtime,
    pub overrun_count: u32,
}

impl UserTimer {
    /// A user-defined timer; the list assigns its id
    pub fn new(clock: TimerClock, signal: SignalNumber) -> Self {
        Self::with_id(-1, clock, signal)
    }

    /// A timer with a fixed id, e.g. one of the built-in ones
    pub fn with_id(id: i32, clock: TimerClock, signal: SignalNumber) -> Self {
        Self {
            id,
            clock,
            signal,
            next_time: None,
            interval: 0,
            overrun_count: 0,
        }
    }

    /// -1 until the timer is added to a list
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Whether the timer counts against the user-defined limit
    pub fn is_user_defined(&self) -> bool {
        self.id < 0 || self.id >= FIRST_USER_DEFINED_ID
    }

    /// Arm the timer; an `interval` of zero makes it one-shot
    pub fn schedule(&mut self, next_time: Bigtime, interval: Bigtime) {
        self.next_time = Some(next_time);
        self.interval = interval.max(0);
        self.overrun_count = 0;
    }

    pub fn cancel(&mut self) {
        self.next_time = None;
        self.interval = 0;
    }

    pub fn is_scheduled(&self) -> bool {
        self.next_time.is_some()
    }

    /// Advance the timer to `now`; returns true if it fired
    ///
    /// Periodic timers that missed expirations count them as overruns.
    pub fn check(&mut self, now: Bigtime) -> bool {
        let next = match self.next_time {
            Some(next) if next <= now => next,
            _ => return false,
        };

        if self.interval > 0 {
            let missed = (now - next) / self.interval;
            self.overrun_count = self.overrun_count.saturating_add(missed as u32);
            self.next_time = Some(next + (missed + 1) * self.interval);
        } else {
            self.next_time = None;
        }
        true
    }

    pub fn info(&self) -> UserTimerInfo {
        self.info_at(cpu::system_time())
    }

    pub fn info_at(&self, now: Bigtime) -> UserTimerInfo {
        UserTimerInfo {
            remaining_time: self.next_time.map(|next| (next - now).max(0)),
            interval: self.interval,
            overrun_count: self.overrun_count,
        }
    }
}

/// Timers of one team or thread, ordered by id
#[derive(Debug, Default)]
pub struct UserTimerList {
    timers: Vec<UserTimer>,
}

impl UserTimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timer_for(&self, id: i32) -> Option<&UserTimer> {
        self.index_of(id).map(|index| &self.timers[index])
    }

    pub fn timer_for_mut(&mut self, id: i32) -> Option<&mut UserTimer> {
        self.index_of(id).map(move |index| &mut self.timers[index])
    }

    /// Insert `timer`, assigning the lowest free user-defined id if it has none
    ///
    /// A timer whose id is taken replaces the old one.
    pub fn add_timer(&mut self, mut timer: UserTimer) -> i32 {
        if timer.id < 0 {
            timer.id = self.free_user_defined_id();
        }
        let id = timer.id;
        match self.timers.binary_search_by_key(&id, |t| t.id) {
            Ok(index) => self.timers[index] = timer,
            Err(index) => self.timers.insert(index, timer),
        }
        id
    }

    pub fn remove_timer(&mut self, id: i32) -> Option<UserTimer> {
        self.index_of(id).map(|index| self.timers.remove(index))
    }

    /// Cancel and drop timers; returns how many user-defined ones went
    pub fn delete_timers(&mut self, user_defined_only: bool) -> usize {
        let before = self.user_defined_count();
        self.timers
            .retain(|timer| user_defined_only && !timer.is_user_defined());
        before - self.user_defined_count()
    }

    pub fn user_defined_count(&self) -> usize {
        self.timers.iter().filter(|t| t.is_user_defined()).count()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserTimer> {
        self.timers.iter()
    }

    fn index_of(&self, id: i32) -> Option<usize> {
        self.timers.binary_search_by_key(&id, |t| t.id).ok()
    }

    fn free_user_defined_id(&self) -> i32 {
        let mut candidate = FIRST_USER_DEFINED_ID;
        for timer in self.timers.iter().filter(|t| t.id >= FIRST_USER_DEFINED_ID) {
            if timer.id != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }
}

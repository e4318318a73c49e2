//! Signals, signal sets and pending-signal bookkeeping

use alloc::collections::VecDeque;
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

use super::referenceable::{KernelReferenceable, Reference, ReferenceCount};
use crate::config::{MAX_SIGNAL_NUMBER, SIGNAL_REALTIME_MAX, SIGNAL_REALTIME_MIN};
use crate::types::{SignalNumber, TeamId};

pub const SIGHUP: SignalNumber = 1;
pub const SIGINT: SignalNumber = 2;
pub const SIGQUIT: SignalNumber = 3;
pub const SIGILL: SignalNumber = 4;
pub const SIGCHLD: SignalNumber = 5;
pub const SIGABRT: SignalNumber = 6;
pub const SIGPIPE: SignalNumber = 7;
pub const SIGFPE: SignalNumber = 8;
pub const SIGKILL: SignalNumber = 9;
pub const SIGSTOP: SignalNumber = 10;
pub const SIGSEGV: SignalNumber = 11;
pub const SIGCONT: SignalNumber = 12;
pub const SIGTSTP: SignalNumber = 13;
pub const SIGALRM: SignalNumber = 14;
pub const SIGTERM: SignalNumber = 15;
pub const SIGTTIN: SignalNumber = 16;
pub const SIGTTOU: SignalNumber = 17;
pub const SIGUSR1: SignalNumber = 18;
pub const SIGUSR2: SignalNumber = 19;
pub const SIGWINCH: SignalNumber = 20;
pub const SIGKILLTHR: SignalNumber = 21;
pub const SIGTRAP: SignalNumber = 22;
pub const SIGPOLL: SignalNumber = 23;
pub const SIGPROF: SignalNumber = 24;
pub const SIGSYS: SignalNumber = 25;
pub const SIGURG: SignalNumber = 26;
pub const SIGVTALRM: SignalNumber = 27;
pub const SIGXCPU: SignalNumber = 28;
pub const SIGXFSZ: SignalNumber = 29;
pub const SIGBUS: SignalNumber = 30;

/// Signal codes
pub const SI_USER: i32 = 0;
pub const SI_QUEUE: i32 = -1;
pub const SI_TIMER: i32 = -2;

pub fn is_valid_signal(number: SignalNumber) -> bool {
    (1..=MAX_SIGNAL_NUMBER).contains(&number)
}

pub fn is_realtime_signal(number: SignalNumber) -> bool {
    (SIGNAL_REALTIME_MIN..=SIGNAL_REALTIME_MAX).contains(&number)
}

/// Delivery priority; higher is delivered first
///
/// Signals that kill or stop cannot wait behind anything else. The rest
/// go lowest number first, so standard signals precede realtime ones.
pub fn signal_priority(number: SignalNumber) -> i32 {
    match number {
        SIGKILL => 1000,
        SIGKILLTHR => 999,
        SIGSTOP => 998,
        SIGCONT => 997,
        _ => (MAX_SIGNAL_NUMBER + 1 - number) as i32,
    }
}

/// A set of signals; bit `n - 1` stands for signal `n`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SignalSet(pub u64);

impl SignalSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(u64::MAX);

    /// Signals that can be neither blocked nor ignored
    pub const NON_BLOCKABLE: Self =
        Self(Self::bit(SIGKILL) | Self::bit(SIGSTOP) | Self::bit(SIGKILLTHR));

    /// Signals that stop a team
    pub const STOP_SIGNALS: Self =
        Self(Self::bit(SIGSTOP) | Self::bit(SIGTSTP) | Self::bit(SIGTTIN) | Self::bit(SIGTTOU));

    const fn bit(number: SignalNumber) -> u64 {
        1u64 << (number - 1)
    }

    pub const fn from_signal(number: SignalNumber) -> Self {
        Self(Self::bit(number))
    }

    pub const fn contains(&self, number: SignalNumber) -> bool {
        self.0 & Self::bit(number) != 0
    }

    pub fn insert(&mut self, number: SignalNumber) {
        self.0 |= Self::bit(number);
    }

    pub fn remove(&mut self, number: SignalNumber) {
        self.0 &= !Self::bit(number);
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Members in ascending order
    pub fn iter(&self) -> impl Iterator<Item = SignalNumber> + '_ {
        (1..=MAX_SIGNAL_NUMBER).filter(move |&n| self.contains(n))
    }

    /// The member with the highest delivery priority
    pub fn highest_priority(&self) -> Option<SignalNumber> {
        self.iter().max_by_key(|&n| signal_priority(n))
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalSet({:#x})", self.0)
    }
}

// ============================================================================
// Queued signal accounting
// ============================================================================

/// Counts the queued signals charged to one team
pub struct QueuedSignalsCounter {
    refs: ReferenceCount,
    limit: i32,
    count: AtomicI32,
}

impl QueuedSignalsCounter {
    /// `limit < 0` means unlimited
    pub fn new(limit: i32) -> Reference<Self> {
        Reference::new(Self {
            refs: ReferenceCount::new(),
            limit,
            count: AtomicI32::new(0),
        })
    }

    /// Charge one signal; false if the limit is reached
    pub fn increment(&self) -> bool {
        let previous = self.count.fetch_add(1, Ordering::AcqRel);
        if self.limit >= 0 && previous >= self.limit {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn decrement(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }
}

impl KernelReferenceable for QueuedSignalsCounter {
    fn reference_count(&self) -> &ReferenceCount {
        &self.refs
    }
}

// ============================================================================
// Signal
// ============================================================================

/// A signal instance with its delivery details
pub struct Signal {
    refs: ReferenceCount,
    pub number: SignalNumber,
    pub code: i32,
    pub errno: i32,
    pub sending_team: TeamId,
    pub sending_user: u32,
    pub value: u64,
    counter: Option<Reference<QueuedSignalsCounter>>,
}

impl Signal {
    pub fn new(number: SignalNumber, code: i32, errno: i32, sending_team: TeamId) -> Self {
        Self {
            refs: ReferenceCount::new(),
            number,
            code,
            errno,
            sending_team,
            sending_user: 0,
            value: 0,
            counter: None,
        }
    }

    pub fn with_value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }

    /// Charge this signal to `counter` for as long as it is alive
    ///
    /// Returns the signal back when the counter is exhausted.
    pub fn charge_to(
        mut self,
        counter: &Reference<QueuedSignalsCounter>,
    ) -> core::result::Result<Self, Self> {
        if !counter.increment() {
            return Err(self);
        }
        self.counter = Some(counter.clone());
        Ok(self)
    }

    pub fn priority(&self) -> i32 {
        signal_priority(self.number)
    }
}

impl KernelReferenceable for Signal {
    fn reference_count(&self) -> &ReferenceCount {
        &self.refs
    }

    fn last_reference_released(&self) {
        if let Some(counter) = &self.counter {
            counter.decrement();
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("number", &self.number)
            .field("code", &self.code)
            .field("sending_team", &self.sending_team)
            .finish()
    }
}

// ============================================================================
// Pending signals
// ============================================================================

/// Signals pending on a thread or team
///
/// Unqueued signals are only a bit each; queued signals keep their
/// details and may be pending several times.
#[derive(Default)]
pub struct PendingSignals {
    queued_mask: SignalSet,
    unqueued_mask: SignalSet,
    queued: VecDeque<Reference<Signal>>,
}

impl PendingSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_signals(&self) -> SignalSet {
        self.queued_mask.union(self.unqueued_mask)
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Priority of the best deliverable signal
    pub fn highest_signal_priority(&self, non_blocked: SignalSet) -> Option<i32> {
        self.all_signals()
            .intersection(non_blocked)
            .highest_priority()
            .map(signal_priority)
    }

    pub fn add_signal(&mut self, number: SignalNumber) {
        self.unqueued_mask.insert(number);
    }

    pub fn add_queued_signal(&mut self, signal: Reference<Signal>) {
        self.queued_mask.insert(signal.number);
        self.queued.push_back(signal);
    }

    /// Drop every pending instance of `number`
    pub fn remove_signal(&mut self, number: SignalNumber) {
        self.remove_signals(SignalSet::from_signal(number));
    }

    pub fn remove_signals(&mut self, mask: SignalSet) {
        self.unqueued_mask = self.unqueued_mask.difference(mask);
        if !self.queued_mask.intersection(mask).is_empty() {
            self.queued.retain(|signal| !mask.contains(signal.number));
            self.update_queued_mask();
        }
    }

    /// Take the highest-priority signal not in the blocked set
    ///
    /// A queued signal is returned as is; an unqueued one as a fresh
    /// [`Signal`] with code [`SI_USER`].
    pub fn dequeue_signal(&mut self, non_blocked: SignalSet) -> Option<Reference<Signal>> {
        let number = self.all_signals().intersection(non_blocked).highest_priority()?;

        if self.queued_mask.contains(number) {
            let index = self.queued.iter().position(|signal| signal.number == number)?;
            let signal = self.queued.remove(index)?;
            self.update_queued_mask();
            return Some(signal);
        }

        self.unqueued_mask.remove(number);
        Some(Reference::new(Signal::new(number, SI_USER, 0, TeamId(0))))
    }

    pub fn clear(&mut self) {
        self.queued.clear();
        self.queued_mask = SignalSet::EMPTY;
        self.unqueued_mask = SignalSet::EMPTY;
    }

    fn update_queued_mask(&mut self) {
        self.queued_mask = SignalSet::EMPTY;
        for signal in &self.queued {
            self.queued_mask.insert(signal.number);
        }
    }
}

impl fmt::Debug for PendingSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSignals")
            .field("queued", &self.queued_mask)
            .field("unqueued", &self.unqueued_mask)
            .finish()
    }
}

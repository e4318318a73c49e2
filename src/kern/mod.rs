//! Kern subsystem - Core kernel objects and primitives
//!
//! Contains the reference-counting base, the lock primitives and their
//! ordering checker, condition variables, signals, user timers, and the
//! thread, team, process group and session control blocks.

pub mod condition_variable;
pub mod cpu;
pub mod lock;
pub mod lock_order;
pub mod panic;
pub mod process_group;
pub mod referenceable;
pub mod signal;
pub mod team;
pub mod thread;
pub mod user_timer;

pub use condition_variable::{ConditionVariable, ConditionVariableEntry};
pub use cpu::Timeout;
pub use lock::{Mutex, RecursiveLock, RwLock, RwSpinLock, SeqLock, SimpleLock, SpinLock};
pub use lock_order::LockClass;
pub use process_group::{ProcessGroup, ProcessGroupRegistry, ProcessSession};
pub use referenceable::{KernelReferenceable, Lockable, LockedReference, Reference, ReferenceCount};
pub use signal::{PendingSignals, Signal, SignalSet};
pub use team::{Team, TeamLockSet, TeamRegistry, TeamState};
pub use thread::{Thread, ThreadRegistry, ThreadState};
pub use user_timer::{UserTimer, UserTimerList};

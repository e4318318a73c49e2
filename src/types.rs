//! Common types used across kcore
//!
//! This module defines shared identifiers, address types and the kernel
//! error enum to avoid circular dependencies between subsystems.

use core::fmt;

/// Virtual address
pub type Addr = u64;

/// Physical address
pub type PhysAddr = u64;

/// Physical page number (physical address / page size)
pub type PageNumber = u64;

/// Time in microseconds
pub type Bigtime = i64;

/// Signal number (1-based, 64 at most)
pub type SignalNumber = u32;

/// Team identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TeamId(pub i32);

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub i32);

/// Area identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AreaId(pub i32);

/// Process group identifier (the id of the team that founded it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessGroupId(pub i32);

/// Session identifier (the id of the team that founded it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionId(pub i32);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ProcessGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<TeamId> for ProcessGroupId {
    fn from(team: TeamId) -> Self {
        ProcessGroupId(team.0)
    }
}

impl From<TeamId> for SessionId {
    fn from(team: TeamId) -> Self {
        SessionId(team.0)
    }
}

/// Recoverable kernel errors
///
/// Contract violations (double unwire, releasing a dead object, locking
/// order inversions) are not errors; they go through
/// [`crate::kern::panic::fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    NoMemory,

    #[error("no more areas")]
    NoMoreAreas,

    #[error("no more teams")]
    NoMoreTeams,

    #[error("no more threads")]
    NoMoreThreads,

    #[error("no more user-defined timers")]
    NoMoreTimers,

    #[error("bad team id")]
    BadTeamId,

    #[error("bad thread id")]
    BadThreadId,

    #[error("bad area id")]
    BadAreaId,

    #[error("entry not found")]
    EntryNotFound,

    #[error("name not found")]
    NameNotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("bad value")]
    BadValue,

    #[error("operation not allowed")]
    NotAllowed,

    #[error("invalid state transition")]
    BadStateTransition,

    #[error("operation would block")]
    WouldBlock,

    #[error("timed out")]
    TimedOut,

    #[error("interrupted")]
    Interrupted,

    #[error("address not mapped")]
    NotMapped,
}

/// Result type for kcore operations
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_messages() {
        assert_eq!(Error::NoMoreTimers.to_string(), "no more user-defined timers");
        assert_eq!(Error::NameNotFound.to_string(), "name not found");
    }

    #[test]
    fn test_group_from_team() {
        assert_eq!(ProcessGroupId::from(TeamId(42)), ProcessGroupId(42));
        assert_eq!(SessionId::from(TeamId(7)), SessionId(7));
    }
}

//! Kernel configuration constants and tunables

use heapless::String;

/// Page size in bytes
pub const PAGE_SIZE: u64 = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// Maximum object name length, including room for a terminator
pub const OS_NAME_LENGTH: usize = 32;

/// Bounded object name
pub type Name = String<OS_NAME_LENGTH>;

/// Highest signal number
pub const MAX_SIGNAL_NUMBER: u32 = 64;

/// First realtime signal
pub const SIGNAL_REALTIME_MIN: u32 = 33;

/// Last realtime signal
pub const SIGNAL_REALTIME_MAX: u32 = 40;

/// Default system-wide cap on user-defined timers
pub const MAX_USER_DEFINED_TIMERS: i32 = 1024;

/// Default per-team cap on user-defined timers
pub const MAX_USER_TIMERS_PER_TEAM: i32 = 512;

/// Default per-team cap on queued signals
pub const MAX_QUEUED_SIGNALS: i32 = 64;

/// Lowest address handed out for user areas
pub const USER_AREA_BASE: u64 = 0x0010_0000;

/// Lowest address handed out for kernel areas
pub const KERNEL_AREA_BASE: u64 = 0xffff_8000_0000_0000;

/// Default registry capacities
pub const MAX_TEAMS: usize = 2048;
pub const MAX_THREADS: usize = 4096;
pub const MAX_AREAS: usize = 65536;

/// Depth of the per-context held-lock stack kept by the lock-order checker
pub const MAX_HELD_LOCKS: usize = 32;

/// Tunables for a [`crate::KernelCore`] instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// System-wide cap on user-defined timers
    pub max_user_defined_timers: i32,
    /// Per-team cap on user-defined timers
    pub max_user_timers_per_team: i32,
    /// Per-team cap on queued signals
    pub max_queued_signals: i32,
    pub max_teams: usize,
    pub max_threads: usize,
    pub max_areas: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_user_defined_timers: MAX_USER_DEFINED_TIMERS,
            max_user_timers_per_team: MAX_USER_TIMERS_PER_TEAM,
            max_queued_signals: MAX_QUEUED_SIGNALS,
            max_teams: MAX_TEAMS,
            max_threads: MAX_THREADS,
            max_areas: MAX_AREAS,
        }
    }
}

/// Copy `name` into a bounded name, cutting it at the last character that fits
pub fn truncated_name(name: &str) -> Name {
    let mut bounded = Name::new();
    for c in name.chars() {
        if bounded.len() + c.len_utf8() >= OS_NAME_LENGTH || bounded.push(c).is_err() {
            break;
        }
    }
    bounded
}

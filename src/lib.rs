//! kcore - the kernel core behind page faults, scheduling and signals
//!
//! This crate provides the shared object model of a monolithic kernel:
//! reference-counted kernel objects, the lock primitives they are guarded
//! by, virtual memory areas with wired ranges, the global area registry,
//! translation maps with the generic page-unmap bookkeeping, and the
//! thread, team, process group and session control blocks.
//!
//! Everything hangs off a [`KernelCore`] service object. The boot path
//! installs one with [`init`]; tests build private instances with
//! [`KernelCore::new`].

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Page arithmetic reads better with explicit shifts and casts
#![allow(clippy::identity_op)]
#![allow(clippy::unnecessary_cast)]

// Standard library replacement for no_std
extern crate alloc;

// Host support (OS-thread contexts, monotonic clock) and the test harness
#[cfg(any(test, feature = "std"))]
extern crate std;

// Core types
pub mod config;
pub mod types;

// Subsystems
pub mod kern;
pub mod kernel;
pub mod vm;

pub use config::KernelConfig;
pub use kernel::{init, kernel, KernelCore};
pub use types::{
    AreaId, Error, ProcessGroupId, Result, SessionId, TeamId, ThreadId,
};

/// kcore version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "kcore";

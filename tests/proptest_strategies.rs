//! Proptest strategies for kernel object sequences
//!
//! Shared by the property-based tests: team lifecycle steps, reference
//! operations and wired-range operations.

#![allow(dead_code)]

use kcore::kern::team::TeamState;
use proptest::prelude::*;

// ════════════════════════════════════════════════════════════
// Team lifecycle
// ════════════════════════════════════════════════════════════

pub fn team_state() -> impl Strategy<Value = TeamState> {
    prop_oneof![
        Just(TeamState::Birth),
        Just(TeamState::Normal),
        Just(TeamState::Shutdown),
        Just(TeamState::Death),
    ]
}

pub fn team_state_sequence() -> impl Strategy<Value = Vec<TeamState>> {
    prop::collection::vec(team_state(), 0..12)
}

// ════════════════════════════════════════════════════════════
// References
// ════════════════════════════════════════════════════════════

/// One step on a set of reference slots
#[derive(Debug, Clone, Copy)]
pub enum RefOp {
    /// Clone slot `from` into a free slot
    Clone(usize),
    /// Drop the reference in a slot, if any
    Drop(usize),
    /// Try to revive the object through its weak link into a slot
    Upgrade(usize),
}

pub fn ref_op(slots: usize) -> impl Strategy<Value = RefOp> {
    prop_oneof![
        (0..slots).prop_map(RefOp::Clone),
        (0..slots).prop_map(RefOp::Drop),
        (0..slots).prop_map(RefOp::Upgrade),
    ]
}

pub fn ref_ops(slots: usize) -> impl Strategy<Value = Vec<RefOp>> {
    prop::collection::vec(ref_op(slots), 0..64)
}

// ════════════════════════════════════════════════════════════
// Wired ranges
// ════════════════════════════════════════════════════════════

/// Pages in the area the wired-range tests use
pub const AREA_PAGES: u64 = 16;

#[derive(Debug, Clone, Copy)]
pub enum WireOp {
    /// Wire an implicit range of `pages` pages at page `first`
    Wire { first: u64, pages: u64, writable: bool },
    /// Unwire the n-th live range, modulo the live count
    Unwire(usize),
    /// Ask whether any range intersects the span
    Query { first: u64, pages: u64 },
}

pub fn wire_op() -> impl Strategy<Value = WireOp> {
    prop_oneof![
        (0..AREA_PAGES, 1..4u64, any::<bool>())
            .prop_map(|(first, pages, writable)| WireOp::Wire { first, pages, writable }),
        any::<usize>().prop_map(WireOp::Unwire),
        (0..AREA_PAGES, 0..4u64).prop_map(|(first, pages)| WireOp::Query { first, pages }),
    ]
}

pub fn wire_ops() -> impl Strategy<Value = Vec<WireOp>> {
    prop::collection::vec(wire_op(), 0..48)
}

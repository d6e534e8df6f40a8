//! Error kinds and rule-engine events.
//!
//! Follows `memory::mempool::MempoolError`'s `thiserror`-derived leaf error
//! style, and `conntrack::conn::conn_info`'s `#[cfg(debug_assertions)]`
//! assertions for the debug/release split of programming-invariant
//! handling.

use thiserror::Error;

/// Events the reassembler raises for the rule engine to match against the
/// current packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A segment was wholly before the relevant consumer's base sequence.
    SegmentBeforeBaseSeq,
    /// The segment pool or memory cap prevented a segment from being stored.
    NoSegment,
    /// A permanent gap was declared on a stream.
    SeqGap,
    /// An overlap region's old and new bytes disagreed and
    /// `check_overlap_different_data` is enabled.
    OverlapDifferentData,
}

/// A small per-call sink for events, analogous to how `filter::actions`
/// attaches `Actions` to the current packet's filtering result. Call sites
/// push zero or more events; the rule engine (external collaborator) drains
/// them after each reassembler entry point returns.
#[derive(Debug, Default, Clone)]
pub struct EventSink {
    events: Vec<Event>,
}

impl EventSink {
    pub fn new() -> Self {
        EventSink { events: Vec::new() }
    }

    #[inline]
    pub fn raise(&mut self, event: Event) {
        log::debug!("reassembly event raised: {:?}", event);
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Programming-invariant violations: list inconsistency, cursor underflow,
/// out-of-order state after insert. These are never expected from
/// well-formed input; they indicate a bug in this crate.
///
/// In debug builds, callers are expected to `debug_assert!` on the
/// invariant directly (so the panic carries a useful location and
/// backtrace); this type exists for the release-mode path, where the
/// invariant is logged as a warning and the caller continues best-effort
/// rather than propagating a hard failure back through the flow lock as an
/// exception-like control transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("segment list inconsistency: {0}")]
    ListInconsistency(String),

    #[error("cursor underflow: {0}")]
    CursorUnderflow(String),

    #[error("segment out of order after insert: {0}")]
    OutOfOrderAfterInsert(String),
}

/// Logs (and, in debug builds, panics on) a programming-invariant
/// violation. Mirrors the pattern in `conn_info::done_probe`, which
/// `assert!`s on invariants only under `#[cfg(debug_assertions)]`.
#[inline]
pub fn invariant_violation(err: ReassemblyError) {
    log::error!("reassembly invariant violation: {}", err);
    #[cfg(debug_assertions)]
    panic!("reassembly invariant violation: {}", err);
}

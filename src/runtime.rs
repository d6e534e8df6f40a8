//! Per-worker runtime state and the single shared runtime value constructed
//! once at engine start, shared read-only except for the memory pool.
//!
//! Follows the thread-local `Cell<u64>` counter pattern for per-worker
//! bookkeeping that must never cross a thread boundary, and a
//! one-context-per-poll-thread model for the shape of `PerThreadContext`
//! itself. The raw-matcher output queue is single-producer, single-consumer
//! and uses `crossbeam::channel` rather than a bare `VecDeque` behind a
//! mutex, so no locking is needed on either end.

use std::cell::Cell;
use std::net::IpAddr;

use crossbeam::channel::{self, Receiver, Sender};

use crate::config::{OsPolicy, OsPolicyTable, ReassemblyConfig};
use crate::memory::BufferPool;
use crate::raw::StreamMsg;

/// State shared by every worker thread, built once when the engine starts.
/// The `BufferPool` is the only field mutated after construction; `config`
/// and the resolved `os_policy_table` are read-only for the runtime's
/// lifetime.
pub struct ReassemblyRuntime {
    pub pool: BufferPool,
    pub config: ReassemblyConfig,
    os_policy_table: OsPolicyTable,
}

impl ReassemblyRuntime {
    pub fn new(config: ReassemblyConfig) -> Self {
        let pool = BufferPool::new(config.reassembly_memcap);
        let os_policy_table = config.os_policy_table();
        ReassemblyRuntime {
            pool,
            config,
            os_policy_table,
        }
    }

    /// Resolves the target-OS overlap policy for a destination address.
    pub fn os_policy_for(&self, addr: IpAddr) -> OsPolicy {
        self.os_policy_table.resolve(addr)
    }
}

thread_local! {
    static SEGMENTS_ACCEPTED: Cell<u64> = const { Cell::new(0) };
    static SEGMENTS_DROPPED: Cell<u64> = const { Cell::new(0) };
    static GAPS_DECLARED: Cell<u64> = const { Cell::new(0) };
    static SEGMENTS_PRUNED: Cell<u64> = const { Cell::new(0) };
}

/// Per-worker-thread bookkeeping that must not be shared across threads. One
/// `PerThreadContext` is built per poll thread and reused across every flow
/// that thread owns.
pub struct PerThreadContext {
    /// Raw-matcher output queue producer: the raw reassembler enqueues
    /// `StreamMsg`s here via its `RawMatcherSink` impl for `Sender`.
    pub raw_tx: Sender<StreamMsg>,
    /// The consumer end of `raw_tx`, drained by this thread's own matching
    /// loop, which lives outside this crate.
    pub raw_rx: Receiver<StreamMsg>,
}

impl PerThreadContext {
    pub fn new() -> Self {
        let (raw_tx, raw_rx) = channel::unbounded();
        PerThreadContext { raw_tx, raw_rx }
    }

    pub fn record_segment_accepted(&self) {
        SEGMENTS_ACCEPTED.with(|c| c.set(c.get() + 1));
    }

    pub fn record_segment_dropped(&self) {
        SEGMENTS_DROPPED.with(|c| c.set(c.get() + 1));
    }

    pub fn record_gap_declared(&self) {
        GAPS_DECLARED.with(|c| c.set(c.get() + 1));
    }

    pub fn record_segments_pruned(&self, n: u64) {
        SEGMENTS_PRUNED.with(|c| c.set(c.get() + n));
    }

    /// Snapshots this thread's counters without resetting them. Intended as
    /// the hook a periodic stats exporter would read.
    pub fn counters() -> ThreadCounters {
        ThreadCounters {
            segments_accepted: SEGMENTS_ACCEPTED.with(Cell::get),
            segments_dropped: SEGMENTS_DROPPED.with(Cell::get),
            gaps_declared: GAPS_DECLARED.with(Cell::get),
            segments_pruned: SEGMENTS_PRUNED.with(Cell::get),
        }
    }
}

impl Default for PerThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadCounters {
    pub segments_accepted: u64,
    pub segments_dropped: u64,
    pub gaps_declared: u64,
    pub segments_pruned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_resolves_os_policy_from_config() {
        let mut cfg = ReassemblyConfig::default();
        cfg.os_policy.insert("10.0.0.0/8".to_string(), OsPolicy::Windows);
        let runtime = ReassemblyRuntime::new(cfg);
        let addr: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(runtime.os_policy_for(addr), OsPolicy::Windows);
    }

    #[test]
    fn per_thread_counters_accumulate_independently_of_other_instances() {
        let ctx = PerThreadContext::new();
        let before = PerThreadContext::counters();
        ctx.record_segment_accepted();
        ctx.record_gap_declared();
        let after = PerThreadContext::counters();
        assert_eq!(after.segments_accepted, before.segments_accepted + 1);
        assert_eq!(after.gaps_declared, before.gaps_declared + 1);
    }

    #[test]
    fn raw_output_queue_is_single_producer_single_consumer() {
        use crate::raw::{RawMatcherSink, StreamMsg};
        use crate::stream::Direction;

        let mut ctx = PerThreadContext::new();
        let mut tx = ctx.raw_tx.clone();
        tx.enqueue(StreamMsg {
            direction: Direction::ToServer,
            start_seq: 0,
            data: Box::new(*b"hi"),
            gap_size: 0,
            flow_id: 1,
        });
        let msg = ctx.raw_rx.try_recv().expect("message should be queued");
        assert_eq!(&*msg.data, b"hi");
    }
}

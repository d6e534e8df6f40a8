//! The reassembly data model: `Stream`, `Session`, and the small flag sets
//! and enums that compose them.
//!
//! Follows a per-direction state half paired with a shared connection-level
//! state tag, generalized here to carry two independent reassembly cursors
//! (`ra_app_base_seq`, `ra_raw_base_seq`) per stream rather than a single
//! one. Flag sets use `bitmask_enum::bitmask`.

use bitmask_enum::bitmask;

use crate::flowvar::FlowVarStore;
use crate::memory::BufferPool;
use crate::seq::seq_leq;
use crate::segment::SegmentList;
use crate::config::OsPolicy;

/// Which side of the connection a stream, message, or callback pertains to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToServer,
    ToClient,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// Connection-lifecycle tag maintained by the external TCP tracker.
/// Declaration order is significant: comparisons like `state >
/// State::Established` rely on the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Established,
    FinWait,
    Closing,
    TimeWait,
    Closed,
}

/// Per-stream flags.
#[bitmask(u8)]
pub enum StreamFlags {
    /// A permanent gap was declared; app-layer delivery has ended for this
    /// direction for the lifetime of the stream.
    Gap,
    /// `reassembly_depth` has been reached; further segments are silently
    /// rejected.
    DepthReached,
    NoReassembly,
    CloseInitiated,
    /// This direction carried a `PSEUDO_STREAM_END` segment since the last
    /// raw-reassembly pass; consulted (and cleared) by `ra_raw_check_limit`.
    PseudoEofPending,
}

/// Per-session flags.
#[bitmask(u8)]
pub enum SessionFlags {
    /// Set by the app-layer parser once it has resolved the protocol.
    ApprotoDetectionCompleted,
    /// Set by an external consumer to force a raw-reassembly pass; cleared
    /// on consumption.
    TriggerRawReassembly,
}

/// Flags carried on an incoming data segment.
#[bitmask(u8)]
pub enum SegmentInputFlags {
    /// Synthetic end-of-stream marker.
    PseudoStreamEnd,
    /// Stream has passed its pcap-logging depth limit.
    StreamNopcaplog,
}

/// One direction's reassembly state.
pub struct Stream {
    pub isn: u32,
    pub last_ack: u32,
    pub window: u32,
    pub next_seq: u32,
    pub ra_app_base_seq: u32,
    pub ra_raw_base_seq: u32,
    pub os_policy: OsPolicy,
    pub flags: StreamFlags,
    pub list: SegmentList,
    /// Sequence number of the oldest not-yet-drained raw-matcher output
    /// message for this stream, if any — the pruner must not release bytes a
    /// still-queued `StreamMsg` references. Maintained by the raw
    /// reassembler as it enqueues and the consumer drains.
    pub pending_raw_seq: Option<u32>,
}

impl Stream {
    pub fn new(isn: u32, os_policy: OsPolicy) -> Self {
        Stream {
            isn,
            last_ack: isn,
            window: 0,
            next_seq: isn,
            ra_app_base_seq: isn,
            ra_raw_base_seq: isn,
            os_policy,
            flags: StreamFlags::none(),
            list: SegmentList::new(),
            pending_raw_seq: None,
        }
    }

    /// The cursor used by the depth gate and the overlap resolver's
    /// stale-segment rejection to decide what is still needed.
    ///
    /// Two independent per-consumer cursors exist (`ra_app_base_seq`,
    /// `ra_raw_base_seq`) and neither alone is sufficient here: this takes
    /// whichever cursor has advanced *less*, so data is never dropped while
    /// either consumer still needs it (see `DESIGN.md`).
    pub fn ra_base_seq(&self) -> u32 {
        if seq_leq(self.ra_app_base_seq, self.ra_raw_base_seq) {
            self.ra_app_base_seq
        } else {
            self.ra_raw_base_seq
        }
    }

    /// Releases every segment's buffer back to `pool` and clears the list.
    pub fn teardown(&mut self, pool: &BufferPool) {
        while let Some(h) = self.list.head() {
            self.list.remove(h, pool);
        }
    }
}

/// A TCP connection's reassembly state.
pub struct Session {
    pub to_server: Stream,
    pub to_client: Stream,
    pub state: State,
    pub flags: SessionFlags,
    pub flow_vars: FlowVarStore,
}

impl Session {
    pub fn new(isn_client: u32, isn_server: u32, os_policy: OsPolicy) -> Self {
        Session {
            to_server: Stream::new(isn_client, os_policy),
            to_client: Stream::new(isn_server, os_policy),
            state: State::Established,
            flags: SessionFlags::none(),
            flow_vars: FlowVarStore::new(),
        }
    }

    pub fn stream(&self, dir: Direction) -> &Stream {
        match dir {
            Direction::ToServer => &self.to_server,
            Direction::ToClient => &self.to_client,
        }
    }

    pub fn stream_mut(&mut self, dir: Direction) -> &mut Stream {
        match dir {
            Direction::ToServer => &mut self.to_server,
            Direction::ToClient => &mut self.to_client,
        }
    }

    /// Borrows one direction's `Stream` and the session-level `flags`
    /// simultaneously. Plain `stream_mut` alone can't be paired with a
    /// separate borrow of `self.flags` since both go through `&mut self`;
    /// callers that need to pass both to e.g. [`crate::app::deliver`] (which
    /// takes a stream and a `&mut SessionFlags` to commit the app-proto
    /// detection gate) destructure through this helper instead.
    pub fn stream_and_flags_mut(&mut self, dir: Direction) -> (&mut Stream, &mut SessionFlags) {
        match dir {
            Direction::ToServer => (&mut self.to_server, &mut self.flags),
            Direction::ToClient => (&mut self.to_client, &mut self.flags),
        }
    }

    /// Releases all segments (both directions) and flow variables on
    /// session teardown.
    pub fn destroy(&mut self, pool: &BufferPool) {
        self.to_server.teardown(pool);
        self.to_client.teardown(pool);
        self.flow_vars.clear();
    }
}

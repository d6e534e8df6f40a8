//! The Raw Reassembler: produces a sliding-window byte stream to the raw
//! pattern matcher, advancing the raw cursor.
//!
//! Shares its head-of-list walk and gap handling with the app-layer
//! reassembler (`app.rs`): the two differ only in trigger predicate,
//! window placement, and output record shape, both following the same
//! delivery-loop structure.

use crate::config::ReassemblyConfig;
use crate::error::{Event, EventSink};
use crate::seq::{seq_geq, seq_gt, seq_leq, seq_lt};
use crate::segment::SegFlags;
use crate::stream::{Direction, SessionFlags, State, Stream, StreamFlags};

/// An output record for the raw pattern matcher. `flow_id` is an opaque
/// caller-assigned handle — flow identity is owned by the external flow
/// tracker, not this crate.
#[derive(Debug, Clone)]
pub struct StreamMsg {
    pub direction: Direction,
    pub start_seq: u32,
    pub data: Box<[u8]>,
    pub gap_size: u32,
    pub flow_id: u64,
}

/// The external collaborator seam to the raw pattern matcher: a queue of
/// `StreamMsg` records emitted in strict per-direction sequence order.
pub trait RawMatcherSink {
    fn enqueue(&mut self, msg: StreamMsg);
}

/// A sink that discards every message; used in tests and where no raw
/// matcher is registered.
pub struct NullRawSink;

impl RawMatcherSink for NullRawSink {
    fn enqueue(&mut self, _msg: StreamMsg) {}
}

/// Lets a [`crate::runtime::PerThreadContext`]'s `raw_tx` be passed directly
/// wherever a `RawMatcherSink` is expected. A full channel's `send` only
/// fails once the receiver has been dropped, which only happens at worker
/// shutdown; this implementation logs and drops the message rather than
/// panicking.
impl RawMatcherSink for crossbeam::channel::Sender<StreamMsg> {
    fn enqueue(&mut self, msg: StreamMsg) {
        if self.send(msg).is_err() {
            log::warn!("raw matcher output queue has no consumer; dropping message");
        }
    }
}

/// Whether any of the four trigger conditions for a raw-reassembly pass
/// currently holds. Does not consume `TriggerRawReassembly` — the caller
/// does that via [`consume_trigger`].
pub fn check_limit(
    session_flags: SessionFlags,
    state: State,
    pseudo_eof: bool,
    opposite_next_seq: u32,
    opposite_last_ack: u32,
    raw_check_min_len: u32,
) -> bool {
    if session_flags.contains(SessionFlags::TriggerRawReassembly) {
        return true;
    }
    if state >= State::TimeWait {
        return true;
    }
    if pseudo_eof {
        return true;
    }
    let unacked = opposite_next_seq.wrapping_sub(opposite_last_ack);
    unacked >= raw_check_min_len
}

/// Clears `TriggerRawReassembly` once a raw-reassembly pass it requested
/// has run.
pub fn consume_trigger(session_flags: &mut SessionFlags) {
    *session_flags &= !SessionFlags::TriggerRawReassembly;
}

/// Delivers windowed raw-matcher output for `stream`. `flow_id` tags every
/// emitted `StreamMsg`. `right_edge` is the window's right edge: the
/// IDS/ACK-driven variant passes the list tail's end sequence; the inline
/// variant passes the current packet's own `seq + payload_len`.
pub fn deliver(
    stream: &mut Stream,
    state: State,
    dir: Direction,
    cfg: &ReassemblyConfig,
    flow_id: u64,
    right_edge: u32,
    sink: &mut dyn RawMatcherSink,
    events: &mut EventSink,
) {
    if stream.flags.contains(StreamFlags::Gap) {
        return;
    }
    let Some(head) = stream.list.head() else {
        return;
    };

    let chunk_size = match dir {
        Direction::ToServer => cfg.reassembly_toserver_chunk_size,
        Direction::ToClient => cfg.reassembly_toclient_chunk_size,
    };
    let head_seq = stream.list.get(head).seq;
    let mut left_edge = right_edge.wrapping_sub(chunk_size);
    if seq_lt(left_edge, head_seq) {
        left_edge = head_seq;
    }

    let mut base = stream.ra_raw_base_seq;
    if base == stream.isn || seq_lt(base, left_edge.wrapping_sub(1)) {
        base = left_edge.wrapping_sub(1);
    }

    let mut cur = stream.list.head();
    let mut oldest_pending = stream.pending_raw_seq;

    while let Some(h) = cur {
        let next = stream.list.next(h);
        let (seg_seq, seg_end, already_app, already_raw) = {
            let seg = stream.list.get(h);
            (
                seg.seq,
                seg.end_seq(),
                seg.flags.contains(SegFlags::ApplayerProcessed),
                seg.flags.contains(SegFlags::RawProcessed),
            )
        };

        if seq_leq(seg_end, stream.ra_raw_base_seq) && already_app && already_raw {
            cur = next;
            continue;
        }
        if seq_lt(seg_end, left_edge) {
            cur = next;
            continue;
        }
        if seq_geq(seg_seq, right_edge) {
            break;
        }

        let next_seq = base.wrapping_add(1);
        if seq_gt(seg_seq, next_seq) {
            let permanent = seq_gt(stream.last_ack.wrapping_sub(stream.window), base) || state > State::Established;
            if permanent {
                let gap_size = seg_seq.wrapping_sub(next_seq);
                base = seg_seq.wrapping_sub(1);
                let msg = StreamMsg {
                    direction: dir,
                    start_seq: next_seq,
                    data: Box::new([]),
                    gap_size,
                    flow_id,
                };
                sink.enqueue(msg);
                stream.flags |= StreamFlags::Gap;
                events.raise(Event::SeqGap);
                stream.ra_raw_base_seq = base;
                return;
            }
            break;
        }

        let win_start = if seq_gt(left_edge, seg_seq) { left_edge } else { seg_seq };
        let win_end = if seq_lt(right_edge, seg_end) { right_edge } else { seg_end };
        if seq_lt(win_start, win_end) {
            let seg = stream.list.get(h);
            let off = win_start.wrapping_sub(seg.seq) as usize;
            let n = win_end.wrapping_sub(win_start) as usize;
            let chunk = cfg_chunked(&seg.payload()[off..off + n], chunk_size as usize);
            for piece in chunk {
                let msg = StreamMsg {
                    direction: dir,
                    start_seq: win_start,
                    data: piece.into(),
                    gap_size: 0,
                    flow_id,
                };
                sink.enqueue(msg);
            }
            base = win_end.wrapping_sub(1);
        }

        if seq_leq(seg_end, right_edge) {
            stream.list.get_mut(h).flags |= SegFlags::RawProcessed;
        }

        cur = next;
    }

    stream.ra_raw_base_seq = base;
    if oldest_pending.is_none() {
        oldest_pending = Some(left_edge);
    }
    stream.pending_raw_seq = oldest_pending;
}

fn cfg_chunked(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if chunk_size == 0 || data.is_empty() {
        return vec![data.to_vec()];
    }
    data.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsPolicy;
    use crate::memory::BufferPool;
    use crate::overlap;

    struct CollectingSink {
        msgs: Vec<StreamMsg>,
    }

    impl RawMatcherSink for CollectingSink {
        fn enqueue(&mut self, msg: StreamMsg) {
            self.msgs.push(msg);
        }
    }

    fn feed(stream: &mut Stream, pool: &BufferPool, seq: u32, data: &[u8]) {
        let mut buf = pool.get(data.len()).unwrap();
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        buf.set_len(data.len() as u16);
        let seg = crate::segment::Segment::new(seq, buf);
        overlap::insert(&mut stream.list, pool, stream.os_policy, false, stream.ra_base_seq(), seg, None, &mut EventSink::new()).unwrap();
    }

    #[test]
    fn delivers_within_sliding_window() {
        let pool = BufferPool::new(1 << 20);
        let mut stream = Stream::new(0, OsPolicy::Bsd);
        let cfg = ReassemblyConfig::default();
        let mut sink = CollectingSink { msgs: Vec::new() };
        let mut events = EventSink::new();

        feed(&mut stream, &pool, 2, b"AAAAA");
        feed(&mut stream, &pool, 7, b"BBBBB");

        deliver(&mut stream, State::Established, Direction::ToServer, &cfg, 1, 12, &mut sink, &mut events);

        let all: Vec<u8> = sink.msgs.iter().flat_map(|m| m.data.to_vec()).collect();
        assert_eq!(all, b"AAAAABBBBB");
        assert!(sink.msgs.iter().all(|m| m.gap_size == 0));
    }

    #[test]
    fn trigger_flag_is_consumed() {
        let mut flags = SessionFlags::TriggerRawReassembly;
        assert!(flags.contains(SessionFlags::TriggerRawReassembly));
        consume_trigger(&mut flags);
        assert!(!flags.contains(SessionFlags::TriggerRawReassembly));
    }

    #[test]
    fn check_limit_fires_on_min_len_without_other_triggers() {
        assert!(check_limit(SessionFlags::none(), State::Established, false, 3000, 0, 2560));
        assert!(!check_limit(SessionFlags::none(), State::Established, false, 100, 0, 2560));
    }
}

//! The App-Layer Reassembler: produces a contiguous byte stream to the
//! protocol parser, advancing the application cursor.
//!
//! Follows `conntrack::conn::tcp_conn::reassembly`'s chunked-delivery loop
//! (walk the list from the head, accumulate into a fixed buffer, flush on
//! fill), generalized with a gap-permanence predicate and an app-proto
//! detection gate that a simpler single-parser-per-connection model
//! wouldn't need.

use bitmask_enum::bitmask;

use crate::config::ReassemblyConfig;
use crate::error::{Event, EventSink};
use crate::seq::{seq_gt, seq_leq};
use crate::segment::SegFlags;
use crate::stream::{Direction, SessionFlags, State, Stream, StreamFlags};

/// Flags composed onto a `handle_tcp_data` delivery.
#[bitmask(u8)]
pub enum DeliveryFlags {
    Start,
    Eof,
    ToServer,
    ToClient,
    Gap,
    Depth,
}

/// The external collaborator seam to the application-layer protocol parser.
/// Narrowed from the full `handle_tcp_data(parser_ctx, flow, session, buf,
/// len, flags)` contract to the parts this crate actually owns: `buf` and
/// `flags`. `flow`/`session` identity and `parser_ctx` are caller-side
/// concerns outside this crate's scope.
///
/// Returns `true` the first time this call causes application-protocol
/// detection to complete, signaling the reassembler to commit the app
/// cursor. Once the session flag `APPPROTO_DETECTION_COMPLETED` is set
/// elsewhere, implementations should return `false` — the reassembler
/// already treats the gate as open.
pub trait AppLayerSink {
    fn handle_tcp_data(&mut self, buf: &[u8], flags: DeliveryFlags) -> bool;
}

/// A sink that discards all data; used in tests and as a stand-in where no
/// parser is registered.
pub struct NullSink;

impl AppLayerSink for NullSink {
    fn handle_tcp_data(&mut self, _buf: &[u8], _flags: DeliveryFlags) -> bool {
        false
    }
}

fn dir_flag(dir: Direction) -> DeliveryFlags {
    match dir {
        Direction::ToServer => DeliveryFlags::ToServer,
        Direction::ToClient => DeliveryFlags::ToClient,
    }
}

fn depth_flag(stream: &Stream) -> DeliveryFlags {
    if stream.flags.contains(StreamFlags::DepthReached) {
        DeliveryFlags::Depth
    } else {
        DeliveryFlags::none()
    }
}

fn flush(acc: &mut Vec<u8>, sink: &mut dyn AppLayerSink, base_flags: DeliveryFlags, first: &mut bool) -> bool {
    if acc.is_empty() {
        return false;
    }
    let buf = std::mem::take(acc);
    let mut flags = base_flags;
    if *first {
        flags |= DeliveryFlags::Start;
    }
    *first = false;
    sink.handle_tcp_data(&buf, flags)
}

/// Delivers contiguous application-layer bytes for `stream`. `stream` is
/// the direction the *data* flows in, i.e. the direction opposite the
/// incoming ACK.
pub fn deliver(
    stream: &mut Stream,
    state: State,
    session_flags: &mut SessionFlags,
    dir: Direction,
    cfg: &ReassemblyConfig,
    sink: &mut dyn AppLayerSink,
    events: &mut EventSink,
) {
    if stream.flags.contains(StreamFlags::Gap) {
        return;
    }

    let mut base_flags = dir_flag(dir) | depth_flag(stream);
    if state > State::Established {
        base_flags |= DeliveryFlags::Eof;
    }

    if stream.list.is_empty() {
        if state > State::Established {
            sink.handle_tcp_data(&[], base_flags);
        }
        return;
    }

    let mut detection_done = session_flags.contains(SessionFlags::ApprotoDetectionCompleted);
    let mut base = stream.ra_app_base_seq;
    let mut first = base == stream.isn && !detection_done;
    let mut acc: Vec<u8> = Vec::new();

    // Nothing has ever been delivered on this stream: adopt the first
    // captured segment's own start as the baseline rather than treating the
    // distance from `isn` as a gap. `isn` marks the connection's first
    // sequence number, not necessarily the first byte this engine captured.
    if base == stream.isn {
        if let Some(head) = stream.list.head() {
            base = stream.list.get(head).seq.wrapping_sub(1);
        }
    }
    let mut committed_through = stream.ra_app_base_seq;
    let mut gap_declared = false;

    let mut cur = stream.list.head();
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

        if seq_leq(seg_end, stream.ra_app_base_seq) && already_app && already_raw {
            cur = next;
            continue;
        }

        let next_seq = base.wrapping_add(1);
        if seq_gt(seg_seq, next_seq) {
            if flush(&mut acc, sink, base_flags, &mut first) {
                detection_done = true;
            }

            let permanent = seq_gt(stream.last_ack.wrapping_sub(stream.window), base) || state > State::Established;
            if permanent {
                base = seg_seq.wrapping_sub(1);
                sink.handle_tcp_data(&[], base_flags | DeliveryFlags::Gap);
                stream.flags |= StreamFlags::Gap;
                events.raise(Event::SeqGap);
                gap_declared = true;
                if detection_done {
                    committed_through = base;
                }
            }
            break;
        }

        let trim = if seq_gt(next_seq, seg_seq) { next_seq.wrapping_sub(seg_seq) as usize } else { 0 };
        {
            let seg = stream.list.get(h);
            acc.extend_from_slice(&seg.payload()[trim..]);
        }
        base = seg_end.wrapping_sub(1);

        while acc.len() >= cfg.app_chunk_size {
            let chunk: Vec<u8> = acc.drain(..cfg.app_chunk_size).collect();
            let mut flags = base_flags;
            if first {
                flags |= DeliveryFlags::Start;
            }
            first = false;
            if sink.handle_tcp_data(&chunk, flags) {
                detection_done = true;
            }
        }

        stream.list.get_mut(h).flags |= SegFlags::ApplayerProcessed;
        if detection_done {
            committed_through = base;
        }

        cur = next;
    }

    if !gap_declared && !acc.is_empty() {
        if flush(&mut acc, sink, base_flags, &mut first) {
            detection_done = true;
        }
        if detection_done {
            committed_through = base;
        }
    }

    if detection_done {
        *session_flags |= SessionFlags::ApprotoDetectionCompleted;
        stream.ra_app_base_seq = committed_through;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsPolicy;
    use crate::memory::BufferPool;
    use crate::overlap;

    struct CollectingSink {
        chunks: Vec<(Vec<u8>, DeliveryFlags)>,
        detect_after: usize,
    }

    impl AppLayerSink for CollectingSink {
        fn handle_tcp_data(&mut self, buf: &[u8], flags: DeliveryFlags) -> bool {
            self.chunks.push((buf.to_vec(), flags));
            self.chunks.len() >= self.detect_after
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
    fn delivers_in_order_no_gap() {
        let pool = BufferPool::new(1 << 20);
        let mut stream = Stream::new(0, OsPolicy::Bsd);
        let mut session_flags = SessionFlags::all(); // detection already complete
        let cfg = ReassemblyConfig { app_chunk_size: 4096, ..Default::default() };
        let mut sink = CollectingSink { chunks: Vec::new(), detect_after: 0 };
        let mut events = EventSink::new();

        feed(&mut stream, &pool, 2, b"AAAAA");
        feed(&mut stream, &pool, 7, b"BBBBB");
        feed(&mut stream, &pool, 12, b"CCCCC");

        deliver(&mut stream, State::Established, &mut session_flags, Direction::ToServer, &cfg, &mut sink, &mut events);

        let all: Vec<u8> = sink.chunks.iter().flat_map(|(b, _)| b.clone()).collect();
        assert_eq!(all, b"AAAAABBBBBCCCCC");
        assert_eq!(stream.ra_app_base_seq, 16);
    }

    #[test]
    fn permanent_gap_stops_delivery() {
        let pool = BufferPool::new(1 << 20);
        let mut stream = Stream::new(0, OsPolicy::Bsd);
        stream.last_ack = 100;
        stream.window = 0; // last_ack - window (100) > ra_base_seq (1) -> permanent
        let mut session_flags = SessionFlags::all();
        let cfg = ReassemblyConfig { app_chunk_size: 4096, ..Default::default() };
        let mut sink = CollectingSink { chunks: Vec::new(), detect_after: 0 };
        let mut events = EventSink::new();

        feed(&mut stream, &pool, 2, b"AA"); // [2,4)
        feed(&mut stream, &pool, 7, b"CC"); // [7,9), gap at [4,7)

        deliver(&mut stream, State::Established, &mut session_flags, Direction::ToServer, &cfg, &mut sink, &mut events);

        assert!(stream.flags.contains(StreamFlags::Gap));
        assert!(events.events().contains(&Event::SeqGap));
        let all: Vec<u8> = sink.chunks.iter().flat_map(|(b, _)| b.clone()).collect();
        assert_eq!(all, b"AA");

        // Further calls do nothing further: the gap is permanent.
        sink.chunks.clear();
        feed(&mut stream, &pool, 20, b"ZZ");
        deliver(&mut stream, State::Established, &mut session_flags, Direction::ToServer, &cfg, &mut sink, &mut events);
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn late_arrival_fills_gap_before_it_is_declared_permanent() {
        let pool = BufferPool::new(1 << 20);
        let mut stream = Stream::new(0, OsPolicy::Bsd);
        stream.last_ack = 2; // last_ack - window <= ra_base_seq -> gap not permanent
        stream.window = 0;
        let mut session_flags = SessionFlags::all();
        let cfg = ReassemblyConfig { app_chunk_size: 4096, ..Default::default() };
        let mut sink = CollectingSink { chunks: Vec::new(), detect_after: 0 };
        let mut events = EventSink::new();

        feed(&mut stream, &pool, 2, b"AA");
        feed(&mut stream, &pool, 7, b"CC");
        feed(&mut stream, &pool, 4, b"BBB");

        deliver(&mut stream, State::Established, &mut session_flags, Direction::ToServer, &cfg, &mut sink, &mut events);

        assert!(!stream.flags.contains(StreamFlags::Gap));
        let all: Vec<u8> = sink.chunks.iter().flat_map(|(b, _)| b.clone()).collect();
        assert_eq!(all, b"AABBBCC");
    }

    #[test]
    fn app_proto_detection_gate_pins_cursor_until_parser_signals_completion() {
        let pool = BufferPool::new(1 << 20);
        let mut stream = Stream::new(0, OsPolicy::Bsd);
        let mut session_flags = SessionFlags::none(); // detection not complete
        let cfg = ReassemblyConfig { app_chunk_size: 4096, ..Default::default() };
        let mut events = EventSink::new();

        feed(&mut stream, &pool, 0, b"hello");
        let mut sink = CollectingSink { chunks: Vec::new(), detect_after: 99 }; // never signals done
        deliver(&mut stream, State::Established, &mut session_flags, Direction::ToServer, &cfg, &mut sink, &mut events);
        assert_eq!(stream.ra_app_base_seq, 0, "cursor stays pinned while detection is pending");
        assert!(!session_flags.contains(SessionFlags::ApprotoDetectionCompleted));

        let mut sink2 = CollectingSink { chunks: Vec::new(), detect_after: 1 }; // signals done on first delivery
        deliver(&mut stream, State::Established, &mut session_flags, Direction::ToServer, &cfg, &mut sink2, &mut events);
        assert!(session_flags.contains(SessionFlags::ApprotoDetectionCompleted));
        assert_eq!(stream.ra_app_base_seq, 4);
    }
}

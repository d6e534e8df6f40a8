//! The external interface consumed from the TCP tracker: the single facade
//! tying the segment pool, segment list, overlap resolver, depth gate, app
//! and raw reassemblers, pruner, and flow-variable store together into the
//! entry points an upstream flow/session tracker calls once per TCP data
//! segment or ACK. Every entry point here assumes the caller already holds
//! the per-flow exclusive lock -- this module performs no locking of its
//! own.
//!
//! `conntrack::ConnTracker::process` is the shape this is modeled on --
//! "one call per packet, dispatch into the right per-connection state,
//! update the table" -- narrowed to the slice of that responsibility this
//! crate actually owns (reassembly). Connection-table lookup and the
//! handshake/state-machine tracker are the caller's job: callers already
//! hand us a `&mut Session` rather than a five-tuple to look up.

use anyhow::{bail, Result};

use crate::app::{self, AppLayerSink};
use crate::error::{invariant_violation, Event, EventSink, ReassemblyError};
use crate::pruner;
use crate::raw::{self, RawMatcherSink};
use crate::runtime::{PerThreadContext, ReassemblyRuntime};
use crate::seq::seq_lt;
use crate::segment::Segment;
use crate::stream::{Direction, SegmentInputFlags, Session, SessionFlags, StreamFlags};

/// Outcome of [`on_data_segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    Ok,
    Drop,
}

/// Ingests one TCP data segment: runs it through the depth gate, pulls a
/// buffer from the segment pool, and inserts it via the overlap resolver.
/// `dir` is the direction the data itself travels in (the sender's
/// direction), not the direction of any ACK.
///
/// `wire_rewrite`, when `Some`, is the mutable wire buffer for this same
/// packet in inline (IPS) mode; bytes that disagree with already-stored
/// overlap data are corrected in place so the forwarded packet matches what
/// this engine analyzed. With `inline_mode` set in the runtime's
/// configuration, a successful insert also drives the inline app-layer/
/// raw-matcher delivery variants immediately, rather than waiting for the
/// next ACK.
#[allow(clippy::too_many_arguments)]
pub fn on_data_segment(
    session: &mut Session,
    runtime: &ReassemblyRuntime,
    ctx: &PerThreadContext,
    dir: Direction,
    seq: u32,
    payload: &[u8],
    input_flags: SegmentInputFlags,
    mut wire_rewrite: Option<&mut [u8]>,
    flow_id: u64,
    app_sink: &mut dyn AppLayerSink,
    raw_sink: &mut dyn RawMatcherSink,
    events: &mut EventSink,
) -> SegmentOutcome {
    let accepted_len = {
        let stream = session.stream_mut(dir);

        if stream.flags.contains(StreamFlags::DepthReached) {
            ctx.record_segment_dropped();
            return SegmentOutcome::Drop;
        }
        if input_flags.contains(SegmentInputFlags::PseudoStreamEnd) {
            stream.flags |= StreamFlags::PseudoEofPending;
        }

        match crate::depth::apply(stream, runtime.config.reassembly_depth, seq, payload.len()) {
            Some(0) | None => {
                ctx.record_segment_dropped();
                return SegmentOutcome::Drop;
            }
            Some(n) => n,
        }
    };
    let payload = &payload[..accepted_len];

    let mut buf = match runtime.pool.get(payload.len()) {
        Some(b) => b,
        None => {
            events.raise(Event::NoSegment);
            ctx.record_segment_dropped();
            return SegmentOutcome::Drop;
        }
    };
    buf.as_mut_slice()[..payload.len()].copy_from_slice(payload);
    buf.set_len(payload.len() as u16);
    let seg = Segment::new(seq, buf);

    let outcome = {
        let stream = session.stream_mut(dir);
        let seg_end = seq.wrapping_add(accepted_len as u32);
        if seq_lt(stream.next_seq, seg_end) {
            stream.next_seq = seg_end;
        }

        let base = stream.ra_base_seq();
        let policy = stream.os_policy;
        let check_diff = runtime.config.check_overlap_different_data;
        match crate::overlap::insert(
            &mut stream.list,
            &runtime.pool,
            policy,
            check_diff,
            base,
            seg,
            wire_rewrite.as_deref_mut(),
            events,
        ) {
            Ok(()) => SegmentOutcome::Ok,
            Err(rejected) => {
                runtime.pool.put(rejected.into_buf());
                SegmentOutcome::Drop
            }
        }
    };

    match outcome {
        SegmentOutcome::Ok => ctx.record_segment_accepted(),
        SegmentOutcome::Drop => ctx.record_segment_dropped(),
    }

    if outcome == SegmentOutcome::Ok && runtime.config.inline_mode {
        deliver_inline(session, runtime, ctx, dir, seq, accepted_len as u32, flow_id, app_sink, raw_sink, events);
    }

    outcome
}

/// The inline (IPS) delivery variant: triggered on every data packet rather
/// than on ACKs, with the raw matcher's sliding window centered on the
/// packet just inserted rather than on the list tail.
#[allow(clippy::too_many_arguments)]
fn deliver_inline(
    session: &mut Session,
    runtime: &ReassemblyRuntime,
    ctx: &PerThreadContext,
    dir: Direction,
    seq: u32,
    len: u32,
    flow_id: u64,
    app_sink: &mut dyn AppLayerSink,
    raw_sink: &mut dyn RawMatcherSink,
    events: &mut EventSink,
) {
    let state = session.state;
    let gap_before = session.stream(dir).flags.contains(StreamFlags::Gap);
    {
        let (stream, sflags) = session.stream_and_flags_mut(dir);
        app::deliver(stream, state, sflags, dir, &runtime.config, app_sink, events);
    }
    let right_edge = seq.wrapping_add(len);
    {
        let stream = session.stream_mut(dir);
        raw::deliver(stream, state, dir, &runtime.config, flow_id, right_edge, raw_sink, events);
    }
    if !gap_before && session.stream(dir).flags.contains(StreamFlags::Gap) {
        ctx.record_gap_declared();
    }
    let pruned = pruner::prune(session.stream_mut(dir), &runtime.pool);
    if pruned > 0 {
        ctx.record_segments_pruned(pruned as u64);
    }
}

/// Processes an ACK packet traveling in `ack_dir`: delivers through the
/// app and raw reassemblers on the opposite direction, then lets the
/// pruner reclaim segments on both. `last_ack`/`window` are the updated
/// acknowledged edge and advertised window for the data flowing in the
/// *opposite* direction (`data_dir` below) -- an ACK packet always
/// describes how far the sender has received the other side's data, never
/// its own -- maintained by the external tracker and passed through here
/// because the reassembler has no other way to learn them.
///
/// Returns `Err` only on a detected programming-invariant violation (a
/// cursor that moved backward after delivery) -- the benign, expected
/// outcomes (no data ready, a gap declared, depth reached) are all `Ok`;
/// nothing short of a genuine bug is ever propagated as an exception-like
/// control transfer.
#[allow(clippy::too_many_arguments)]
pub fn on_ack(
    session: &mut Session,
    runtime: &ReassemblyRuntime,
    ctx: &PerThreadContext,
    ack_dir: Direction,
    last_ack: u32,
    window: u32,
    flow_id: u64,
    app_sink: &mut dyn AppLayerSink,
    raw_sink: &mut dyn RawMatcherSink,
    events: &mut EventSink,
) -> Result<()> {
    let data_dir = ack_dir.opposite();

    // `last_ack`/`window` describe how far the peer has acknowledged *this
    // flow's* data, which lives on the stream the data traveled on
    // (`data_dir`), not on the stream the ACK packet itself traveled on.
    {
        let acked = session.stream_mut(data_dir);
        acked.last_ack = last_ack;
        acked.window = window;
    }

    let state = session.state;
    let prev_app_base = session.stream(data_dir).ra_app_base_seq;
    let gap_before = session.stream(data_dir).flags.contains(StreamFlags::Gap);

    {
        let (stream, sflags) = session.stream_and_flags_mut(data_dir);
        app::deliver(stream, state, sflags, data_dir, &runtime.config, app_sink, events);
    }

    if !gap_before && session.stream(data_dir).flags.contains(StreamFlags::Gap) {
        ctx.record_gap_declared();
    }

    let new_app_base = session.stream(data_dir).ra_app_base_seq;
    if seq_lt(new_app_base, prev_app_base) {
        invariant_violation(ReassemblyError::CursorUnderflow(format!(
            "app cursor regressed from {} to {}",
            prev_app_base, new_app_base
        )));
        bail!("application cursor regressed on direction {:?}", data_dir);
    }

    let pseudo_eof = session
        .stream(data_dir)
        .flags
        .contains(StreamFlags::PseudoEofPending);
    let (opp_next_seq, opp_last_ack) = {
        let acked = session.stream(ack_dir);
        (acked.next_seq, acked.last_ack)
    };
    let trigger = raw::check_limit(
        session.flags,
        state,
        pseudo_eof,
        opp_next_seq,
        opp_last_ack,
        runtime.config.raw_check_min_len,
    );

    if trigger {
        raw::consume_trigger(&mut session.flags);
        session.stream_mut(data_dir).flags &= !StreamFlags::PseudoEofPending;

        let gap_before_raw = session.stream(data_dir).flags.contains(StreamFlags::Gap);
        let right_edge = {
            let stream = session.stream(data_dir);
            match stream.list.tail() {
                Some(t) => stream.list.get(t).end_seq(),
                None => stream.next_seq,
            }
        };
        let stream = session.stream_mut(data_dir);
        raw::deliver(stream, state, data_dir, &runtime.config, flow_id, right_edge, raw_sink, events);
        if !gap_before_raw && session.stream(data_dir).flags.contains(StreamFlags::Gap) {
            ctx.record_gap_declared();
        }
    }

    let pruned_data = pruner::prune(session.stream_mut(data_dir), &runtime.pool);
    let pruned_ack = pruner::prune(session.stream_mut(ack_dir), &runtime.pool);
    let pruned = pruned_data + pruned_ack;
    if pruned > 0 {
        ctx.record_segments_pruned(pruned as u64);
    }

    Ok(())
}

/// Tears down a session: every segment goes back to the pool and every flow
/// variable is freed. Any already-enqueued `StreamMsg`s that still
/// reference this flow are the consumer's responsibility to discard --
/// this crate owns no output queue itself; output queues are per-worker,
/// not per-flow.
pub fn on_session_destroy(session: &mut Session, runtime: &ReassemblyRuntime) {
    session.destroy(&runtime.pool);
}

/// Requests a raw-reassembly pass on the next ACK for `session`. An
/// external consumer (the raw pattern matcher itself, or a rule action)
/// calls this to force a pass outside the normal trigger conditions.
pub fn on_trigger_raw(session: &mut Session) {
    session.flags |= SessionFlags::TriggerRawReassembly;
}

//! The Overlap Resolver — the central reassembly algorithm.
//!
//! `conntrack::conn::tcp_conn::reassembly::overlap` implements the
//! single-policy (always-keep-new) special case of this resolver — it
//! trims an out-of-order segment's leading edge against one neighbor and
//! returns. This module generalizes that idea to a full per-target-OS
//! policy table: arbitrary target-OS policies, fabricating a replacement
//! segment that may absorb several list neighbors in one pass, following
//! that `overlap()` only in spirit (copy old bytes, selectively overlay
//! surviving bytes). The policy table itself is data, not a nested `match`
//! tree duplicated at each call site, in the same table-driven dispatch
//! style as `filter::ptree`.

use crate::config::OsPolicy;
use crate::error::{Event, EventSink};
use crate::memory::BufferPool;
use crate::seq::{seq_geq, seq_gt, seq_leq, seq_lt};
use crate::segment::{classify, EndCase, SegFlags, SegHandle, Segment, SegmentList, StartCase};

/// Which side's bytes survive in an overlap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteChoice {
    Old,
    New,
}

/// The dense overlap byte-choice table, expressed as a pure function of
/// policy and case rather than inline conditionals.
pub fn overlap_byte_choice(policy: OsPolicy, start: StartCase, end: EndCase) -> ByteChoice {
    use EndCase::*;
    use OsPolicy::*;
    use StartCase::*;

    match policy {
        Last => ByteChoice::New,
        First | Vista => ByteChoice::Old,
        Solaris | Hpux11 => match end {
            EndsAfter | EndsSame => ByteChoice::New,
            EndsBefore => ByteChoice::Old,
        },
        Linux => match start {
            Before => ByteChoice::New,
            Same => match end {
                EndsAfter => ByteChoice::New,
                EndsSame | EndsBefore => ByteChoice::Old,
            },
            After => ByteChoice::Old,
        },
        OldLinux => match start {
            Before => ByteChoice::New,
            Same => match end {
                EndsAfter | EndsSame => ByteChoice::New,
                EndsBefore => ByteChoice::Old,
            },
            After => ByteChoice::Old,
        },
        Bsd | Hpux10 | Irix | Windows | Windows2k3 | Macos => match start {
            Before | Same => ByteChoice::New,
            After => ByteChoice::Old,
        },
    }
}

/// Inserts `seg` into `list`, reconciling any overlap with existing members
/// per `policy`.
///
/// `base_seq` is the relevant consumer cursor used to reject segments that
/// are wholly stale. `wire_rewrite`, when `Some`, is the raw outgoing
/// packet buffer for `seg` in inline (IPS) mode; its bytes are rewritten to
/// match already-stored data wherever the two disagree in an overlap
/// region chosen to keep old bytes, so the forwarded packet agrees with
/// what this engine analyzes.
///
/// On success the segment is consumed into the list (possibly fused with
/// one or more existing neighbors into a single fabricated replacement).
/// On rejection (stale segment, or pool exhaustion while fabricating a
/// replacement) the segment is handed back so the caller can release its
/// buffer.
pub fn insert(
    list: &mut SegmentList,
    pool: &BufferPool,
    policy: OsPolicy,
    check_overlap_different_data: bool,
    base_seq: u32,
    seg: Segment,
    mut wire_rewrite: Option<&mut [u8]>,
    events: &mut EventSink,
) -> Result<(), Segment> {
    if seq_leq(seg.end_seq(), base_seq) {
        events.raise(Event::SegmentBeforeBaseSeq);
        return Err(seg);
    }

    if list.is_empty() {
        list.append(seg);
        return Ok(());
    }
    let tail = list.tail().expect("non-empty list has a tail");
    if seq_geq(seg.seq, list.get(tail).end_seq()) {
        list.append(seg);
        return Ok(());
    }

    let first = match list.find_first_overlap(seg.seq) {
        Some(h) => h,
        None => {
            list.append(seg);
            return Ok(());
        }
    };

    if seq_leq(seg.end_seq(), list.get(first).seq) {
        // Gap-filler: seg sits entirely before `first`, no overlap at all.
        list.insert_before(first, seg);
        return Ok(());
    }

    let new_seq = seg.seq;
    let new_end = seg.end_seq();

    // Collect every existing neighbor seg's tail still reaches into, tracking
    // the *true* union end uncapped. The fabricated replacement can never
    // exceed the largest pool size class (`u16::MAX` bytes) though -- either
    // `seg` itself or a merged neighbor can individually be up to `u16::MAX`
    // bytes, and a union spanning several of them can exceed that ceiling in
    // either direction -- so the true union end is clamped once below, and
    // whichever tail (new or old) falls beyond the ceiling is dropped rather
    // than panicking on an out-of-bounds write or silently losing bytes some
    // other way.
    let mut merged = vec![first];
    let union_seq = if seq_leq(new_seq, list.get(first).seq) {
        new_seq
    } else {
        list.get(first).seq
    };
    let cap_end = union_seq.wrapping_add(u16::MAX as u32);
    let mut raw_union_end = if seq_geq(new_end, list.get(first).end_seq()) {
        new_end
    } else {
        list.get(first).end_seq()
    };
    let mut cur = first;
    while let Some(next) = list.next(cur) {
        if seq_lt(list.get(next).seq, new_end) {
            let next_end = list.get(next).end_seq();
            if seq_gt(next_end, raw_union_end) {
                raw_union_end = next_end;
            }
            merged.push(next);
            cur = next;
            if seq_geq(raw_union_end, cap_end) {
                // Capacity is already exhausted; no further neighbor can fit.
                break;
            }
        } else {
            break;
        }
    }

    let dropped_tail = seq_gt(raw_union_end, cap_end);
    let union_end = if dropped_tail { cap_end } else { raw_union_end };
    let union_len = union_end.wrapping_sub(union_seq) as usize;
    debug_assert!(union_len <= u16::MAX as usize);

    let mut buf = match pool.get(union_len) {
        Some(b) => b,
        None => {
            events.raise(Event::NoSegment);
            return Err(seg);
        }
    };
    buf.set_len(union_len as u16);
    if dropped_tail {
        log::warn!(
            "overlap fabrication exceeded the largest segment class at seq {}; dropping the overflowing tail",
            union_seq
        );
        events.raise(Event::NoSegment);
    }

    // Step A: lay down the incoming segment's own bytes everywhere it has
    // data. This is correct for any sub-range no existing segment covers
    // (leading/trailing extension past old data, or a hole between two
    // merged old segments that `seg` bridges); overlap sub-ranges are
    // selectively corrected in step C below.
    {
        let rel = new_seq.wrapping_sub(union_seq) as usize;
        let n = seg.payload().len().min(union_len.saturating_sub(rel));
        if n > 0 {
            buf.as_mut_slice()[rel..rel + n].copy_from_slice(&seg.payload()[..n]);
        }
    }

    // Step B: lay down each merged old segment's bytes outside `seg`'s own
    // range -- `seg` never touches these positions, so there is no policy
    // question.
    for &h in &merged {
        let old = list.get(h);
        let old_seq = old.seq;
        let old_end = old.end_seq();
        // An old segment's tail beyond `union_end` was deliberately dropped
        // above when the fabricated replacement hit the size-class ceiling;
        // never copy past the buffer the replacement actually owns.
        let old_end_capped = if seq_gt(old_end, union_end) { union_end } else { old_end };

        if seq_lt(old_seq, new_seq) {
            let prefix_end = if seq_leq(old_end, new_seq) { old_end } else { new_seq };
            copy_old_range(&mut buf, union_seq, old, old_seq, prefix_end);
        }
        if seq_lt(new_end, old_end_capped) {
            let suffix_start = if seq_leq(new_end, old_seq) { old_seq } else { new_end };
            copy_old_range(&mut buf, union_seq, old, suffix_start, old_end_capped);
        }
    }

    // Step C: for the genuine overlap sub-range against each merged old
    // segment, consult the policy table; `ByteChoice::Old` undoes step A's
    // provisional new bytes there.
    let mut all_processed = SegFlags::all();
    for &h in &merged {
        let old = list.get(h);
        let old_seq = old.seq;
        let old_end = old.end_seq();

        let ov_start = if seq_leq(new_seq, old_seq) { old_seq } else { new_seq };
        let ov_end = if seq_leq(new_end, old_end) { new_end } else { old_end };
        if seq_lt(ov_start, ov_end) {
            let (start_case, end_case) = classify(new_seq, new_end, old_seq, old_end);
            let choice = overlap_byte_choice(policy, start_case, end_case);

            let new_rel = ov_start.wrapping_sub(new_seq) as usize;
            let old_rel = ov_start.wrapping_sub(old_seq) as usize;
            let n = ov_end.wrapping_sub(ov_start) as usize;
            let new_bytes = &seg.payload()[new_rel..new_rel + n];
            let old_bytes = &old.payload()[old_rel..old_rel + n];

            let differs = new_bytes != old_bytes;
            if differs && check_overlap_different_data {
                events.raise(Event::OverlapDifferentData);
            }

            let union_rel = ov_start.wrapping_sub(union_seq) as usize;
            match choice {
                ByteChoice::Old => {
                    buf.as_mut_slice()[union_rel..union_rel + n].copy_from_slice(old_bytes);
                    if differs {
                        if let Some(wire) = wire_rewrite.as_deref_mut() {
                            let wire_rel = ov_start.wrapping_sub(new_seq) as usize;
                            if wire_rel + n <= wire.len() {
                                wire[wire_rel..wire_rel + n].copy_from_slice(old_bytes);
                            }
                        }
                    }
                }
                ByteChoice::New => { /* step A already wrote the surviving bytes. */ }
            }
        }
        all_processed &= old.flags;
    }

    let mut fabricated = Segment::new(union_seq, buf);
    fabricated.flags = all_processed;

    // Remove every merged segment except the first (whose slot the
    // fabricated replacement takes over, preserving list position), then
    // swap in the replacement.
    for &h in merged[1..].iter().rev() {
        list.remove(h, pool);
    }
    let old_first = list.replace(first, fabricated);
    pool.put(old_first.into_buf());
    pool.put(seg.into_buf());

    Ok(())
}

fn copy_old_range(
    buf: &mut crate::memory::PooledBuf,
    union_seq: u32,
    old: &Segment,
    range_start: u32,
    range_end: u32,
) {
    if !seq_lt(range_start, range_end) {
        return;
    }
    let old_rel = range_start.wrapping_sub(old.seq) as usize;
    let n = range_end.wrapping_sub(range_start) as usize;
    let union_rel = range_start.wrapping_sub(union_seq) as usize;
    buf.as_mut_slice()[union_rel..union_rel + n].copy_from_slice(&old.payload()[old_rel..old_rel + n]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferPool;

    fn make_segment(pool: &BufferPool, seq: u32, data: &[u8]) -> Segment {
        let mut buf = pool.get(data.len()).unwrap();
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        buf.set_len(data.len() as u16);
        Segment::new(seq, buf)
    }

    fn delivered(list: &SegmentList) -> Vec<u8> {
        let mut out = Vec::new();
        for h in list.iter() {
            out.extend_from_slice(list.get(h).payload());
        }
        out
    }

    fn run(policy: OsPolicy, inputs: &[(u32, &[u8])]) -> Vec<u8> {
        let pool = BufferPool::new(1 << 20);
        let mut list = SegmentList::new();
        let mut events = EventSink::new();
        for &(seq, data) in inputs {
            let seg = make_segment(&pool, seq, data);
            insert(&mut list, &pool, policy, false, 0, seg, None, &mut events).unwrap();
        }
        delivered(&list)
    }

    #[test]
    fn s1_no_overlap_bsd() {
        let out = run(
            OsPolicy::Bsd,
            &[(2, b"AAAAA"), (7, b"BBBBB"), (12, b"CCCCC")],
        );
        assert_eq!(out, b"AAAAABBBBBCCCCC");
    }

    #[test]
    fn s2_before_ends_after_bsd_keeps_old_then_new_at_chain_boundary() {
        // (2,"AAAAA") -> [2,7)
        // (7,"BBBBB") -> [7,12)
        // (4,"JJJJ")  -> [4,8) overlaps [2,7) BEFORE/ENDS_AFTER (old wins,
        // so positions 4-6 stay 'A'), then its remaining byte at position 7
        // overlaps [7,12) SAME/ENDS_BEFORE (new wins there).
        let out = run(OsPolicy::Bsd, &[(2, b"AAAAA"), (7, b"BBBBB"), (4, b"JJJJ")]);
        assert_eq!(out, b"AAAAAJBBBB");
    }

    #[test]
    fn s3_last_always_new() {
        let out = run(OsPolicy::Last, &[(2, b"AAAAA"), (4, b"JJJJJ")]);
        assert_eq!(out, b"AAJJJJJ");
    }

    #[test]
    fn s4_first_always_old() {
        let out = run(OsPolicy::First, &[(2, b"AAAAA"), (4, b"JJJJJ")]);
        assert_eq!(out, b"AAAAAJJ");
    }

    #[test]
    fn s8_overlap_different_data_event() {
        let pool = BufferPool::new(1 << 20);
        let mut list = SegmentList::new();
        let mut events = EventSink::new();
        insert(
            &mut list,
            &pool,
            OsPolicy::Bsd,
            true,
            0,
            make_segment(&pool, 2, b"AAAAA"),
            None,
            &mut events,
        )
        .unwrap();
        insert(
            &mut list,
            &pool,
            OsPolicy::Bsd,
            true,
            0,
            make_segment(&pool, 2, b"BBBBB"),
            None,
            &mut events,
        )
        .unwrap();
        assert!(events.events().contains(&Event::OverlapDifferentData));
        // SAME/ENDS_SAME under BSD's default group keeps NEW.
        assert_eq!(delivered(&list), b"BBBBB");
    }

    #[test]
    fn solaris_keeps_new_only_when_it_extends_past_old_end() {
        // new ends exactly at old's end (EndsSame) -> Solaris keeps NEW.
        let out = run(OsPolicy::Solaris, &[(2, b"AAAAA"), (2, b"BBBBB")]);
        assert_eq!(out, b"BBBBB");

        // new ends before old's end (EndsBefore) -> Solaris keeps OLD.
        let out = run(OsPolicy::Solaris, &[(2, b"AAAAA"), (2, b"BB")]);
        assert_eq!(out, b"AAAAA");
    }

    #[test]
    fn linux_starts_at_rule_only_fires_on_exact_same_start() {
        // SAME start, ends before -> Linux keeps OLD (unlike Solaris-style).
        let out = run(OsPolicy::Linux, &[(2, b"AAAAA"), (2, b"BB")]);
        assert_eq!(out, b"AAAAA");

        // SAME start, ends after -> Linux keeps NEW.
        let out = run(OsPolicy::Linux, &[(2, b"AA"), (2, b"BBBBB")]);
        assert_eq!(out, b"BBBBB");
    }

    #[test]
    fn rejects_segment_wholly_before_base_seq() {
        let pool = BufferPool::new(1 << 20);
        let mut list = SegmentList::new();
        let mut events = EventSink::new();
        let seg = make_segment(&pool, 2, b"AAAAA"); // [2,7)
        let res = insert(&mut list, &pool, OsPolicy::Bsd, false, 7, seg, None, &mut events);
        assert!(res.is_err());
        assert!(events.events().contains(&Event::SegmentBeforeBaseSeq));
    }

    #[test]
    fn union_spanning_more_than_one_size_class_drops_the_overflowing_tail_instead_of_panicking() {
        let pool = BufferPool::new(1 << 20);
        let mut list = SegmentList::new();
        let mut events = EventSink::new();
        // Existing segment [65534, 131069); incoming segment [0, 65535).
        // Their union would span 131069 bytes, past the largest size class.
        let old_data = vec![b'A'; 65535];
        let new_data = vec![b'B'; 65535];
        insert(
            &mut list,
            &pool,
            OsPolicy::Bsd,
            false,
            0,
            make_segment(&pool, 65534, &old_data),
            None,
            &mut events,
        )
        .unwrap();
        insert(
            &mut list,
            &pool,
            OsPolicy::Bsd,
            false,
            0,
            make_segment(&pool, 0, &new_data),
            None,
            &mut events,
        )
        .unwrap();

        assert!(events.events().contains(&Event::NoSegment));
        let out = delivered(&list);
        assert_eq!(out.len(), 65535);
        // BSD's Before/ends-after rule keeps NEW throughout the overlap, and
        // the dropped tail never makes it into the fabricated replacement.
        assert!(out.iter().all(|&b| b == b'B'));
    }

    #[test]
    fn inline_rewrite_matches_stored_old_bytes() {
        let pool = BufferPool::new(1 << 20);
        let mut list = SegmentList::new();
        let mut events = EventSink::new();
        insert(
            &mut list,
            &pool,
            OsPolicy::Bsd, // After-case keeps OLD
            false,
            0,
            make_segment(&pool, 0, b"AAAAAAAA"), // [0,8)
            None,
            &mut events,
        )
        .unwrap();

        let mut wire = *b"XXXX"; // the incoming (attacker-controlled) bytes
        let seg = make_segment(&pool, 2, &wire); // [2,6), starts inside old -> AFTER
        insert(
            &mut list,
            &pool,
            OsPolicy::Bsd,
            false,
            0,
            seg,
            Some(&mut wire),
            &mut events,
        )
        .unwrap();

        assert_eq!(delivered(&list), b"AAAAAAAA");
        assert_eq!(&wire, b"AAAA");
    }
}

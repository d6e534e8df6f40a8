//! The Pruner: releases segments no longer needed by either consumer back
//! to the segment pool.
//!
//! Follows `conn_info.rs`'s `done_probe`/eviction sweep — a head-of-list
//! scan that stops at the first segment still in use, logging at debug
//! level as it frees each one.

use crate::memory::BufferPool;
use crate::seq::seq_gt;
use crate::segment::SegFlags;
use crate::stream::Stream;

/// Walks the head of `stream`'s list, releasing every segment that both
/// consumers have fully passed and fully processed, stopping at the first
/// segment that must still be retained. Returns the number of segments
/// released.
pub fn prune(stream: &mut Stream, pool: &BufferPool) -> usize {
    let mut released = 0;
    loop {
        let Some(h) = stream.list.head() else { break };
        let seg = stream.list.get(h);

        let below_app = !seq_gt(seg.end_seq(), stream.ra_app_base_seq.wrapping_add(1));
        let below_raw = !seq_gt(seg.end_seq(), stream.ra_raw_base_seq.wrapping_add(1));
        if !(below_app && below_raw) {
            break;
        }

        if !(seg.flags.contains(SegFlags::ApplayerProcessed) && seg.flags.contains(SegFlags::RawProcessed)) {
            break;
        }

        // The oldest still-queued StreamMsg, if any, is the earliest-start
        // pending message; if it starts before this segment ends, some
        // queued message may still reference these bytes.
        if let Some(pending) = stream.pending_raw_seq {
            if seq_gt(seg.end_seq(), pending) {
                break;
            }
        }

        log::debug!("pruner: releasing segment at seq {}", seg.seq);
        stream.list.remove(h, pool);
        released += 1;
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsPolicy;
    use crate::memory::BufferPool;
    use crate::segment::Segment;

    fn push(stream: &mut Stream, pool: &BufferPool, seq: u32, data: &[u8], processed: bool) {
        let mut buf = pool.get(data.len()).unwrap();
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        buf.set_len(data.len() as u16);
        let mut seg = Segment::new(seq, buf);
        if processed {
            seg.flags = SegFlags::ApplayerProcessed | SegFlags::RawProcessed;
        }
        stream.list.append(seg);
    }

    #[test]
    fn releases_fully_consumed_prefix_and_stops_at_first_unprocessed() {
        let pool = BufferPool::new(1 << 20);
        let mut stream = Stream::new(0, OsPolicy::Linux);
        push(&mut stream, &pool, 0, b"AAAAA", true);
        push(&mut stream, &pool, 5, b"BBBBB", false);
        stream.ra_app_base_seq = 9;
        stream.ra_raw_base_seq = 9;

        let released = prune(&mut stream, &pool);

        assert_eq!(released, 1);
        assert_eq!(stream.list.len(), 1);
        assert_eq!(stream.list.get(stream.list.head().unwrap()).seq, 5);
    }

    #[test]
    fn retains_segment_still_referenced_by_a_queued_message() {
        let pool = BufferPool::new(1 << 20);
        let mut stream = Stream::new(0, OsPolicy::Linux);
        push(&mut stream, &pool, 0, b"AAAAA", true);
        stream.ra_app_base_seq = 9;
        stream.ra_raw_base_seq = 9;
        stream.pending_raw_seq = Some(2);

        let released = prune(&mut stream, &pool);

        assert_eq!(released, 0);
        assert_eq!(stream.list.len(), 1, "segment ending after the pending message's seq must survive");
    }
}

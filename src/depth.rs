//! The Depth Gate: truncates or rejects data past a configured per-stream
//! reassembly depth, ahead of insertion into the segment list.
//!
//! `conn_info.rs` tracks a similar per-stream byte budget before handing
//! data to its parser; this module follows the same "compute an accepted
//! length, let the caller slice before copying" shape rather than mutating
//! the packet in place.

use crate::seq::{seq_geq, seq_gt};
use crate::stream::{Stream, StreamFlags};

/// Applies the depth gate to an incoming segment of `len` bytes starting at
/// `seq`. Returns the number of leading bytes to accept (`<= len`), or
/// `None` if the entire segment must be dropped. Setting `StreamFlags::DepthReached`
/// is this function's only side effect.
pub fn apply(stream: &mut Stream, reassembly_depth: u32, seq: u32, len: usize) -> Option<usize> {
    if reassembly_depth == 0 {
        return Some(len);
    }

    let depth_end = stream.isn.wrapping_add(reassembly_depth);
    let base = stream.ra_base_seq();

    if seq_geq(base.wrapping_add(1), depth_end) {
        stream.flags |= StreamFlags::DepthReached;
        return None;
    }

    if seq_geq(seq, depth_end) {
        stream.flags |= StreamFlags::DepthReached;
        return None;
    }

    let seg_end = seq.wrapping_add(len as u32);
    if seq_gt(seg_end, depth_end) {
        stream.flags |= StreamFlags::DepthReached;
        let accepted = depth_end.wrapping_sub(seq) as usize;
        return Some(accepted.min(len));
    }

    Some(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsPolicy;

    fn stream() -> Stream {
        Stream::new(0, OsPolicy::Linux)
    }

    #[test]
    fn unlimited_depth_accepts_everything() {
        let mut s = stream();
        assert_eq!(apply(&mut s, 0, 1_000_000, 9000), Some(9000));
        assert!(!s.flags.contains(StreamFlags::DepthReached));
    }

    #[test]
    fn accepts_within_budget() {
        let mut s = stream();
        assert_eq!(apply(&mut s, 100, 0, 50), Some(50));
        assert!(!s.flags.contains(StreamFlags::DepthReached));
    }

    #[test]
    fn truncates_segment_crossing_the_boundary() {
        let mut s = stream();
        assert_eq!(apply(&mut s, 100, 90, 50), Some(10));
        assert!(s.flags.contains(StreamFlags::DepthReached));
    }

    #[test]
    fn rejects_once_cursor_has_passed_depth() {
        let mut s = stream();
        s.ra_app_base_seq = 150;
        s.ra_raw_base_seq = 150;
        assert_eq!(apply(&mut s, 100, 200, 10), None);
        assert!(s.flags.contains(StreamFlags::DepthReached));
    }

    #[test]
    fn rejects_segment_starting_past_depth_end() {
        let mut s = stream();
        assert_eq!(apply(&mut s, 100, 150, 10), None);
        assert!(s.flags.contains(StreamFlags::DepthReached));
    }
}

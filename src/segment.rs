//! The segment record and the per-direction, arena-indexed segment list.
//!
//! Uses an arena of segments indexed by a 32-bit handle, with list linkage
//! expressed as handle pairs, in place of a simpler `VecDeque`-based
//! out-of-order buffer: ordering is maintained continuously (not just at
//! flush time), and overlap resolution can splice a replacement segment
//! into the middle of the list rather than only trimming a single
//! candidate. Flag composition uses `bitmask_enum::bitmask`.

use crate::memory::{BufferPool, PooledBuf};
use crate::seq::{seq_geq, seq_leq, seq_lt};

use bitmask_enum::bitmask;

/// Per-segment processing flags.
#[bitmask(u8)]
pub enum SegFlags {
    /// The app-layer reassembler has consumed every byte of this segment.
    ApplayerProcessed,
    /// The raw reassembler has consumed every byte of this segment.
    RawProcessed,
}

/// An immutable-once-inserted record of received bytes.
#[derive(Debug)]
pub struct Segment {
    /// Sequence number of the first byte.
    pub seq: u32,
    /// Number of valid payload bytes (`<= buf.capacity()`).
    payload_len: u16,
    buf: PooledBuf,
    pub flags: SegFlags,
}

impl Segment {
    pub(crate) fn new(seq: u32, buf: PooledBuf) -> Self {
        let payload_len = buf.len() as u16;
        Segment {
            seq,
            payload_len,
            buf,
            flags: SegFlags::none(),
        }
    }

    #[inline]
    pub fn payload_len(&self) -> u16 {
        self.payload_len
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf.as_slice()[..self.payload_len as usize]
    }

    #[inline]
    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.payload_len as usize;
        &mut self.buf.as_mut_slice()[..len]
    }

    /// Exclusive end of the byte range this segment covers.
    #[inline]
    pub fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.payload_len as u32)
    }

    /// Truncates the segment to `new_len` bytes, dropping the tail. Used by
    /// the depth gate and the overlap resolver when fabricating a
    /// replacement that only partially retains a segment's data.
    pub(crate) fn truncate(&mut self, new_len: u16) {
        debug_assert!(new_len <= self.payload_len);
        self.payload_len = new_len;
    }

    /// Returns `true` if `p` falls within `[seq, end_seq())`.
    #[inline]
    pub fn contains(&self, p: u32) -> bool {
        seq_leq(self.seq, p) && seq_lt(p, self.end_seq())
    }

    pub(crate) fn into_buf(self) -> PooledBuf {
        self.buf
    }
}

/// Overlap classification of an incoming segment against the earliest
/// overlapping list member `L`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCase {
    /// The new segment starts before `L`.
    Before,
    /// The new segment starts at the same sequence as `L`.
    Same,
    /// The new segment starts strictly inside `L`.
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCase {
    EndsBefore,
    EndsSame,
    EndsAfter,
}

/// Classifies `new` against `old` by start and end position.
pub fn classify(new_seq: u32, new_end: u32, old_seq: u32, old_end: u32) -> (StartCase, EndCase) {
    let start = if new_seq == old_seq {
        StartCase::Same
    } else if seq_lt(new_seq, old_seq) {
        StartCase::Before
    } else {
        StartCase::After
    };
    let end = if new_end == old_end {
        EndCase::EndsSame
    } else if seq_lt(new_end, old_end) {
        EndCase::EndsBefore
    } else {
        EndCase::EndsAfter
    };
    (start, end)
}

/// One arena slot: either a live segment with list linkage, or a free slot
/// holding the index of the next free slot (an intrusive free list).
enum Slot {
    Occupied {
        seg: Segment,
        prev: Option<u32>,
        next: Option<u32>,
    },
    Free {
        next_free: Option<u32>,
    },
}

/// Opaque handle into a `SegmentList`'s arena. Handles are only meaningful
/// within the `SegmentList` that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegHandle(u32);

/// A per-direction, sequence-ordered list of segments.
///
/// Invariants maintained by every mutating operation:
/// - no two distinct retained segments overlap after insertion;
/// - the head's `seq` is monotonically non-decreasing modulo wrap.
/// A third invariant — retained segments end after the relevant consumer
/// cursor — is the pruner's responsibility, not the list's.
pub struct SegmentList {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl Default for SegmentList {
    fn default() -> Self {
        SegmentList {
            slots: Vec::new(),
            free_head: None,
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl SegmentList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<SegHandle> {
        self.head.map(SegHandle)
    }

    pub fn tail(&self) -> Option<SegHandle> {
        self.tail.map(SegHandle)
    }

    pub fn get(&self, h: SegHandle) -> &Segment {
        match &self.slots[h.0 as usize] {
            Slot::Occupied { seg, .. } => seg,
            Slot::Free { .. } => panic!("dangling segment handle"),
        }
    }

    pub fn get_mut(&mut self, h: SegHandle) -> &mut Segment {
        match &mut self.slots[h.0 as usize] {
            Slot::Occupied { seg, .. } => seg,
            Slot::Free { .. } => panic!("dangling segment handle"),
        }
    }

    pub fn next(&self, h: SegHandle) -> Option<SegHandle> {
        match &self.slots[h.0 as usize] {
            Slot::Occupied { next, .. } => next.map(SegHandle),
            Slot::Free { .. } => None,
        }
    }

    pub fn prev(&self, h: SegHandle) -> Option<SegHandle> {
        match &self.slots[h.0 as usize] {
            Slot::Occupied { prev, .. } => prev.map(SegHandle),
            Slot::Free { .. } => None,
        }
    }

    fn alloc_slot(&mut self, seg: Segment, prev: Option<u32>, next: Option<u32>) -> u32 {
        let slot = Slot::Occupied { seg, prev, next };
        if let Some(idx) = self.free_head {
            self.free_head = match &self.slots[idx as usize] {
                Slot::Free { next_free } => *next_free,
                Slot::Occupied { .. } => unreachable!(),
            };
            self.slots[idx as usize] = slot;
            idx
        } else {
            self.slots.push(slot);
            (self.slots.len() - 1) as u32
        }
    }

    fn free_slot(&mut self, idx: u32) -> Segment {
        let old = std::mem::replace(
            &mut self.slots[idx as usize],
            Slot::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(idx);
        match old {
            Slot::Occupied { seg, .. } => seg,
            Slot::Free { .. } => panic!("double free of segment handle"),
        }
    }

    fn set_prev(&mut self, h: u32, prev: Option<u32>) {
        if let Slot::Occupied { prev: p, .. } = &mut self.slots[h as usize] {
            *p = prev;
        }
    }

    fn set_next(&mut self, h: u32, next: Option<u32>) {
        if let Slot::Occupied { next: n, .. } = &mut self.slots[h as usize] {
            *n = next;
        }
    }

    /// Appends `seg` as the new tail. Caller guarantees `seg` starts at or
    /// after the current tail's end.
    pub(crate) fn append(&mut self, seg: Segment) -> SegHandle {
        let old_tail = self.tail;
        let idx = self.alloc_slot(seg, old_tail, None);
        if let Some(t) = old_tail {
            self.set_next(t, Some(idx));
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
        self.len += 1;
        SegHandle(idx)
    }

    /// Inserts `seg` immediately before handle `before`.
    pub(crate) fn insert_before(&mut self, before: SegHandle, seg: Segment) -> SegHandle {
        let before_idx = before.0;
        let prev_idx = match &self.slots[before_idx as usize] {
            Slot::Occupied { prev, .. } => *prev,
            Slot::Free { .. } => panic!("dangling segment handle"),
        };
        let idx = self.alloc_slot(seg, prev_idx, Some(before_idx));
        if let Some(p) = prev_idx {
            self.set_next(p, Some(idx));
        } else {
            self.head = Some(idx);
        }
        self.set_prev(before_idx, Some(idx));
        self.len += 1;
        SegHandle(idx)
    }

    /// Removes `h` from the list, returning its segment, with the segment's
    /// backing buffer released to `pool`.
    pub fn remove(&mut self, h: SegHandle, pool: &BufferPool) {
        let seg = self.take(h);
        pool.put(seg.into_buf());
    }

    /// Removes `h` from the list and returns the segment without touching
    /// the pool, for callers (e.g. the overlap resolver) that reuse or
    /// relocate the buffer themselves.
    pub(crate) fn take(&mut self, h: SegHandle) -> Segment {
        let idx = h.0;
        let (prev, next) = match &self.slots[idx as usize] {
            Slot::Occupied { prev, next, .. } => (*prev, *next),
            Slot::Free { .. } => panic!("dangling segment handle"),
        };
        match prev {
            Some(p) => self.set_next(p, next),
            None => self.head = next,
        }
        match next {
            Some(n) => self.set_prev(n, prev),
            None => self.tail = prev,
        }
        self.len -= 1;
        self.free_slot(idx)
    }

    /// Replaces the segment stored at `h` in place (used when the overlap
    /// resolver fabricates a union segment spanning `L` and the incoming
    /// data); linkage is untouched.
    pub(crate) fn replace(&mut self, h: SegHandle, seg: Segment) -> Segment {
        match &mut self.slots[h.0 as usize] {
            Slot::Occupied { seg: slot, .. } => std::mem::replace(slot, seg),
            Slot::Free { .. } => panic!("dangling segment handle"),
        }
    }

    /// Iterates the list head-to-tail.
    pub fn iter(&self) -> SegmentListIter<'_> {
        SegmentListIter {
            list: self,
            cur: self.head,
        }
    }

    /// Finds the first segment `L` such that `L.end_seq() >= seq`.
    pub(crate) fn find_first_overlap(&self, seq: u32) -> Option<SegHandle> {
        let mut cur = self.head;
        while let Some(idx) = cur {
            let seg = self.get(SegHandle(idx));
            if seq_geq(seg.end_seq(), seq) {
                return Some(SegHandle(idx));
            }
            cur = self.next(SegHandle(idx));
        }
        None
    }
}

pub struct SegmentListIter<'a> {
    list: &'a SegmentList,
    cur: Option<u32>,
}

impl<'a> Iterator for SegmentListIter<'a> {
    type Item = SegHandle;

    fn next(&mut self) -> Option<SegHandle> {
        let idx = self.cur?;
        self.cur = self.list.next(SegHandle(idx));
        Some(SegHandle(idx))
    }
}

//! Per-flow reorder queue.
//!
//! Segments may arrive in any order; the queue hands out the lowest pending
//! sequence number first. The flow decides whether that segment is the one
//! it expects.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bytes::Bytes;

/// Initial heap capacity; the quota window keeps queues short.
const INITIAL_CAPACITY: usize = 16;

#[derive(Debug)]
struct Segment {
    seq: u32,
    data: Bytes,
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Segment {}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment {
    // Reversed so the max-heap yields the smallest sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        other.seq.cmp(&self.seq)
    }
}

/// Min-heap of sequenced segments.
#[derive(Debug)]
pub struct ReorderQueue {
    heap: BinaryHeap<Segment>,
}

impl ReorderQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Insert a segment.
    pub fn push(&mut self, seq: u32, data: Bytes) {
        self.heap.push(Segment { seq, data });
    }

    /// Lowest pending sequence number.
    pub fn peek_min(&self) -> Option<u32> {
        self.heap.peek().map(|s| s.seq)
    }

    /// Remove and return the segment with the lowest sequence number.
    pub fn pop_min(&mut self) -> Option<(u32, Bytes)> {
        self.heap.pop().map(|s| (s.seq, s.data))
    }

    /// Number of pending segments.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Discard every pending segment.
    pub fn clear(&mut self) {
        self.heap = BinaryHeap::with_capacity(INITIAL_CAPACITY);
    }
}

impl Default for ReorderQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_sequence_order() {
        let mut queue = ReorderQueue::new();
        for seq in [4u32, 0, 3, 1, 2] {
            queue.push(seq, Bytes::from(vec![seq as u8]));
        }

        assert_eq!(queue.len(), 5);
        assert_eq!(queue.peek_min(), Some(0));

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop_min().map(|(seq, _)| seq)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut queue = ReorderQueue::new();
        queue.push(7, Bytes::from_static(b"x"));

        assert_eq!(queue.peek_min(), Some(7));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_min(), Some((7, Bytes::from_static(b"x"))));
        assert_eq!(queue.pop_min(), None);
    }

    #[test]
    fn test_clear() {
        let mut queue = ReorderQueue::new();
        queue.push(1, Bytes::from_static(b"a"));
        queue.push(2, Bytes::from_static(b"b"));
        queue.clear();

        assert!(queue.is_empty());
        assert_eq!(queue.peek_min(), None);
    }
}

//! A range-coalescing allocator for dense u64 ID spaces.
//!
//! Free IDs are kept as a sorted list of inclusive `[start, end]` segments.
//! Allocation pops from the lowest segment; releasing an ID re-inserts it
//! and merges with adjacent segments, so a fully-released allocator
//! collapses back to one segment. Frontend bindings use this to hand out
//! and recycle file-handle and inode numbers.

use thiserror::Error;

/// The range being added overlaps IDs that are already free.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("range [{start}, {end}] overlaps an existing free range")]
pub struct RangeOverlap {
    /// First ID of the rejected range.
    pub start: u64,
    /// Last ID of the rejected range.
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: u64,
    end: u64,
}

/// Allocator over a set of free ID segments.
#[derive(Debug, Default)]
pub struct IdAllocator {
    segments: Vec<Segment>,
    total: u64,
}

impl IdAllocator {
    /// An allocator with no free IDs. Seed it with [`IdAllocator::add_range`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of IDs currently free.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.total
    }

    /// Index of the first segment whose start is at or after `id`.
    fn find_segment(&self, id: u64) -> usize {
        self.segments
            .iter()
            .position(|s| s.start >= id)
            .unwrap_or(self.segments.len())
    }

    /// Take the lowest free ID, or `None` if the space is exhausted.
    pub fn alloc(&mut self) -> Option<u64> {
        let segment = self.segments.first_mut()?;
        let result = segment.start;
        self.total -= 1;
        if segment.start == segment.end {
            self.segments.remove(0);
        } else {
            segment.start += 1;
        }
        Some(result)
    }

    /// Add the inclusive range `[start, end]` to the free set.
    ///
    /// Adjacent segments are merged; overlapping ranges are rejected and
    /// leave the allocator unchanged.
    pub fn add_range(&mut self, start: u64, end: u64) -> Result<(), RangeOverlap> {
        let index = self.find_segment(start);
        let count = (end - start) + 1;

        if index > 0 {
            let prev = self.segments[index - 1];
            if prev.end >= start {
                return Err(RangeOverlap { start, end });
            }
            if prev.end + 1 == start {
                // Grows the previous segment; may bridge the gap to the next.
                self.segments[index - 1].end = end;
                self.total += count;
                if index < self.segments.len() && self.segments[index].start == end + 1 {
                    self.segments[index - 1].end = self.segments[index].end;
                    self.segments.remove(index);
                }
                return Ok(());
            }
        }

        if index < self.segments.len() {
            let next = self.segments[index];
            if next.start <= end {
                return Err(RangeOverlap { start, end });
            }
            if next.start == end + 1 {
                self.segments[index].start = start;
                self.total += count;
                return Ok(());
            }
            self.segments.insert(index, Segment { start, end });
        } else {
            self.segments.push(Segment { start, end });
        }
        self.total += count;
        Ok(())
    }

    /// Return a single ID to the free set.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already free. Releasing an ID twice is a
    /// bookkeeping bug in the caller, not a recoverable condition.
    pub fn release(&mut self, id: u64) {
        if let Err(e) = self.add_range(id, id) {
            panic!("double release of id {id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> IdAllocator {
        let mut list = IdAllocator::new();
        list.add_range(1, 1024).unwrap();
        list
    }

    fn segments(list: &IdAllocator) -> Vec<(u64, u64)> {
        list.segments.iter().map(|s| (s.start, s.end)).collect()
    }

    #[test]
    fn count_reflects_the_seed() {
        assert_eq!(seeded().count(), 1024);
    }

    #[test]
    fn alloc_hands_out_ascending_ids() {
        let mut list = seeded();
        for i in 1..1024 {
            assert_eq!(list.alloc(), Some(i));
            assert_eq!(list.count(), 1024 - i);
        }
    }

    #[test]
    fn alloc_runs_dry() {
        let mut list = IdAllocator::new();
        list.add_range(1, 1).unwrap();

        assert_eq!(list.alloc(), Some(1));
        assert_eq!(list.count(), 0);
        assert_eq!(list.alloc(), None, "exhausted allocator must refuse");
    }

    #[test]
    fn release_extends_the_last_segment() {
        let mut list = seeded();
        list.release(1025);

        assert_eq!(list.count(), 1025);
        assert_eq!(segments(&list), vec![(1, 1025)]);
    }

    #[test]
    fn release_out_of_sequence_opens_a_segment() {
        let mut list = seeded();
        list.release(1026);

        assert_eq!(list.count(), 1025);
        assert_eq!(segments(&list), vec![(1, 1024), (1026, 1026)]);
    }

    #[test]
    fn release_before_the_first_segment() {
        let mut list = seeded();
        list.alloc();
        list.alloc();

        list.release(1);
        assert_eq!(list.count(), 1023);
        assert_eq!(segments(&list), vec![(1, 1), (3, 1024)]);
    }

    #[test]
    fn release_at_the_start_of_a_segment_merges() {
        let mut list = seeded();
        list.alloc();
        list.alloc();

        list.release(2);
        assert_eq!(list.count(), 1023);
        assert_eq!(segments(&list), vec![(2, 1024)]);
    }

    #[test]
    fn release_between_segments_bridges_them() {
        let mut list = seeded();
        list.release(1026);
        list.release(1025);

        assert_eq!(list.count(), 1026);
        assert_eq!(segments(&list), vec![(1, 1026)]);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_at_segment_start_panics() {
        let mut list = seeded();
        list.release(1);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_inside_segment_panics() {
        let mut list = seeded();
        list.release(1026);
        list.release(1027);
        list.release(1023);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_at_segment_end_panics() {
        let mut list = seeded();
        list.release(1026);
        list.release(1027);
        list.release(1024);
    }

    #[test]
    fn add_range_non_consecutive_behind() {
        let mut list = IdAllocator::new();
        list.add_range(0, 99).unwrap();
        list.add_range(200, 299).unwrap();

        assert_eq!(list.count(), 200);
        assert_eq!(segments(&list), vec![(0, 99), (200, 299)]);
    }

    #[test]
    fn add_range_non_consecutive_in_front() {
        let mut list = IdAllocator::new();
        list.add_range(200, 299).unwrap();
        list.add_range(0, 99).unwrap();

        assert_eq!(list.count(), 200);
        assert_eq!(segments(&list), vec![(0, 99), (200, 299)]);
    }

    #[test]
    fn add_range_consecutive_behind_merges() {
        let mut list = IdAllocator::new();
        list.add_range(0, 99).unwrap();
        list.add_range(100, 199).unwrap();

        assert_eq!(list.count(), 200);
        assert_eq!(segments(&list), vec![(0, 199)]);
    }

    #[test]
    fn add_range_consecutive_in_front_merges() {
        let mut list = IdAllocator::new();
        list.add_range(100, 199).unwrap();
        list.add_range(0, 99).unwrap();

        assert_eq!(list.count(), 200);
        assert_eq!(segments(&list), vec![(0, 199)]);
    }

    #[test]
    fn add_range_in_between_bridges_both_sides() {
        let mut list = IdAllocator::new();
        list.add_range(0, 99).unwrap();
        list.add_range(200, 299).unwrap();
        list.add_range(100, 199).unwrap();

        assert_eq!(list.count(), 300);
        assert_eq!(segments(&list), vec![(0, 299)]);
    }

    #[test]
    fn add_range_overlap_at_start_is_rejected() {
        let mut list = IdAllocator::new();
        list.add_range(0, 99).unwrap();
        list.add_range(200, 299).unwrap();

        assert!(list.add_range(199, 200).is_err());
        assert_eq!(list.count(), 200);
        assert_eq!(segments(&list), vec![(0, 99), (200, 299)]);
    }

    #[test]
    fn add_range_overlap_at_end_is_rejected() {
        let mut list = IdAllocator::new();
        list.add_range(0, 99).unwrap();
        list.add_range(200, 299).unwrap();

        assert!(list.add_range(90, 100).is_err());
        assert_eq!(list.count(), 200);
        assert_eq!(segments(&list), vec![(0, 99), (200, 299)]);
    }

    #[test]
    fn add_range_contained_is_rejected() {
        let mut list = IdAllocator::new();
        list.add_range(400, 499).unwrap();
        list.add_range(200, 299).unwrap();
        list.add_range(0, 99).unwrap();

        assert!(list.add_range(210, 220).is_err());
        assert_eq!(list.count(), 300);
        assert_eq!(segments(&list), vec![(0, 99), (200, 299), (400, 499)]);
    }

    #[test]
    fn add_range_spanning_a_segment_is_rejected() {
        let mut list = IdAllocator::new();
        list.add_range(400, 499).unwrap();
        list.add_range(200, 299).unwrap();
        list.add_range(0, 99).unwrap();

        assert!(list.add_range(199, 300).is_err());
        assert_eq!(list.count(), 300);
        assert_eq!(segments(&list), vec![(0, 99), (200, 299), (400, 499)]);
    }
}

//! Loss lists: disjoint sets of sequence ranges, used by the sender for
//! pending retransmissions and by the receiver for missing packets.
//!
//! Ranges are stored with numerically ordered endpoints; a range that
//! crosses the 31-bit wrap is split into two stored ranges. Modular order is
//! recovered on extraction, relying on the invariant that live sequences
//! span well under a quarter of the sequence space (bounded by the flow
//! window).

use crate::seq::{self, SEQ_MAX};
use std::collections::BTreeMap;

/// Numeric midpoint used to find the modular-first range when the stored
/// keys straddle the wrap point.
const WRAP_PIVOT: u32 = 0x4000_0000;

#[derive(Debug, Default)]
pub struct LossList {
    /// start -> inclusive end, with start <= end numerically.
    ranges: BTreeMap<u32, u32>,
    /// Total sequences across all ranges.
    count: usize,
}

impl LossList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of sequences currently listed.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Inserts the inclusive range `[start, end]` (modular), merging with
    /// anything it touches.
    pub fn insert(&mut self, start: u32, end: u32) {
        if seq::cmp(start, end) > 0 {
            return;
        }
        if start <= end {
            self.insert_linear(start, end);
        } else {
            // Crosses the wrap point.
            self.insert_linear(start, SEQ_MAX);
            self.insert_linear(0, end);
        }
    }

    fn insert_linear(&mut self, mut start: u32, mut end: u32) {
        // Absorb the predecessor if it overlaps or abuts.
        if let Some((&ps, &pe)) = self.ranges.range(..=start).next_back() {
            if pe >= end {
                return;
            }
            if pe + 1 >= start {
                start = ps;
                end = end.max(pe);
                self.count -= (pe - ps + 1) as usize;
                self.ranges.remove(&ps);
            }
        }
        // Absorb successors swallowed by the new range.
        loop {
            let Some((&ns, &ne)) = self.ranges.range(start..).next() else {
                break;
            };
            if ns > end.saturating_add(1) {
                break;
            }
            end = end.max(ne);
            self.count -= (ne - ns + 1) as usize;
            self.ranges.remove(&ns);
        }
        self.count += (end - start + 1) as usize;
        self.ranges.insert(start, end);
    }

    /// Removes one sequence, splitting its range if it sat in the middle.
    pub fn remove(&mut self, seq_no: u32) -> bool {
        let Some((&start, &end)) = self.ranges.range(..=seq_no).next_back() else {
            return false;
        };
        if seq_no > end {
            return false;
        }
        self.ranges.remove(&start);
        if seq_no > start {
            self.ranges.insert(start, seq_no - 1);
        }
        if seq_no < end {
            self.ranges.insert(seq_no + 1, end);
        }
        self.count -= 1;
        true
    }

    /// Extracts the modularly smallest listed sequence, shrinking its range.
    pub fn pop_first(&mut self) -> Option<u32> {
        let first = self.first()?;
        self.remove(first);
        Some(first)
    }

    /// The modularly smallest listed sequence.
    pub fn first(&self) -> Option<u32> {
        let (&lo_start, _) = self.ranges.first_key_value()?;
        let (&hi_start, _) = self.ranges.last_key_value()?;
        if hi_start - lo_start < WRAP_PIVOT {
            return Some(lo_start);
        }
        // Straddling the wrap: the modular-first range lives in the upper
        // half of the numeric space.
        self.ranges
            .range(WRAP_PIVOT..)
            .next()
            .map(|(&s, _)| s)
            .or(Some(lo_start))
    }

    /// Removes every sequence in the inclusive modular range `[from, to]`.
    pub fn remove_range(&mut self, from: u32, to: u32) {
        if seq::cmp(from, to) > 0 {
            return;
        }
        if from <= to {
            self.remove_range_linear(from, to);
        } else {
            self.remove_range_linear(from, SEQ_MAX);
            self.remove_range_linear(0, to);
        }
    }

    fn remove_range_linear(&mut self, from: u32, to: u32) {
        let starts: Vec<u32> = self
            .ranges
            .range(..=to)
            .map(|(&s, _)| s)
            .collect();
        for start in starts {
            let end = self.ranges[&start];
            if end < from {
                continue;
            }
            self.ranges.remove(&start);
            self.count -= (end.min(to) - start.max(from) + 1) as usize;
            if start < from {
                self.ranges.insert(start, from - 1);
            }
            if end > to {
                self.ranges.insert(to + 1, end);
            }
        }
    }

    /// Drops every sequence modularly below `ack`, trimming ranges that
    /// straddle it. Used by the sender when acknowledgments advance.
    pub fn remove_below(&mut self, ack: u32) {
        let starts: Vec<u32> = self.ranges.keys().copied().collect();
        for start in starts {
            let end = self.ranges[&start];
            if seq::cmp(end, ack) < 0 {
                self.ranges.remove(&start);
                self.count -= (end - start + 1) as usize;
            } else if seq::cmp(start, ack) < 0 {
                self.ranges.remove(&start);
                self.count -= (ack - start) as usize;
                self.ranges.insert(ack, end);
            }
        }
    }

    /// Snapshot of the listed ranges in modular order, oldest gap first,
    /// capped to `max_ranges` entries. Feeds NAK assembly.
    pub fn snapshot(&self, max_ranges: usize) -> Vec<(u32, u32)> {
        let mut out: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len().min(max_ranges));
        let straddles = match (self.ranges.first_key_value(), self.ranges.last_key_value()) {
            (Some((&lo, _)), Some((&hi, _))) => hi - lo >= WRAP_PIVOT,
            _ => false,
        };
        let push = |out: &mut Vec<(u32, u32)>, s: u32, e: u32| {
            // Re-join a range that was stored split at the wrap point.
            if let Some(last) = out.last_mut() {
                if last.1 == SEQ_MAX && s == 0 {
                    last.1 = e;
                    return;
                }
            }
            out.push((s, e));
        };
        if straddles {
            for (&s, &e) in self.ranges.range(WRAP_PIVOT..) {
                push(&mut out, s, e);
            }
            for (&s, &e) in self.ranges.range(..WRAP_PIVOT) {
                push(&mut out, s, e);
            }
        } else {
            for (&s, &e) in &self.ranges {
                push(&mut out, s, e);
            }
        }
        out.truncate(max_ranges);
        out
    }

    #[cfg(test)]
    fn assert_disjoint(&self) {
        let mut prev_end: Option<u32> = None;
        let mut total = 0usize;
        for (&s, &e) in &self.ranges {
            assert!(s <= e, "range endpoints out of order");
            if let Some(pe) = prev_end {
                assert!(s > pe + 1, "ranges overlap or abut unmerged");
            }
            prev_end = Some(e);
            total += (e - s + 1) as usize;
        }
        assert_eq!(total, self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_overlaps() {
        let mut list = LossList::new();
        list.insert(10, 20);
        list.insert(30, 40);
        list.insert(18, 32);
        list.assert_disjoint();
        assert_eq!(list.snapshot(8), vec![(10, 40)]);
        assert_eq!(list.len(), 31);
    }

    #[test]
    fn test_insert_merges_adjacent() {
        let mut list = LossList::new();
        list.insert(5, 5);
        list.insert(6, 6);
        list.assert_disjoint();
        assert_eq!(list.snapshot(8), vec![(5, 6)]);
    }

    #[test]
    fn test_remove_splits_range() {
        let mut list = LossList::new();
        list.insert(100, 110);
        assert!(list.remove(105));
        list.assert_disjoint();
        assert_eq!(list.snapshot(8), vec![(100, 104), (106, 110)]);
        assert_eq!(list.len(), 10);
        assert!(!list.remove(105));
    }

    #[test]
    fn test_pop_first_in_order() {
        let mut list = LossList::new();
        list.insert(102, 105);
        list.insert(99, 99);
        let mut popped = Vec::new();
        while let Some(s) = list.pop_first() {
            popped.push(s);
        }
        assert_eq!(popped, vec![99, 102, 103, 104, 105]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_pop_first_across_wrap() {
        let mut list = LossList::new();
        list.insert(SEQ_MAX - 1, 1);
        list.assert_disjoint();
        assert_eq!(list.pop_first(), Some(SEQ_MAX - 1));
        assert_eq!(list.pop_first(), Some(SEQ_MAX));
        assert_eq!(list.pop_first(), Some(0));
        assert_eq!(list.pop_first(), Some(1));
        assert_eq!(list.pop_first(), None);
    }

    #[test]
    fn test_snapshot_rejoins_wrap_split() {
        let mut list = LossList::new();
        list.insert(SEQ_MAX - 2, 3);
        assert_eq!(list.snapshot(8), vec![(SEQ_MAX - 2, 3)]);
    }

    #[test]
    fn test_remove_below_trims() {
        let mut list = LossList::new();
        list.insert(10, 20);
        list.insert(30, 35);
        list.remove_below(15);
        list.assert_disjoint();
        assert_eq!(list.snapshot(8), vec![(15, 20), (30, 35)]);
        list.remove_below(100);
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_inverted_insert_ignored() {
        let mut list = LossList::new();
        list.insert(50, 40);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_range_carves_hole() {
        let mut list = LossList::new();
        list.insert(10, 30);
        list.remove_range(15, 20);
        list.assert_disjoint();
        assert_eq!(list.snapshot(8), vec![(10, 14), (21, 30)]);
        assert_eq!(list.len(), 15);
    }

    #[test]
    fn test_snapshot_caps_ranges() {
        let mut list = LossList::new();
        for i in 0..10u32 {
            list.insert(i * 10, i * 10 + 2);
        }
        assert_eq!(list.snapshot(3).len(), 3);
        assert_eq!(list.snapshot(3)[0], (0, 2));
    }
}

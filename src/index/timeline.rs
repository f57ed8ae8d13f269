//! Timestamp-ordered index of the events in one segment

use crate::core::temporal::{TimeRange, Timestamp};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One event position in the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp: Timestamp,
    pub sequence: u64,
}

/// Event positions sorted by `(timestamp, sequence)`.
///
/// Appends arrive in sequence order, which need not be time order; the
/// index is sorted once when the segment is sealed and never changes after.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineIndex {
    entries: Vec<TimelineEntry>,
}

impl TimelineIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, timestamp: Timestamp, sequence: u64) {
        self.entries.push(TimelineEntry {
            timestamp,
            sequence,
        });
    }

    /// Sort into `(timestamp, sequence)` order
    pub fn sort(&mut self) {
        self.entries.sort_unstable();
    }

    pub fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0] < w[1])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<TimelineEntry> {
        self.entries.get(pos).copied()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// First position whose timestamp is `>= ts`
    pub fn lower_bound(&self, ts: Timestamp) -> usize {
        self.entries.partition_point(|e| e.timestamp < ts)
    }

    /// First position whose timestamp is `> ts`
    pub fn upper_bound(&self, ts: Timestamp) -> usize {
        self.entries.partition_point(|e| e.timestamp <= ts)
    }

    /// Positions covering the inclusive time range
    pub fn positions(&self, range: TimeRange) -> Range<usize> {
        if range.is_empty() {
            return 0..0;
        }
        self.lower_bound(range.start)..self.upper_bound(range.end)
    }

    /// Earliest and latest timestamp, if any events are indexed
    pub fn bounds(&self) -> Option<TimeRange> {
        match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => Some(TimeRange::new(first.timestamp, last.timestamp)),
            _ => None,
        }
    }
}

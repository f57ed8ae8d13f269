//! In-memory segment backend
//!
//! Same sequence, sealing and ordering rules as the file backend, without
//! touching disk. Useful for tests and for embedding the merge engine over
//! data that never needs to persist.

use crate::core::event::{DataIdentifier, Event, EventData, EventIdentifier, SegmentId};
use crate::error::{Error, Result};
use crate::index::timeline::TimelineIndex;
use crate::storage::{RecordSink, SealSummary, SegmentSource};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Stored {
    Data(EventData),
    Event(Event),
}

/// Segment held entirely in memory
#[derive(Debug, Clone)]
pub struct MemorySegment {
    segment_id: SegmentId,
    records: BTreeMap<u64, Stored>,
    timeline: TimelineIndex,
    next_sequence: u64,
    sealed: Option<SealSummary>,
}

impl MemorySegment {
    pub fn new() -> Self {
        Self::with_id(SegmentId::new())
    }

    pub fn with_id(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            records: BTreeMap::new(),
            timeline: TimelineIndex::new(),
            next_sequence: 0,
            sealed: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.sealed.is_some() {
            return Err(Error::InvalidRecord(format!(
                "segment {} is sealed",
                self.segment_id
            )));
        }
        Ok(())
    }

    fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }
}

impl Default for MemorySegment {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSink for MemorySegment {
    fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    fn append_event_data(&mut self, data: EventData) -> Result<DataIdentifier> {
        self.ensure_open()?;
        let seq = self.next_sequence();
        self.records.insert(seq, Stored::Data(data));
        Ok(DataIdentifier::new(self.segment_id, seq))
    }

    fn append_event(&mut self, event: Event) -> Result<EventIdentifier> {
        self.ensure_open()?;
        let references_data = event.data.segment == self.segment_id
            && matches!(self.records.get(&event.data.sequence), Some(Stored::Data(_)));
        if !references_data {
            return Err(Error::InvalidRecord(format!(
                "event references unknown event data {}",
                event.data
            )));
        }
        let seq = self.next_sequence();
        self.timeline.push(event.timestamp, seq);
        self.records.insert(seq, Stored::Event(event));
        Ok(EventIdentifier::new(self.segment_id, seq))
    }

    fn seal(&mut self) -> Result<SealSummary> {
        if let Some(summary) = &self.sealed {
            return Ok(summary.clone());
        }
        self.timeline.sort();
        let summary = SealSummary {
            segment_id: self.segment_id,
            path: None,
            record_count: self.records.len() as u64,
            event_count: self.timeline.len() as u64,
            time_bounds: self.timeline.bounds(),
        };
        self.sealed = Some(summary.clone());
        Ok(summary)
    }
}

impl SegmentSource for MemorySegment {
    fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    fn timeline(&self) -> &TimelineIndex {
        &self.timeline
    }

    fn read_event(&self, sequence: u64) -> Result<Event> {
        match self.records.get(&sequence) {
            Some(Stored::Event(event)) => Ok(event.clone()),
            _ => Err(Error::NotFound(format!(
                "event {} in segment {}",
                sequence, self.segment_id
            ))),
        }
    }

    fn get_event_data(&self, id: DataIdentifier) -> Result<EventData> {
        if id.segment != self.segment_id {
            return Err(Error::NotFound(format!("{} is not in segment {}", id, self.segment_id)));
        }
        match self.records.get(&id.sequence) {
            Some(Stored::Data(data)) => Ok(data.clone()),
            _ => Err(Error::NotFound(format!("event data {}", id))),
        }
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.segment_id)
    }
}

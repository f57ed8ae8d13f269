//! Segment storage: the single-writer append path and sealed read path
//!
//! Producers only ever see [`RecordSink`]; the merge engine only ever sees
//! [`SegmentSource`]. The disk-backed [`SegmentWriter`]/[`SegmentReader`]
//! pair and the in-memory [`MemorySegment`] both implement them.

pub mod memory;
pub mod reader;
pub mod segment_file;
pub mod writer;

pub use memory::MemorySegment;
pub use reader::{EventRange, SegmentReader};
pub use segment_file::{read_header, segment_state, SegmentHeader, SegmentState};
pub use writer::{RecoveryReport, SegmentWriter};

use crate::core::event::{DataIdentifier, Event, EventData, EventIdentifier, SegmentId};
use crate::core::temporal::TimeRange;
use crate::error::Result;
use crate::index::timeline::TimelineIndex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An event read back together with its identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEvent {
    pub id: EventIdentifier,
    pub event: Event,
}

/// Result of sealing a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealSummary {
    pub segment_id: SegmentId,
    /// `None` for backends without a file
    pub path: Option<PathBuf>,
    pub record_count: u64,
    pub event_count: u64,
    pub time_bounds: Option<TimeRange>,
}

/// Write side of a segment backend: the one interface every producer uses.
pub trait RecordSink {
    fn segment_id(&self) -> SegmentId;

    /// Append event data, assigning the next sequence number
    fn append_event_data(&mut self, data: EventData) -> Result<DataIdentifier>;

    /// Append an event referencing event data of this segment
    fn append_event(&mut self, event: Event) -> Result<EventIdentifier>;

    /// Make everything durable and immutable. Idempotent.
    fn seal(&mut self) -> Result<SealSummary>;
}

/// Read side of a sealed segment, as consumed by the merge engine.
pub trait SegmentSource: Send {
    fn segment_id(&self) -> SegmentId;

    /// Events in `(timestamp, sequence)` order
    fn timeline(&self) -> &TimelineIndex;

    /// Read the event with the given sequence number
    fn read_event(&self, sequence: u64) -> Result<Event>;

    /// Resolve event data of this segment
    fn get_event_data(&self, id: DataIdentifier) -> Result<EventData>;

    /// Backing file, if any
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Human-readable name for logs
    fn describe(&self) -> String {
        self.segment_id().to_string()
    }
}

//! Timeline-Store: segmented event storage for forensic timelines
//!
//! Worker processes each decode part of the evidence into their own
//! append-only segment. Once a processing session ends, the merge engine
//! combines every sealed segment into one chronological, deduplicated event
//! stream, attaching labels from a separately stored tag index.
//!
//! # Core Concepts
//!
//! - **EventData**: a typed attribute bag produced by a decoder
//! - **Events**: timestamped occurrences referencing event data in the same segment
//! - **Segments**: single-writer files, sealed with a sorted timeline index
//! - **Sessions**: the tasks of one processing run and the segments they produced
//! - **Tags**: labels attached to events after the fact, last write wins
//!
//! # Example
//!
//! ```no_run
//! use timeline_store::prelude::*;
//!
//! # fn example() -> timeline_store::error::Result<()> {
//! let mut writer = SegmentWriter::open_writable("worker-0.seg", &SegmentConfig::default())?;
//! let data = writer.append_event_data(EventData::new("fs:stat").with_attribute("size", 42i64))?;
//! writer.append_event(Event::new(Timestamp::now(), "Creation Time", data))?;
//! writer.seal()?;
//!
//! for merged in merge(&["worker-0.seg"], None, MergeFilter::new(), &MergeConfig::default())? {
//!     println!("{} {}", merged.event.timestamp, merged.data.data_type);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod ingest;
pub mod merge;
pub mod output;
pub mod session;
pub mod storage;

/// Store directory facade
pub mod store;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::{CoordinatorConfig, MergeConfig, SegmentConfig, StoreConfig};
    pub use crate::core::*;
    pub use crate::error::{Error, Result};
    pub use crate::index::{TagIndex, TagRequest};
    pub use crate::merge::{merge, merge_sources, MergeFilter, MergePlan, MergeStream, MergedEvent};
    pub use crate::output::{EventRenderer, JsonLinesRenderer};
    pub use crate::session::{
        CompletionReport, Coordinator, SessionRegistry, TaskExecutor, TaskOutcome, TaskSpec,
    };
    pub use crate::storage::{
        MemorySegment, RecordSink, SegmentReader, SegmentSource, SegmentWriter,
    };
    pub use crate::store::TimelineStore;
}

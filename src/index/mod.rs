//! Indexes: per-segment timeline ordering and the shared tag index

pub mod tags;
pub mod timeline;

pub use tags::{validate_label, StoredTag, TagIndex, TagRequest};
pub use timeline::{TimelineEntry, TimelineIndex};

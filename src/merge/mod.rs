//! Merge engine: one chronological, deduplicated, tagged stream out of many
//! sealed segments

pub mod engine;
pub mod filter;
pub mod plan;

pub use engine::{merge, merge_sources, ExcludedSegment, MergeReport, MergeStream, MergedEvent};
pub use filter::{MergeFilter, TextFilter};
pub use plan::MergePlan;

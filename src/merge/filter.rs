//! Per-event predicates applied at the end of a merge pass

use crate::core::event::{Event, EventData};
use crate::core::temporal::TimeRange;
use std::collections::BTreeSet;

/// Case-insensitive substring match on one named attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFilter {
    pub attribute: String,
    pub needle: String,
}

/// Fixed predicate set: time range, data type allow-list, attribute text.
/// All configured predicates must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeFilter {
    pub time_range: TimeRange,
    pub data_types: Option<BTreeSet<String>>,
    pub text: Option<TextFilter>,
}

impl MergeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = range;
        self
    }

    pub fn with_data_types<I, S>(mut self, data_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_types = Some(data_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_text(mut self, attribute: impl Into<String>, needle: impl Into<String>) -> Self {
        self.text = Some(TextFilter {
            attribute: attribute.into(),
            needle: needle.into(),
        });
        self
    }

    /// True when nothing is filtered out
    pub fn is_pass_all(&self) -> bool {
        self.time_range == TimeRange::all() && self.data_types.is_none() && self.text.is_none()
    }

    pub fn matches(&self, event: &Event, data: &EventData) -> bool {
        if !self.time_range.contains(event.timestamp) {
            return false;
        }
        if let Some(types) = &self.data_types {
            if !types.contains(&data.data_type) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            match data.attribute(&text.attribute) {
                Some(value) if value.contains_text(&text.needle) => {}
                _ => return false,
            }
        }
        true
    }
}

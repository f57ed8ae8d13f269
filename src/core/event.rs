//! Event records: event data, events, tags and their identifiers

use crate::core::temporal::Timestamp;
use crate::core::value::{AttributeValue, Attributes};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a segment. Survives sealing, reopening and process
/// restarts because it is stored in the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub Uuid);

impl SegmentId {
    /// Generate a new segment ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SegmentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SegmentId)
    }
}

/// Locator of an event: owning segment plus intra-segment sequence number.
///
/// Ordering is (segment, sequence), which is also the merge tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventIdentifier {
    pub segment: SegmentId,
    pub sequence: u64,
}

impl EventIdentifier {
    pub fn new(segment: SegmentId, sequence: u64) -> Self {
        Self { segment, sequence }
    }
}

impl fmt::Display for EventIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.sequence)
    }
}

impl std::str::FromStr for EventIdentifier {
    type Err = String;

    /// Parses the `segment:sequence` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (segment, sequence) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected <segment>:<sequence>, got {s:?}"))?;
        let segment = segment.parse().map_err(|e| format!("bad segment id: {e}"))?;
        let sequence = sequence.parse().map_err(|e| format!("bad sequence: {e}"))?;
        Ok(Self { segment, sequence })
    }
}

/// Locator of an event data record within its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataIdentifier {
    pub segment: SegmentId,
    pub sequence: u64,
}

impl DataIdentifier {
    pub fn new(segment: SegmentId, sequence: u64) -> Self {
        Self { segment, sequence }
    }
}

impl fmt::Display for DataIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.sequence)
    }
}

/// Decoded, type-tagged attribute bag produced by a parser.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventData {
    /// Namespaced type, e.g. `windows:registry:run`
    pub data_type: String,
    pub attributes: Attributes,
    /// Provenance: path or path spec of the originating data stream
    pub source: Option<String>,
}

impl EventData {
    pub fn new(data_type: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
            attributes: Attributes::new(),
            source: None,
        }
    }

    /// Set an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set provenance
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

/// A single timestamped occurrence referencing shared event data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub timestamp: Timestamp,
    /// Semantic label of the timestamp, e.g. `Creation Time`
    pub timestamp_desc: String,
    /// Event data in the same segment
    pub data: DataIdentifier,
}

impl Event {
    pub fn new(timestamp: Timestamp, timestamp_desc: impl Into<String>, data: DataIdentifier) -> Self {
        Self {
            timestamp,
            timestamp_desc: timestamp_desc.into(),
            data,
        }
    }
}

/// Label/comment annotation of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventTag {
    pub event: EventIdentifier,
    /// Ordered, duplicate-free
    pub labels: Vec<String>,
    pub comment: Option<String>,
}

impl EventTag {
    pub fn new(event: EventIdentifier) -> Self {
        Self {
            event,
            labels: Vec::new(),
            comment: None,
        }
    }

    /// Add labels, skipping any already present
    pub fn add_labels<I, S>(&mut self, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for label in labels {
            let label = label.into();
            if !self.labels.contains(&label) {
                self.labels.push(label);
            }
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

//! Output renderers for merged timelines
//!
//! A renderer consumes a merge stream strictly forward, one event at a time.

use crate::core::value::Attributes;
use crate::error::Result;
use crate::merge::MergedEvent;
use serde::Serialize;
use std::io::Write;

/// Sink for a merged timeline
pub trait EventRenderer {
    fn render(&mut self, event: &MergedEvent) -> Result<()>;

    /// Flush anything buffered. Called once after the last event.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Render every event of `events`, then finish. Returns the event count.
pub fn render_all<R, I>(renderer: &mut R, events: I) -> Result<u64>
where
    R: EventRenderer + ?Sized,
    I: IntoIterator<Item = MergedEvent>,
{
    let mut count = 0;
    for event in events {
        renderer.render(&event)?;
        count += 1;
    }
    renderer.finish()?;
    Ok(count)
}

#[derive(Serialize)]
struct JsonLine<'a> {
    datetime: String,
    timestamp: i64,
    timestamp_desc: &'a str,
    data_type: &'a str,
    identifier: String,
    attributes: &'a Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
}

/// One JSON object per line
pub struct JsonLinesRenderer<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EventRenderer for JsonLinesRenderer<W> {
    fn render(&mut self, merged: &MergedEvent) -> Result<()> {
        let tag = merged.tag.as_ref();
        let line = JsonLine {
            datetime: merged.event.timestamp.to_string(),
            timestamp: merged.event.timestamp.as_micros(),
            timestamp_desc: &merged.event.timestamp_desc,
            data_type: &merged.data.data_type,
            identifier: merged.identifier.to_string(),
            attributes: &merged.data.attributes,
            source: merged.data.source.as_deref(),
            labels: tag.map(|t| t.labels.as_slice()).filter(|l| !l.is_empty()),
            comment: tag.and_then(|t| t.comment.as_deref()),
        };
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{DataIdentifier, Event, EventData, EventIdentifier, EventTag, SegmentId};
    use crate::core::temporal::Timestamp;
    use std::sync::Arc;

    fn merged(tagged: bool) -> MergedEvent {
        let segment = SegmentId::new();
        let identifier = EventIdentifier::new(segment, 1);
        let tag = tagged.then(|| {
            let mut tag = EventTag::new(identifier);
            tag.add_labels(["suspicious"]);
            tag
        });
        MergedEvent {
            identifier,
            event: Event::new(Timestamp::from_secs(0), "Creation Time", DataIdentifier::new(segment, 0)),
            data: Arc::new(
                EventData::new("fs:stat")
                    .with_attribute("size", 42i64)
                    .with_source("/evidence/disk.img"),
            ),
            tag,
        }
    }

    #[test]
    fn test_json_lines_output() {
        let mut renderer = JsonLinesRenderer::new(Vec::new());
        let count = render_all(&mut renderer, vec![merged(false), merged(true)]).unwrap();
        assert_eq!(count, 2);

        let text = String::from_utf8(renderer.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["datetime"], "1970-01-01T00:00:00.000000Z");
        assert_eq!(lines[0]["attributes"]["size"], 42);
        assert_eq!(lines[0]["source"], "/evidence/disk.img");
        assert!(lines[0].get("labels").is_none());
        assert_eq!(lines[1]["labels"][0], "suspicious");
    }
}

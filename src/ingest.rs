//! Built-in JSON-lines decoder
//!
//! Each input line describes one event data record and the events that
//! reference it:
//!
//! ```json
//! {"timestamp": "2024-03-01T10:00:00Z", "timestamp_desc": "Creation Time",
//!  "data_type": "fs:stat", "attributes": {"filename": "/etc/passwd"}}
//! {"timestamps": [{"timestamp": 1709287200000000, "timestamp_desc": "Modification Time"},
//!                 {"timestamp": 1709287300000000, "timestamp_desc": "Access Time"}],
//!  "data_type": "fs:stat", "attributes": {"filename": "/etc/shadow"}, "source": "disk.img"}
//! ```
//!
//! Integer timestamps are microseconds since the Unix epoch; strings are RFC 3339.

use crate::config::SegmentConfig;
use crate::core::event::{Event, EventData};
use crate::core::temporal::Timestamp;
use crate::core::value::AttributeValue;
use crate::error::{Error, Result};
use crate::session::{CompletionReport, TaskSpec};
use crate::storage::{RecordSink, SegmentWriter};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Micros(i64),
    Text(String),
}

impl RawTimestamp {
    fn parse(&self) -> Result<Timestamp> {
        match self {
            RawTimestamp::Micros(us) => Ok(Timestamp::from_micros(*us)),
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| Timestamp::from_micros(dt.timestamp_micros()))
                .map_err(|e| Error::InvalidRecord(format!("bad timestamp {:?}: {}", text, e))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawTimestampEntry {
    timestamp: RawTimestamp,
    #[serde(default = "default_timestamp_desc")]
    timestamp_desc: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRecord {
    data_type: String,
    #[serde(default)]
    timestamp: Option<RawTimestamp>,
    #[serde(default = "default_timestamp_desc")]
    timestamp_desc: String,
    #[serde(default)]
    timestamps: Vec<RawTimestampEntry>,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    source: Option<String>,
}

fn default_timestamp_desc() -> String {
    "Event Time".to_string()
}

/// Counters of one ingest run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub lines: u64,
    pub event_data: u64,
    pub events: u64,
    /// Lines that could not be decoded
    pub skipped: u64,
}

/// Decode one line into event data plus event timestamps
fn decode_line(line: &str) -> Result<(EventData, Vec<(Timestamp, String)>)> {
    let raw: RawRecord = serde_json::from_str(line)?;
    if raw.data_type.is_empty() {
        return Err(Error::InvalidRecord("empty data_type".into()));
    }

    let mut times = Vec::with_capacity(raw.timestamps.len() + 1);
    if let Some(ts) = &raw.timestamp {
        times.push((ts.parse()?, raw.timestamp_desc.clone()));
    }
    for entry in &raw.timestamps {
        times.push((entry.timestamp.parse()?, entry.timestamp_desc.clone()));
    }
    if times.is_empty() {
        return Err(Error::InvalidRecord("record has no timestamp".into()));
    }

    let mut data = EventData::new(raw.data_type);
    for (name, value) in raw.attributes {
        data.attributes.insert(name, AttributeValue::from(value));
    }
    data.source = raw.source;
    Ok((data, times))
}

/// Append every decodable line of `reader` to `sink`.
///
/// Lines that fail to decode are logged and counted; write errors abort.
pub fn ingest_reader<R, S>(reader: R, sink: &mut S) -> Result<IngestStats>
where
    R: BufRead,
    S: RecordSink + ?Sized,
{
    let mut stats = IngestStats::default();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        let (data, times) = match decode_line(&line) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(line = number + 1, error = %e, "Skipping undecodable input line");
                stats.skipped += 1;
                continue;
            }
        };

        let data_id = sink.append_event_data(data)?;
        stats.event_data += 1;
        for (timestamp, desc) in times {
            sink.append_event(Event::new(timestamp, desc, data_id))?;
            stats.events += 1;
        }
    }
    Ok(stats)
}

pub fn ingest_file<P, S>(path: P, sink: &mut S) -> Result<IngestStats>
where
    P: AsRef<Path>,
    S: RecordSink + ?Sized,
{
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::NotFound(format!("input {}: {}", path.display(), e)))?;
    ingest_reader(BufReader::new(file), sink)
}

/// Worker body: decode the task's input into its segment and seal it
#[instrument(skip_all, fields(task = %task.task_id))]
pub fn run_ingest_task(task: &TaskSpec, config: &SegmentConfig) -> Result<CompletionReport> {
    let mut writer = SegmentWriter::open_writable(&task.segment_path, config)?;
    let stats = ingest_file(&task.input, &mut writer)?;
    let summary = writer.finish()?;
    info!(
        input = %task.input,
        events = stats.events,
        skipped = stats.skipped,
        records = summary.record_count,
        "Ingested task input"
    );
    Ok(CompletionReport::completed(task, summary.record_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemorySegment, SegmentSource};
    use crate::session::TaskId;
    use crate::storage::SegmentReader;
    use std::io::Cursor;
    use tempfile::TempDir;

    const INPUT: &str = r#"
{"timestamp": "1970-01-01T00:00:02Z", "timestamp_desc": "Creation Time", "data_type": "fs:stat", "attributes": {"filename": "/etc/passwd", "size": 1024}}
not json at all
{"timestamps": [{"timestamp": 1000000, "timestamp_desc": "Modification Time"}, {"timestamp": 3000000}], "data_type": "fs:stat", "source": "disk.img"}
{"data_type": "no:time"}
"#;

    #[test]
    fn test_ingest_shares_event_data() {
        let mut segment = MemorySegment::new();
        let stats = ingest_reader(Cursor::new(INPUT), &mut segment).unwrap();
        assert_eq!(
            stats,
            IngestStats {
                lines: 4,
                event_data: 2,
                events: 3,
                skipped: 2,
            }
        );

        segment.seal().unwrap();
        let timeline = segment.timeline().entries().to_vec();
        let first = segment.read_event(timeline[0].sequence).unwrap();
        let last = segment.read_event(timeline[2].sequence).unwrap();
        assert_eq!(first.timestamp, Timestamp::from_secs(1));
        assert_eq!(first.timestamp_desc, "Modification Time");
        assert_eq!(last.timestamp_desc, "Event Time");
        assert_eq!(first.data, last.data);

        let data = segment.get_event_data(first.data).unwrap();
        assert_eq!(data.source.as_deref(), Some("disk.img"));
    }

    #[test]
    fn test_run_ingest_task_seals_segment() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.jsonl");
        std::fs::write(&input, INPUT).unwrap();
        let task = TaskSpec {
            task_id: TaskId(0),
            input: input.display().to_string(),
            segment_path: dir.path().join("task-0.seg"),
        };

        let report = run_ingest_task(&task, &SegmentConfig::default()).unwrap();
        assert_eq!(report.record_count, 5);

        let reader = SegmentReader::open_readonly(&task.segment_path).unwrap();
        assert_eq!(reader.event_count(), 3);
        let data = reader
            .read_all()
            .map(|e| e.unwrap())
            .find(|e| e.event.timestamp == Timestamp::from_secs(2))
            .map(|e| reader.get_event_data(e.event.data).unwrap())
            .unwrap();
        assert_eq!(data.attribute("size"), Some(&AttributeValue::Integer(1024)));
    }

    #[test]
    fn test_missing_input_fails_task() {
        let dir = TempDir::new().unwrap();
        let task = TaskSpec {
            task_id: TaskId(1),
            input: dir.path().join("absent.jsonl").display().to_string(),
            segment_path: dir.path().join("task-1.seg"),
        };
        assert!(matches!(
            run_ingest_task(&task, &SegmentConfig::default()),
            Err(Error::NotFound(_))
        ));
    }
}

//! K-way chronological merge over sealed segments
//!
//! Each segment's sealed timeline is already sorted by `(timestamp,
//! sequence)`. A min-heap holds the head of every cursor keyed by
//! `(timestamp, segment, sequence)`, which is a total order, so the same
//! inputs always produce the same output regardless of the order they are
//! passed in.
//!
//! Per emitted event, in order: resolve event data, drop duplicates, attach
//! the latest tag, apply filters.

use crate::codec;
use crate::config::MergeConfig;
use crate::core::event::{DataIdentifier, Event, EventData, EventIdentifier, EventTag, SegmentId};
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::index::tags::TagIndex;
use crate::merge::filter::MergeFilter;
use crate::storage::{SegmentReader, SegmentSource};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// One fully resolved event of the merged timeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedEvent {
    pub identifier: EventIdentifier,
    pub event: Event,
    pub data: Arc<EventData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<EventTag>,
}

/// A segment left out of a merge, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedSegment {
    pub segment: String,
    pub reason: String,
}

/// Accounting of one merge pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub segments: usize,
    pub excluded: Vec<ExcludedSegment>,
    pub events_emitted: u64,
    pub duplicates_dropped: u64,
    pub records_skipped: u64,
    pub filtered: u64,
}

type DedupKey = (String, String, [u8; 32]);

/// FIFO-bounded cache of resolved event data, keyed by data sequence
struct DataCache {
    capacity: usize,
    entries: HashMap<u64, (Arc<EventData>, [u8; 32])>,
    order: VecDeque<u64>,
}

impl DataCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, sequence: u64) -> Option<(Arc<EventData>, [u8; 32])> {
        self.entries.get(&sequence).cloned()
    }

    fn insert(&mut self, sequence: u64, data: Arc<EventData>, hash: [u8; 32]) {
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(sequence);
        self.entries.insert(sequence, (data, hash));
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

struct Cursor {
    source: Box<dyn SegmentSource>,
    segment: SegmentId,
    positions: Range<usize>,
    next: usize,
    cache: DataCache,
}

impl Cursor {
    fn head(&self) -> Option<(Timestamp, u64)> {
        if self.next >= self.positions.end {
            return None;
        }
        self.source
            .timeline()
            .get(self.next)
            .map(|entry| (entry.timestamp, entry.sequence))
    }

    fn resolve(&mut self, id: DataIdentifier) -> Result<(Arc<EventData>, [u8; 32])> {
        if let Some(hit) = self.cache.get(id.sequence) {
            return Ok(hit);
        }
        let data = self.source.get_event_data(id)?;
        let hash = codec::content_hash(&data);
        let data = Arc::new(data);
        self.cache.insert(id.sequence, data.clone(), hash);
        Ok((data, hash))
    }
}

type HeapKey = Reverse<(Timestamp, SegmentId, u64, usize)>;

/// Lazy, restartable merged timeline.
///
/// Iteration yields events in ascending `(timestamp, segment, sequence)`
/// order. Problems with single records are logged, counted in
/// [`MergeStream::report`] and skipped.
pub struct MergeStream<'t> {
    cursors: Vec<Cursor>,
    heap: BinaryHeap<HeapKey>,
    tags: Option<&'t TagIndex>,
    filter: MergeFilter,
    deduplicate: bool,
    seen: HashSet<DedupKey>,
    seen_at: Option<Timestamp>,
    report: MergeReport,
    finished: bool,
}

impl<'t> MergeStream<'t> {
    fn new(
        cursors: Vec<Cursor>,
        tags: Option<&'t TagIndex>,
        filter: MergeFilter,
        config: &MergeConfig,
        excluded: Vec<ExcludedSegment>,
    ) -> Self {
        let mut stream = Self {
            report: MergeReport {
                segments: cursors.len(),
                excluded,
                ..Default::default()
            },
            cursors,
            heap: BinaryHeap::new(),
            tags,
            filter,
            deduplicate: config.deduplicate,
            seen: HashSet::new(),
            seen_at: None,
            finished: false,
        };
        stream.fill_heap();
        stream
    }

    fn fill_heap(&mut self) {
        self.heap.clear();
        for (idx, cursor) in self.cursors.iter().enumerate() {
            if let Some((ts, seq)) = cursor.head() {
                self.heap.push(Reverse((ts, cursor.segment, seq, idx)));
            }
        }
    }

    /// Restart from the first event. Counters restart too; exclusions stay.
    pub fn rewind(&mut self) {
        for cursor in &mut self.cursors {
            cursor.next = cursor.positions.start;
            cursor.cache.clear();
        }
        self.seen.clear();
        self.seen_at = None;
        self.finished = false;
        self.report = MergeReport {
            segments: self.report.segments,
            excluded: std::mem::take(&mut self.report.excluded),
            ..Default::default()
        };
        self.fill_heap();
    }

    pub fn report(&self) -> &MergeReport {
        &self.report
    }

    /// Whether iteration has run to the end since the last rewind
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Segments taking part in the merge
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.cursors.iter().map(|c| c.segment).collect()
    }

    /// Files of the file-backed segments taking part in the merge
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        self.cursors
            .iter()
            .filter_map(|c| c.source.path().map(Path::to_path_buf))
            .collect()
    }

    fn is_duplicate(&mut self, event: &Event, data: &EventData, hash: [u8; 32]) -> bool {
        if self.seen_at != Some(event.timestamp) {
            self.seen.clear();
            self.seen_at = Some(event.timestamp);
        }
        let key = (event.timestamp_desc.clone(), data.data_type.clone(), hash);
        !self.seen.insert(key)
    }
}

impl<'t> Iterator for MergeStream<'t> {
    type Item = MergedEvent;

    fn next(&mut self) -> Option<MergedEvent> {
        loop {
            let Some(Reverse((_, segment, sequence, idx))) = self.heap.pop() else {
                self.finished = true;
                return None;
            };

            let cursor = &mut self.cursors[idx];
            cursor.next += 1;
            if let Some((ts, seq)) = cursor.head() {
                self.heap.push(Reverse((ts, cursor.segment, seq, idx)));
            }

            let event = match cursor.source.read_event(sequence) {
                Ok(event) => event,
                Err(e) => {
                    warn!(segment = %segment, sequence, error = %e, "Skipping unreadable event");
                    self.report.records_skipped += 1;
                    continue;
                }
            };
            let (data, hash) = match cursor.resolve(event.data) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(segment = %segment, sequence, data = %event.data, error = %e, "Skipping event with unresolvable data");
                    self.report.records_skipped += 1;
                    continue;
                }
            };

            if self.deduplicate && self.is_duplicate(&event, &data, hash) {
                self.report.duplicates_dropped += 1;
                continue;
            }

            let identifier = EventIdentifier::new(segment, sequence);
            let tag = self.tags.and_then(|tags| tags.lookup(identifier)).cloned();

            if !self.filter.matches(&event, &data) {
                self.report.filtered += 1;
                continue;
            }

            self.report.events_emitted += 1;
            return Some(MergedEvent {
                identifier,
                event,
                data,
                tag,
            });
        }
    }
}

/// Merge sealed segment files.
///
/// Segments that are unsealed or corrupt are excluded with a warning and
/// listed in the report; if none remain the merge fails with
/// `NoValidSegments`.
#[instrument(skip_all, fields(segments = paths.len()))]
pub fn merge<'t, P: AsRef<Path>>(
    paths: &[P],
    tags: Option<&'t TagIndex>,
    filter: MergeFilter,
    config: &MergeConfig,
) -> Result<MergeStream<'t>> {
    merge_paths(paths, tags, filter, config, Vec::new())
}

/// Open every path read-only, excluding unreadable segments, and merge
pub(crate) fn merge_paths<'t, P: AsRef<Path>>(
    paths: &[P],
    tags: Option<&'t TagIndex>,
    filter: MergeFilter,
    config: &MergeConfig,
    mut excluded: Vec<ExcludedSegment>,
) -> Result<MergeStream<'t>> {
    let mut sources: Vec<Box<dyn SegmentSource>> = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        match SegmentReader::open_readonly(path) {
            Ok(reader) => sources.push(Box::new(reader)),
            Err(e) if e.is_segment_level() => {
                warn!(path = %path.display(), error = %e, "Excluding segment from merge");
                excluded.push(ExcludedSegment {
                    segment: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    merge_with_exclusions(sources, tags, filter, config, excluded)
}

/// Merge any segment backends
pub fn merge_sources<'t>(
    sources: Vec<Box<dyn SegmentSource>>,
    tags: Option<&'t TagIndex>,
    filter: MergeFilter,
    config: &MergeConfig,
) -> Result<MergeStream<'t>> {
    merge_with_exclusions(sources, tags, filter, config, Vec::new())
}

fn merge_with_exclusions<'t>(
    sources: Vec<Box<dyn SegmentSource>>,
    tags: Option<&'t TagIndex>,
    filter: MergeFilter,
    config: &MergeConfig,
    mut excluded: Vec<ExcludedSegment>,
) -> Result<MergeStream<'t>> {
    let mut seen_segments = HashSet::new();
    let mut cursors = Vec::with_capacity(sources.len());
    for source in sources {
        let segment = source.segment_id();
        let name = source.describe();
        if !source.timeline().is_sorted() {
            warn!(segment = %name, "Excluding segment with unsorted timeline");
            excluded.push(ExcludedSegment {
                segment: name,
                reason: "timeline not sorted; segment not sealed".into(),
            });
            continue;
        }
        if !seen_segments.insert(segment) {
            warn!(segment = %name, "Excluding repeated segment");
            excluded.push(ExcludedSegment {
                segment: name,
                reason: format!("segment {} already part of this merge", segment),
            });
            continue;
        }

        let positions = source.timeline().positions(filter.time_range);
        debug!(segment = %name, events = positions.len(), "Opened merge cursor");
        cursors.push(Cursor {
            segment,
            next: positions.start,
            positions,
            cache: DataCache::new(config.data_cache_entries),
            source,
        });
    }

    if cursors.is_empty() {
        return Err(Error::NoValidSegments {
            excluded: excluded.len(),
        });
    }

    info!(segments = cursors.len(), excluded = excluded.len(), "Merging segments");
    Ok(MergeStream::new(cursors, tags, filter, config, excluded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::core::temporal::TimeRange;
    use crate::index::tags::TagIndex;
    use crate::storage::{MemorySegment, RecordSink, SegmentWriter};
    use tempfile::TempDir;

    fn memory_segment(events: &[(i64, &str, &str)]) -> MemorySegment {
        let mut segment = MemorySegment::new();
        for (secs, data_type, name) in events {
            let data = segment
                .append_event_data(EventData::new(*data_type).with_attribute("name", *name))
                .unwrap();
            segment
                .append_event(Event::new(Timestamp::from_secs(*secs), "Written", data))
                .unwrap();
        }
        segment.seal().unwrap();
        segment
    }

    fn boxed(segments: Vec<MemorySegment>) -> Vec<Box<dyn SegmentSource>> {
        segments
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn SegmentSource>)
            .collect()
    }

    #[test]
    fn test_interleaves_by_timestamp() {
        let a = memory_segment(&[(1, "t", "a1"), (4, "t", "a4"), (6, "t", "a6")]);
        let b = memory_segment(&[(2, "t", "b2"), (3, "t", "b3"), (7, "t", "b7")]);

        let stream = merge_sources(boxed(vec![a, b]), None, MergeFilter::new(), &MergeConfig::default()).unwrap();
        let secs: Vec<i64> = stream.map(|e| e.event.timestamp.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 3, 4, 6, 7]);
    }

    #[test]
    fn test_ties_break_on_segment_then_sequence() {
        let a = memory_segment(&[(5, "t", "x"), (5, "t", "y")]);
        let b = memory_segment(&[(5, "t", "z")]);
        let (id_a, id_b) = (SegmentSource::segment_id(&a), SegmentSource::segment_id(&b));

        let forward: Vec<EventIdentifier> = merge_sources(
            boxed(vec![a.clone(), b.clone()]),
            None,
            MergeFilter::new(),
            &MergeConfig::default(),
        )
        .unwrap()
        .map(|e| e.identifier)
        .collect();
        let reversed: Vec<EventIdentifier> =
            merge_sources(boxed(vec![b, a]), None, MergeFilter::new(), &MergeConfig::default())
                .unwrap()
                .map(|e| e.identifier)
                .collect();

        assert_eq!(forward, reversed);
        let mut expected = forward.clone();
        expected.sort();
        assert_eq!(forward, expected);
        assert!(forward.iter().any(|id| id.segment == id_a));
        assert!(forward.iter().any(|id| id.segment == id_b));
    }

    #[test]
    fn test_duplicates_across_segments_dropped() {
        let a = memory_segment(&[(10, "fs:stat", "same"), (11, "fs:stat", "only-a")]);
        let b = memory_segment(&[(10, "fs:stat", "same"), (10, "fs:stat", "different")]);

        let mut stream =
            merge_sources(boxed(vec![a, b]), None, MergeFilter::new(), &MergeConfig::default()).unwrap();
        let names: Vec<String> = stream
            .by_ref()
            .map(|e| e.data.attribute("name").and_then(|v| v.as_str()).unwrap_or("").to_string())
            .collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names.iter().filter(|n| n.as_str() == "same").count(), 1);
        assert_eq!(stream.report().duplicates_dropped, 1);

        let config = MergeConfig {
            deduplicate: false,
            ..Default::default()
        };
        let a = memory_segment(&[(10, "fs:stat", "same")]);
        let b = memory_segment(&[(10, "fs:stat", "same")]);
        assert_eq!(merge_sources(boxed(vec![a, b]), None, MergeFilter::new(), &config).unwrap().count(), 2);
    }

    #[test]
    fn test_rewind_replays_identically() {
        let a = memory_segment(&[(3, "t", "a"), (1, "t", "b")]);
        let b = memory_segment(&[(2, "t", "c")]);
        let mut stream =
            merge_sources(boxed(vec![a, b]), None, MergeFilter::new(), &MergeConfig::default()).unwrap();

        assert!(!stream.is_finished());
        let first: Vec<MergedEvent> = stream.by_ref().collect();
        assert_eq!(stream.report().events_emitted, 3);
        assert!(stream.is_finished());
        stream.rewind();
        assert!(!stream.is_finished());
        let second: Vec<MergedEvent> = stream.by_ref().collect();
        assert_eq!(first, second);
        assert_eq!(stream.report().events_emitted, 3);
    }

    #[test]
    fn test_filters_applied_after_dedup() {
        let a = memory_segment(&[(1, "fs:stat", "cmd.exe"), (2, "reg:key", "Run"), (3, "fs:stat", "notepad.exe")]);
        let filter = MergeFilter::new()
            .with_data_types(["fs:stat"])
            .with_text("name", "CMD");
        let mut stream = merge_sources(boxed(vec![a]), None, filter, &MergeConfig::default()).unwrap();
        let out: Vec<MergedEvent> = stream.by_ref().collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event.timestamp.as_secs(), 1);
        assert_eq!(stream.report().filtered, 2);

        let b = memory_segment(&[(1, "t", "x"), (5, "t", "y"), (9, "t", "z")]);
        let window = MergeFilter::new()
            .with_time_range(TimeRange::new(Timestamp::from_secs(2), Timestamp::from_secs(9)));
        let secs: Vec<i64> = merge_sources(boxed(vec![b]), None, window, &MergeConfig::default())
            .unwrap()
            .map(|e| e.event.timestamp.as_secs())
            .collect();
        assert_eq!(secs, vec![5, 9]);
    }

    #[test]
    fn test_unsealed_and_missing_segments_excluded() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig {
            flush_records: 2,
            sync_on_flush: false,
            ..Default::default()
        };

        let sealed_path = dir.path().join("sealed.seg");
        let mut writer = SegmentWriter::open_writable(&sealed_path, &config).unwrap();
        let data = writer.append_event_data(EventData::new("t")).unwrap();
        writer.append_event(Event::new(Timestamp::from_secs(1), "t", data)).unwrap();
        writer.seal().unwrap();

        let open_path = dir.path().join("open.seg");
        let mut crashed = SegmentWriter::open_writable(&open_path, &config).unwrap();
        let data = crashed.append_event_data(EventData::new("t")).unwrap();
        crashed.append_event(Event::new(Timestamp::from_secs(2), "t", data)).unwrap();
        crashed.abandon();

        let paths = vec![open_path.clone(), sealed_path];
        let mut stream = merge(&paths, None, MergeFilter::new(), &MergeConfig::default()).unwrap();
        assert_eq!(stream.by_ref().count(), 1);
        assert_eq!(stream.report().excluded.len(), 1);
        assert_eq!(stream.report().excluded[0].segment, open_path.display().to_string());

        let only_bad = vec![open_path, dir.path().join("missing.seg")];
        assert!(matches!(
            merge(&only_bad, None, MergeFilter::new(), &MergeConfig::default()),
            Err(Error::NoValidSegments { excluded: 2 })
        ));
    }

    #[test]
    fn test_unsealed_memory_segment_excluded() {
        let sealed = memory_segment(&[(1, "t", "a")]);
        let mut unsealed = MemorySegment::new();
        let data = unsealed.append_event_data(EventData::new("t")).unwrap();
        unsealed.append_event(Event::new(Timestamp::from_secs(9), "t", data)).unwrap();
        unsealed.append_event(Event::new(Timestamp::from_secs(3), "t", data)).unwrap();

        let mut stream = merge_sources(
            boxed(vec![sealed, unsealed]),
            None,
            MergeFilter::new(),
            &MergeConfig::default(),
        )
        .unwrap();
        assert_eq!(stream.by_ref().count(), 1);
        assert_eq!(stream.report().excluded.len(), 1);
    }

    #[test]
    fn test_tags_attached_by_identifier() {
        let dir = TempDir::new().unwrap();
        let a = memory_segment(&[(1, "t", "a"), (2, "t", "b")]);
        let target = EventIdentifier::new(SegmentSource::segment_id(&a), 3);

        let mut tags = TagIndex::open(dir.path().join("tags.idx")).unwrap();
        tags.add_tag(target, ["suspicious"], None).unwrap();

        let tagged: Vec<(EventIdentifier, bool)> =
            merge_sources(boxed(vec![a]), Some(&tags), MergeFilter::new(), &MergeConfig::default())
                .unwrap()
                .map(|e| (e.identifier, e.tag.map_or(false, |t| t.has_label("suspicious"))))
                .collect();
        assert_eq!(tagged, vec![
            (EventIdentifier::new(target.segment, 1), false),
            (target, true),
        ]);
    }

    #[test]
    fn test_small_data_cache_still_resolves() {
        let mut segment = MemorySegment::new();
        let shared = segment.append_event_data(EventData::new("fs:stat").with_attribute("name", "f")).unwrap();
        for (secs, desc) in [(1, "Creation Time"), (2, "Modification Time"), (3, "Access Time")] {
            segment.append_event(Event::new(Timestamp::from_secs(secs), desc, shared)).unwrap();
        }
        for secs in 4..10 {
            let data = segment.append_event_data(EventData::new("t").with_attribute("n", secs)).unwrap();
            segment.append_event(Event::new(Timestamp::from_secs(secs), "t", data)).unwrap();
        }
        segment.seal().unwrap();

        let config = MergeConfig {
            data_cache_entries: 1,
            ..Default::default()
        };
        let out: Vec<MergedEvent> = merge_sources(boxed(vec![segment]), None, MergeFilter::new(), &config)
            .unwrap()
            .collect();
        assert_eq!(out.len(), 9);
        assert!(Arc::ptr_eq(&out[0].data, &out[1].data));
    }
}

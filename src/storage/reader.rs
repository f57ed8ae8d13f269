//! Read-only access to sealed segments

use crate::codec::{self, Record};
use crate::core::event::{DataIdentifier, Event, EventData, EventIdentifier, SegmentId};
use crate::core::temporal::{TimeRange, Timestamp};
use crate::error::{CodecError, Error, Result};
use crate::index::timeline::TimelineIndex;
use crate::storage::segment_file::{
    read_block, read_footer, RecordKind, RecordLocation, SegmentHeader, SegmentIndex, HEADER_SIZE,
};
use crate::storage::{SegmentEvent, SegmentSource};
use crc32fast::Hasher as Crc32Hasher;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

struct CachedBlock {
    offset: u64,
    payload: Arc<Vec<u8>>,
}

struct ReaderState {
    file: File,
    cache: Option<CachedBlock>,
}

/// Segment file reader
///
/// Holds the trailer index in memory; record bytes are read on demand, with
/// the most recently used block kept decompressed.
pub struct SegmentReader {
    path: PathBuf,
    header: SegmentHeader,
    index: SegmentIndex,
    state: Mutex<ReaderState>,
}

impl SegmentReader {
    /// Open a sealed segment.
    ///
    /// Fails with [`Error::NotSealed`] when the trailer is absent and with
    /// [`Error::Corrupt`] when the trailer does not match the data region.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut head = [0u8; HEADER_SIZE];
        if file_len < HEADER_SIZE as u64 {
            return Err(Error::NotSealed {
                path: path.to_path_buf(),
            });
        }
        file.read_exact(&mut head)?;
        let header = SegmentHeader::deserialize(path, &head)?;
        if header.codec_version > codec::CODEC_VERSION {
            return Err(Error::Codec(CodecError::UnsupportedVersion {
                found: header.codec_version,
                supported: codec::CODEC_VERSION,
            }));
        }

        let footer = read_footer(&mut file, file_len)?.ok_or_else(|| Error::NotSealed {
            path: path.to_path_buf(),
        })?;

        let expected_len = footer
            .data_end
            .checked_add(footer.trailer_len)
            .and_then(|n| n.checked_add(crate::storage::segment_file::FOOTER_SIZE as u64));
        if footer.data_end < HEADER_SIZE as u64 || expected_len != Some(file_len) {
            return Err(Error::corrupt(
                path,
                format!(
                    "footer describes {} data + {} trailer bytes, file is {} bytes",
                    footer.data_end, footer.trailer_len, file_len
                ),
            ));
        }

        file.seek(SeekFrom::Start(footer.data_end))?;
        let mut trailer = vec![0u8; footer.trailer_len as usize];
        file.read_exact(&mut trailer)?;

        let mut hasher = Crc32Hasher::new();
        hasher.update(&trailer);
        if hasher.finalize() != footer.trailer_crc {
            return Err(Error::corrupt(path, "trailer checksum mismatch"));
        }

        let index: SegmentIndex = bincode::deserialize(&trailer)
            .map_err(|e| Error::corrupt(path, format!("unreadable index: {}", e)))?;
        index.validate(path, footer.data_end)?;

        debug!(
            segment = %header.segment_id,
            records = index.records.len(),
            events = index.timeline.len(),
            "Opened sealed segment"
        );

        Ok(Self {
            path: path.to_path_buf(),
            header,
            index,
            state: Mutex::new(ReaderState { file, cache: None }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn segment_id(&self) -> SegmentId {
        self.header.segment_id
    }

    pub fn record_count(&self) -> usize {
        self.index.records.len()
    }

    pub fn event_count(&self) -> usize {
        self.index.timeline.len()
    }

    pub fn timeline(&self) -> &TimelineIndex {
        &self.index.timeline
    }

    /// Earliest and latest event timestamp
    pub fn time_bounds(&self) -> Option<TimeRange> {
        self.index.timeline.bounds()
    }

    fn locate(&self, sequence: u64, kind: RecordKind) -> Result<RecordLocation> {
        match self.index.locate(sequence) {
            Some(loc) if loc.kind == kind => Ok(*loc),
            _ => Err(Error::NotFound(format!(
                "{:?} {} in segment {}",
                kind, sequence, self.header.segment_id
            ))),
        }
    }

    fn block(&self, offset: u64) -> Result<Arc<Vec<u8>>> {
        let mut state = self.state.lock()?;
        if let Some(cached) = &state.cache {
            if cached.offset == offset {
                return Ok(Arc::clone(&cached.payload));
            }
        }
        let (_, raw) = read_block(&mut state.file, &self.path, offset)?;
        let payload = Arc::new(raw);
        state.cache = Some(CachedBlock {
            offset,
            payload: Arc::clone(&payload),
        });
        Ok(payload)
    }

    fn read_record(&self, loc: &RecordLocation) -> Result<Record> {
        let payload = self.block(loc.block_offset)?;
        let start = loc.offset_in_block as usize;
        let end = start + loc.length as usize;
        let bytes = payload.get(start..end).ok_or_else(|| {
            Error::corrupt(
                &self.path,
                format!("record {} lies outside its block", loc.sequence),
            )
        })?;
        Ok(codec::decode(bytes, self.header.codec_version)?)
    }

    /// Read one event by identifier
    pub fn read_event(&self, id: EventIdentifier) -> Result<Event> {
        self.check_segment(id.segment, id.sequence)?;
        self.event_at_sequence(id.sequence)
    }

    fn event_at_sequence(&self, sequence: u64) -> Result<Event> {
        let loc = self.locate(sequence, RecordKind::Event)?;
        match self.read_record(&loc)? {
            Record::Event(event) => Ok(event),
            _ => Err(Error::corrupt(
                &self.path,
                format!("record {} is indexed as an event", sequence),
            )),
        }
    }

    /// Random access to event data by identifier
    pub fn get_event_data(&self, id: DataIdentifier) -> Result<EventData> {
        self.check_segment(id.segment, id.sequence)?;
        let loc = self.locate(id.sequence, RecordKind::EventData)?;
        match self.read_record(&loc)? {
            Record::EventData(data) => Ok(data),
            _ => Err(Error::corrupt(
                &self.path,
                format!("record {} is indexed as event data", id.sequence),
            )),
        }
    }

    fn check_segment(&self, segment: SegmentId, sequence: u64) -> Result<()> {
        if segment != self.header.segment_id {
            return Err(Error::NotFound(format!(
                "{}:{} belongs to another segment than {}",
                segment, sequence, self.header.segment_id
            )));
        }
        Ok(())
    }

    /// Events with `start <= timestamp <= end`, in `(timestamp, sequence)` order.
    ///
    /// The start position is found by binary search over the timeline index.
    pub fn read_range(&self, start: Timestamp, end: Timestamp) -> EventRange<'_> {
        EventRange::new(self, self.index.timeline.positions(TimeRange::new(start, end)))
    }

    /// Every event in the segment
    pub fn read_all(&self) -> EventRange<'_> {
        EventRange::new(self, 0..self.index.timeline.len())
    }
}

impl SegmentSource for SegmentReader {
    fn segment_id(&self) -> SegmentId {
        self.header.segment_id
    }

    fn timeline(&self) -> &TimelineIndex {
        &self.index.timeline
    }

    fn read_event(&self, sequence: u64) -> Result<Event> {
        self.event_at_sequence(sequence)
    }

    fn get_event_data(&self, id: DataIdentifier) -> Result<EventData> {
        SegmentReader::get_event_data(self, id)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Finite, restartable iteration over a slice of a segment's timeline.
///
/// Cloning yields an independent iterator; [`EventRange::rewind`] restarts
/// from the first position of the range.
#[derive(Clone)]
pub struct EventRange<'a> {
    reader: &'a SegmentReader,
    positions: Range<usize>,
    next: usize,
}

impl<'a> EventRange<'a> {
    fn new(reader: &'a SegmentReader, positions: Range<usize>) -> Self {
        let next = positions.start;
        Self {
            reader,
            positions,
            next,
        }
    }

    pub fn rewind(&mut self) {
        self.next = self.positions.start;
    }

    /// Number of events in the whole range
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl<'a> Iterator for EventRange<'a> {
    type Item = Result<SegmentEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.positions.end {
            return None;
        }
        let entry = self.reader.index.timeline.get(self.next)?;
        self.next += 1;
        let id = EventIdentifier::new(self.reader.header.segment_id, entry.sequence);
        Some(
            self.reader
                .event_at_sequence(entry.sequence)
                .map(|event| SegmentEvent { id, event }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.positions.end.saturating_sub(self.next);
        (left, Some(left))
    }
}

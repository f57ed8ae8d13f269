//! Single-writer segment appender with batched, crash-consistent flushes

use crate::codec::{self, Record};
use crate::config::SegmentConfig;
use crate::core::event::{DataIdentifier, Event, EventData, EventIdentifier, SegmentId};
use crate::core::temporal::{TimeRange, Timestamp};
use crate::error::{Error, Result};
use crate::index::timeline::TimelineIndex;
use crate::storage::segment_file::{
    self, parse_entries, put_entry, read_footer, BlockHeader, Footer, RecordKind, RecordLocation,
    SegmentHeader, SegmentIndex, BLOCK_HEADER_SIZE, HEADER_SIZE, MAX_BLOCK_SIZE,
};
use crate::storage::{RecordSink, SealSummary};
use bytes::BytesMut;
use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// What reopening an unsealed segment found and repaired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Intact blocks kept
    pub blocks: u32,
    /// Records in the intact blocks
    pub records: u64,
    /// Bytes cut from a torn or corrupt tail
    pub truncated_bytes: u64,
    /// First sequence number handed out after recovery
    pub resumed_at: u64,
}

struct PendingRecord {
    sequence: u64,
    kind: RecordKind,
    offset_in_block: u32,
    length: u32,
    timestamp: Option<Timestamp>,
}

/// Segment file writer
///
/// Records are buffered and written as one checksummed block per flush.
/// Everything up to the last flushed block survives an unclean shutdown;
/// the segment only becomes readable once [`SegmentWriter::seal`] writes
/// the trailer index.
pub struct SegmentWriter {
    path: PathBuf,
    file: File,
    header: SegmentHeader,
    config: SegmentConfig,
    next_sequence: u64,
    pending: BytesMut,
    pending_records: Vec<PendingRecord>,
    records: Vec<RecordLocation>,
    timeline: TimelineIndex,
    data_end: u64,
    block_count: u32,
    sealed: Option<SealSummary>,
    recovery: Option<RecoveryReport>,
}

impl SegmentWriter {
    /// Open a segment for writing.
    ///
    /// Creates a fresh segment when nothing exists at `path`, resumes an
    /// unsealed one (cutting any torn tail), and refuses sealed data.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open_writable<P: AsRef<Path>>(path: P, config: &SegmentConfig) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() >= HEADER_SIZE as u64 => Self::resume(path, config),
            Ok(_) => {
                warn!(path = %path.display(), "Discarding segment with incomplete header");
                std::fs::remove_file(path)?;
                Self::create(path, SegmentId::new(), config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::create(path, SegmentId::new(), config)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Create a new, empty segment file with the given identifier
    pub fn create<P: AsRef<Path>>(path: P, segment_id: SegmentId, config: &SegmentConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::AlreadyExists {
                    path: path.to_path_buf(),
                },
                _ => Error::Io(e),
            })?;

        let header = SegmentHeader::new(segment_id, config.flush_records);
        file.write_all(&header.serialize())?;
        file.sync_all()?;

        info!(segment = %segment_id, path = %path.display(), "Created segment");

        Ok(Self::with_state(path, file, header, config, 0))
    }

    fn with_state(path: &Path, file: File, header: SegmentHeader, config: &SegmentConfig, next_sequence: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            header,
            config: config.clone(),
            next_sequence,
            pending: BytesMut::new(),
            pending_records: Vec::new(),
            records: Vec::new(),
            timeline: TimelineIndex::new(),
            data_end: HEADER_SIZE as u64,
            block_count: 0,
            sealed: None,
            recovery: None,
        }
    }

    fn resume(path: &Path, config: &SegmentConfig) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();

        if read_footer(&mut file, file_len)?.is_some() {
            return Err(Error::AlreadyExists {
                path: path.to_path_buf(),
            });
        }

        let mut head = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut head)?;
        let header = SegmentHeader::deserialize(path, &head)?;
        if header.codec_version > codec::CODEC_VERSION {
            return Err(codec_too_new(header.codec_version));
        }

        let mut writer = Self::with_state(path, file, header, config, 0);
        let report = writer.scan_existing(file_len)?;
        writer.recovery = Some(report);
        Ok(writer)
    }

    /// Rebuild in-memory state from the intact blocks and cut the rest
    fn scan_existing(&mut self, file_len: u64) -> Result<RecoveryReport> {
        let mut offset = HEADER_SIZE as u64;
        let mut last_sequence: Option<u64> = None;
        // Highest sequence floor left by earlier recoveries.
        let mut reserved: u64 = 0;
        let mut report = RecoveryReport::default();

        while offset < file_len {
            let remaining = file_len - offset;
            if remaining < BLOCK_HEADER_SIZE as u64 {
                warn!(path = %self.path.display(), offset, "Torn block header at segment tail");
                break;
            }

            self.file.seek(SeekFrom::Start(offset))?;
            let mut head = [0u8; BLOCK_HEADER_SIZE];
            self.file.read_exact(&mut head)?;
            let block = BlockHeader::deserialize(&head);
            if block.payload_len as usize > MAX_BLOCK_SIZE || block.frame_len() > remaining {
                warn!(path = %self.path.display(), offset, "Torn block at segment tail");
                break;
            }

            let mut payload = vec![0u8; block.payload_len as usize];
            self.file.read_exact(&mut payload)?;
            if !block.verify(&payload) {
                warn!(path = %self.path.display(), offset, "Block checksum mismatch, truncating from here");
                break;
            }

            match self.index_block(offset, &block, &payload, last_sequence) {
                Ok(last) => {
                    if block.record_count == 0 {
                        reserved = reserved.max(block.first_sequence);
                    }
                    last_sequence = last.or(last_sequence);
                    report.blocks += 1;
                    report.records += block.record_count as u64;
                    self.block_count += 1;
                    offset += block.frame_len();
                }
                Err(reason) => {
                    warn!(path = %self.path.display(), offset, %reason, "Unreadable block, truncating from here");
                    break;
                }
            }
        }

        if offset < file_len {
            report.truncated_bytes = file_len - offset;
            self.file.set_len(offset)?;
            self.file.sync_all()?;
        }
        self.data_end = offset;

        // Sequences handed out but never flushed are lost with the tail; skip
        // past every one that could have been assigned so none is reused.
        let durable_next = last_sequence.map_or(0, |s| s + 1).max(reserved);
        self.next_sequence = durable_next + self.header.flush_records as u64;
        self.reserve_sequences()?;
        report.resumed_at = self.next_sequence;

        info!(
            segment = %self.header.segment_id,
            blocks = report.blocks,
            records = report.records,
            truncated_bytes = report.truncated_bytes,
            resumed_at = report.resumed_at,
            "Recovered unsealed segment"
        );
        Ok(report)
    }

    /// Persist the resume point as an empty block so a later recovery
    /// never hands out a number issued after this one.
    fn reserve_sequences(&mut self) -> Result<()> {
        let (payload, flags) =
            segment_file::pack_payload(&[], self.config.compression, self.config.compression_level)?;
        let block = BlockHeader::for_payload(&payload, flags, self.next_sequence, 0);

        let offset = self.data_end;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&block.serialize())?;
        self.file.write_all(&payload)?;
        self.file.sync_data()?;

        self.data_end += block.frame_len();
        self.block_count += 1;
        debug!(segment = %self.header.segment_id, first_sequence = self.next_sequence, "Reserved sequences");
        Ok(())
    }

    fn index_block(
        &mut self,
        offset: u64,
        block: &BlockHeader,
        payload: &[u8],
        mut last_sequence: Option<u64>,
    ) -> std::result::Result<Option<u64>, String> {
        let raw = segment_file::unpack_payload(payload, block.flags).map_err(|e| e.to_string())?;
        let entries = parse_entries(&raw)?;
        if entries.len() != block.record_count as usize {
            return Err(format!(
                "block declares {} records, holds {}",
                block.record_count,
                entries.len()
            ));
        }

        let mut locations = Vec::with_capacity(entries.len());
        let mut timeline = Vec::new();
        for entry in &entries {
            if last_sequence.is_some_and(|last| entry.sequence <= last) {
                return Err(format!("sequence {} out of order", entry.sequence));
            }
            last_sequence = Some(entry.sequence);

            let record = codec::decode(entry.bytes, self.header.codec_version).map_err(|e| e.to_string())?;
            let (kind, timestamp) = segment_file::record_kind(&record)
                .ok_or_else(|| format!("record {} has a kind segments do not hold", entry.sequence))?;
            locations.push(RecordLocation {
                sequence: entry.sequence,
                kind,
                block_offset: offset,
                offset_in_block: entry.offset,
                length: entry.bytes.len() as u32,
            });
            if let Some(ts) = timestamp {
                timeline.push((ts, entry.sequence));
            }
        }

        self.records.extend(locations);
        for (ts, seq) in timeline {
            self.timeline.push(ts, seq);
        }
        Ok(last_sequence)
    }

    pub fn segment_id(&self) -> SegmentId {
        self.header.segment_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Present when this writer resumed an unsealed segment
    pub fn recovery(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Records accepted so far, flushed or not
    pub fn record_count(&self) -> u64 {
        (self.records.len() + self.pending_records.len()) as u64
    }

    /// Append event data, returning its identifier
    pub fn append_event_data(&mut self, data: EventData) -> Result<DataIdentifier> {
        let sequence = self.append_record(&Record::EventData(data), RecordKind::EventData, None)?;
        Ok(DataIdentifier::new(self.header.segment_id, sequence))
    }

    /// Append an event, returning its identifier.
    ///
    /// The event must reference event data already appended to this segment.
    pub fn append_event(&mut self, event: Event) -> Result<EventIdentifier> {
        if event.data.segment != self.header.segment_id {
            return Err(Error::InvalidRecord(format!(
                "event references data {} outside segment {}",
                event.data, self.header.segment_id
            )));
        }
        if self.kind_of(event.data.sequence) != Some(RecordKind::EventData) {
            return Err(Error::InvalidRecord(format!(
                "event references unknown event data {}",
                event.data
            )));
        }

        let timestamp = event.timestamp;
        let sequence = self.append_record(&Record::Event(event), RecordKind::Event, Some(timestamp))?;
        Ok(EventIdentifier::new(self.header.segment_id, sequence))
    }

    fn kind_of(&self, sequence: u64) -> Option<RecordKind> {
        if let Ok(i) = self.records.binary_search_by_key(&sequence, |l| l.sequence) {
            return Some(self.records[i].kind);
        }
        self.pending_records
            .binary_search_by_key(&sequence, |p| p.sequence)
            .ok()
            .map(|i| self.pending_records[i].kind)
    }

    fn append_record(&mut self, record: &Record, kind: RecordKind, timestamp: Option<Timestamp>) -> Result<u64> {
        if self.sealed.is_some() {
            return Err(Error::InvalidRecord(format!(
                "segment {} is sealed",
                self.header.segment_id
            )));
        }

        let bytes = codec::encode(record);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let offset_in_block = put_entry(&mut self.pending, sequence, &bytes);
        self.pending_records.push(PendingRecord {
            sequence,
            kind,
            offset_in_block,
            length: bytes.len() as u32,
            timestamp,
        });

        if self.pending_records.len() >= self.header.flush_records as usize
            || self.pending.len() >= self.config.flush_bytes
        {
            self.flush()?;
        }

        Ok(sequence)
    }

    /// Write buffered records as one block; a no-op when nothing is buffered
    pub fn flush(&mut self) -> Result<()> {
        let Some(first) = self.pending_records.first() else {
            return Ok(());
        };
        let first_sequence = first.sequence;
        let record_count = self.pending_records.len() as u32;

        let (payload, flags) =
            segment_file::pack_payload(&self.pending, self.config.compression, self.config.compression_level)?;
        let block = BlockHeader::for_payload(&payload, flags, first_sequence, record_count);

        let block_offset = self.data_end;
        if let Err(e) = self.write_block(block_offset, &block, &payload) {
            // Leave the file ending at the last good flush point.
            if let Err(rollback) = self.file.set_len(block_offset) {
                warn!(
                    segment = %self.header.segment_id,
                    offset = block_offset,
                    error = %rollback,
                    "Could not cut partial block; recovery will truncate it"
                );
            }
            return Err(e);
        }

        for p in self.pending_records.drain(..) {
            self.records.push(RecordLocation {
                sequence: p.sequence,
                kind: p.kind,
                block_offset,
                offset_in_block: p.offset_in_block,
                length: p.length,
            });
            if let Some(ts) = p.timestamp {
                self.timeline.push(ts, p.sequence);
            }
        }
        self.pending.clear();
        self.data_end += block.frame_len();
        self.block_count += 1;

        debug!(
            segment = %self.header.segment_id,
            first_sequence,
            records = record_count,
            bytes = block.frame_len(),
            "Flushed block"
        );
        Ok(())
    }

    fn write_block(&mut self, offset: u64, block: &BlockHeader, payload: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&block.serialize())?;
        self.file.write_all(payload)?;
        if self.config.sync_on_flush {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Flush, write the sorted index trailer and footer, and become read-only.
    ///
    /// Calling it again returns the first summary and leaves the file untouched.
    #[instrument(skip(self), fields(segment = %self.header.segment_id))]
    pub fn seal(&mut self) -> Result<SealSummary> {
        if let Some(summary) = &self.sealed {
            return Ok(summary.clone());
        }

        self.flush()?;
        self.timeline.sort();

        let index = SegmentIndex {
            records: self.records.clone(),
            timeline: self.timeline.clone(),
            data_length: self.data_end - HEADER_SIZE as u64,
            block_count: self.block_count,
        };
        let trailer = bincode::serialize(&index)?;

        let mut hasher = Crc32Hasher::new();
        hasher.update(&trailer);
        let footer = Footer {
            trailer_len: trailer.len() as u64,
            data_end: self.data_end,
            trailer_crc: hasher.finalize(),
        };

        self.file.seek(SeekFrom::Start(self.data_end))?;
        self.file.write_all(&trailer)?;
        self.file.write_all(&footer.serialize())?;
        self.file.sync_all()?;

        let summary = SealSummary {
            segment_id: self.header.segment_id,
            path: Some(self.path.clone()),
            record_count: self.records.len() as u64,
            event_count: self.timeline.len() as u64,
            time_bounds: self.timeline.bounds(),
        };
        info!(
            records = summary.record_count,
            events = summary.event_count,
            blocks = self.block_count,
            "Sealed segment"
        );
        self.sealed = Some(summary.clone());
        Ok(summary)
    }

    /// Seal and close
    pub fn finish(mut self) -> Result<SealSummary> {
        self.seal()
    }

    /// Close without flushing or sealing; buffered records are lost and
    /// the file stays `Open`, exactly as after a crash.
    pub fn abandon(self) {
        warn!(
            segment = %self.header.segment_id,
            unflushed = self.pending_records.len(),
            "Abandoning unsealed segment"
        );
    }

    /// Time span of the events accepted so far
    pub fn time_bounds(&self) -> Option<TimeRange> {
        let flushed = self.timeline.entries().iter().map(|e| e.timestamp);
        let pending = self.pending_records.iter().filter_map(|p| p.timestamp);
        let mut all = flushed.chain(pending);
        let first = all.next()?;
        let (min, max) = all.fold((first, first), |(lo, hi), ts| (lo.min(ts), hi.max(ts)));
        Some(TimeRange::new(min, max))
    }
}

impl RecordSink for SegmentWriter {
    fn segment_id(&self) -> SegmentId {
        SegmentWriter::segment_id(self)
    }

    fn append_event_data(&mut self, data: EventData) -> Result<DataIdentifier> {
        SegmentWriter::append_event_data(self, data)
    }

    fn append_event(&mut self, event: Event) -> Result<EventIdentifier> {
        SegmentWriter::append_event(self, event)
    }

    fn seal(&mut self) -> Result<SealSummary> {
        SegmentWriter::seal(self)
    }
}

fn codec_too_new(found: u16) -> Error {
    Error::Codec(crate::error::CodecError::UnsupportedVersion {
        found,
        supported: codec::CODEC_VERSION,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment_file::{segment_state, SegmentState};
    use tempfile::TempDir;

    fn small_config() -> SegmentConfig {
        SegmentConfig {
            flush_records: 4,
            sync_on_flush: false,
            ..Default::default()
        }
    }

    fn append_pair(writer: &mut SegmentWriter, secs: i64) -> EventIdentifier {
        let data = writer
            .append_event_data(EventData::new("test:event").with_attribute("n", secs))
            .unwrap();
        writer
            .append_event(Event::new(Timestamp::from_secs(secs), "Creation Time", data))
            .unwrap()
    }

    #[test]
    fn test_sequences_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open_writable(dir.path().join("a.seg"), &small_config()).unwrap();

        let a = append_pair(&mut writer, 10);
        let b = append_pair(&mut writer, 5);
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 3);
        assert_eq!(writer.record_count(), 4);
    }

    #[test]
    fn test_rejects_cross_segment_reference() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open_writable(dir.path().join("a.seg"), &small_config()).unwrap();

        let foreign = DataIdentifier::new(SegmentId::new(), 0);
        let err = writer
            .append_event(Event::new(Timestamp::from_secs(1), "x", foreign))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)));

        let dangling = DataIdentifier::new(writer.segment_id(), 99);
        let err = writer
            .append_event(Event::new(Timestamp::from_secs(1), "x", dangling))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)));

        // An event is not event data.
        let event = append_pair(&mut writer, 1);
        let wrong_kind = DataIdentifier::new(writer.segment_id(), event.sequence);
        assert!(writer
            .append_event(Event::new(Timestamp::from_secs(1), "x", wrong_kind))
            .is_err());
    }

    #[test]
    fn test_seal_is_idempotent_and_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.seg");
        let mut writer = SegmentWriter::open_writable(&path, &small_config()).unwrap();
        for secs in [30, 10, 20] {
            append_pair(&mut writer, secs);
        }

        let first = writer.seal().unwrap();
        let bytes_once = std::fs::read(&path).unwrap();
        let second = writer.seal().unwrap();
        let bytes_twice = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(bytes_once, bytes_twice);
        assert_eq!(first.event_count, 3);
        assert_eq!(first.record_count, 6);
        assert_eq!(segment_state(&path).unwrap(), SegmentState::Sealed);
        assert!(writer.append_event_data(EventData::new("late")).is_err());
    }

    #[test]
    fn test_open_writable_refuses_sealed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.seg");
        let writer = SegmentWriter::open_writable(&path, &small_config()).unwrap();
        writer.finish().unwrap();

        let err = SegmentWriter::open_writable(&path, &small_config()).err().unwrap();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn test_resume_skips_possibly_issued_sequences() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.seg");
        let config = small_config();

        let segment_id = {
            let mut writer = SegmentWriter::open_writable(&path, &config).unwrap();
            append_pair(&mut writer, 1);
            append_pair(&mut writer, 2); // 4 records: flushed as one block
            append_pair(&mut writer, 3); // buffered only, lost below
            writer.segment_id()
        };
        assert_eq!(segment_state(&path).unwrap(), SegmentState::Open);

        let mut writer = SegmentWriter::open_writable(&path, &config).unwrap();
        assert_eq!(writer.segment_id(), segment_id);
        let report = writer.recovery().cloned().unwrap();
        assert_eq!(report.blocks, 1);
        assert_eq!(report.records, 4);
        assert_eq!(report.truncated_bytes, 0);
        assert_eq!(report.resumed_at, 4 + 4);

        let next = append_pair(&mut writer, 4);
        assert_eq!(next.sequence, 9);
    }

    #[test]
    fn test_repeated_crashes_never_reuse_sequences() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.seg");
        let config = small_config();

        {
            let mut writer = SegmentWriter::open_writable(&path, &config).unwrap();
            append_pair(&mut writer, 1);
            append_pair(&mut writer, 2); // flushed
        }

        let first = {
            let mut writer = SegmentWriter::open_writable(&path, &config).unwrap();
            let id = append_pair(&mut writer, 3); // buffered only
            writer.abandon();
            id
        };

        let mut writer = SegmentWriter::open_writable(&path, &config).unwrap();
        let report = writer.recovery().cloned().unwrap();
        assert_eq!(report.records, 4);
        assert!(report.resumed_at > first.sequence);
        let second = append_pair(&mut writer, 4);
        assert!(second.sequence > first.sequence);

        writer.seal().unwrap();
        let reader = crate::storage::SegmentReader::open_readonly(&path).unwrap();
        assert_eq!(reader.event_count(), 3);
        assert!(reader.read_event(second).is_ok());
    }

    #[test]
    fn test_resume_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.seg");
        let config = small_config();

        {
            let mut writer = SegmentWriter::open_writable(&path, &config).unwrap();
            for secs in 0..4 {
                append_pair(&mut writer, secs); // two blocks of four records
            }
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let writer = SegmentWriter::open_writable(&path, &config).unwrap();
        let report = writer.recovery().unwrap();
        assert_eq!(report.blocks, 1);
        assert_eq!(report.records, 4);
        assert!(report.truncated_bytes > 0);
    }

    #[test]
    fn test_time_bounds_cover_pending() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open_writable(dir.path().join("a.seg"), &small_config()).unwrap();
        assert!(writer.time_bounds().is_none());
        for secs in [50, 10, 30] {
            append_pair(&mut writer, secs);
        }
        let bounds = writer.time_bounds().unwrap();
        assert_eq!(bounds.start, Timestamp::from_secs(10));
        assert_eq!(bounds.end, Timestamp::from_secs(50));
    }
}

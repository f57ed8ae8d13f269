//! Segment file format: low-level on-disk layout
//!
//! ```text
//! +----------------------+  0
//! | header (64 bytes)    |
//! +----------------------+  HEADER_SIZE
//! | block frame          |  written at every flush point
//! | block frame          |
//! | ...                  |
//! +----------------------+  data_end
//! | trailer (index)      |  written only when sealed
//! +----------------------+
//! | footer (32 bytes)    |
//! +----------------------+
//! ```
//!
//! A block frame is `[payload_len u32][crc32 u32][flags u8][first_seq u64]
//! [record_count u32][payload]`; the CRC covers everything after itself.
//! The (optionally zstd-compressed) payload is a run of
//! `[sequence u64][len u32][encoded record]` entries.
//! A block with no records marks where a resumed writer restarted its
//! sequence counter.

use crate::codec::{self, Record};
use crate::core::event::SegmentId;
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::index::timeline::TimelineIndex;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Segment file format version
pub const SEGMENT_VERSION: u8 = 1;

/// Segment header size (64 bytes)
pub const HEADER_SIZE: usize = 64;

/// Footer size (32 bytes)
pub const FOOTER_SIZE: usize = 32;

/// Block frame header size
pub const BLOCK_HEADER_SIZE: usize = 21;

/// Magic number at the start of every segment: "TLSEG"
pub const MAGIC: &[u8; 5] = b"TLSEG";

/// Magic number closing a sealed segment
pub const END_MAGIC: &[u8; 8] = b"TLSEGEND";

/// Block payload is zstd-compressed
pub const BLOCK_FLAG_COMPRESSED: u8 = 0x01;

/// Largest block payload accepted when reading
pub const MAX_BLOCK_SIZE: usize = 256 * 1024 * 1024;

/// Record kind stored in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    EventData,
    Event,
}

/// Lifecycle state of a segment as observed on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Open,
    Sealed,
}

/// Segment header structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_id: SegmentId,
    pub codec_version: u16,
    pub created_at: Timestamp,
    /// Upper bound on records buffered between flush points
    pub flush_records: u32,
}

impl SegmentHeader {
    pub fn new(segment_id: SegmentId, flush_records: u32) -> Self {
        Self {
            segment_id,
            codec_version: codec::CODEC_VERSION,
            created_at: Timestamp::now(),
            flush_records,
        }
    }

    /// Serialize header to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);

        buf.put_slice(MAGIC);
        buf.put_u8(SEGMENT_VERSION);
        buf.put_u16(self.codec_version);
        buf.put_slice(self.segment_id.as_bytes());
        buf.put_i64(self.created_at.as_micros());
        buf.put_u32(self.flush_records);

        // Padding to 64 bytes: 5+1+2+16+8+4 = 36
        buf.put_bytes(0, HEADER_SIZE - 36);

        debug_assert_eq!(buf.len(), HEADER_SIZE);
        buf.freeze()
    }

    /// Deserialize header from bytes
    pub fn deserialize(path: &Path, mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupt(path, "file shorter than segment header"));
        }

        let magic = &buf[0..5];
        if magic != MAGIC {
            return Err(Error::corrupt(path, format!("invalid magic number: {:?}", magic)));
        }
        buf.advance(5);

        let version = buf.get_u8();
        if version != SEGMENT_VERSION {
            return Err(Error::corrupt(path, format!("unsupported segment version: {}", version)));
        }

        let codec_version = buf.get_u16();
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let created_at = Timestamp::from_micros(buf.get_i64());
        let flush_records = buf.get_u32();

        Ok(Self {
            segment_id: SegmentId::from_bytes(id),
            codec_version,
            created_at,
            flush_records,
        })
    }
}

/// Fixed-size record closing a sealed segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub trailer_len: u64,
    /// Absolute offset where the data region ends and the trailer begins
    pub data_end: u64,
    pub trailer_crc: u32,
}

impl Footer {
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        buf.put_u64(self.trailer_len);
        buf.put_u64(self.data_end);
        buf.put_u32(self.trailer_crc);
        buf.put_u32(0);
        buf.put_slice(END_MAGIC);
        debug_assert_eq!(buf.len(), FOOTER_SIZE);
        buf.freeze()
    }

    /// `None` when the end magic is absent, i.e. the segment is not sealed
    pub fn deserialize(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < FOOTER_SIZE || &buf[FOOTER_SIZE - 8..FOOTER_SIZE] != END_MAGIC {
            return None;
        }
        let trailer_len = buf.get_u64();
        let data_end = buf.get_u64();
        let trailer_crc = buf.get_u32();
        Some(Self {
            trailer_len,
            data_end,
            trailer_crc,
        })
    }
}

/// Where a record lives inside the data region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLocation {
    pub sequence: u64,
    pub kind: RecordKind,
    /// Absolute file offset of the block frame
    pub block_offset: u64,
    /// Offset of the encoded record inside the decompressed payload
    pub offset_in_block: u32,
    pub length: u32,
}

/// Trailer written at seal time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndex {
    /// Every record, ascending by sequence
    pub records: Vec<RecordLocation>,
    /// Events in `(timestamp, sequence)` order
    pub timeline: TimelineIndex,
    /// Length of the data region in bytes
    pub data_length: u64,
    pub block_count: u32,
}

impl SegmentIndex {
    /// Location of `sequence`, by binary search
    pub fn locate(&self, sequence: u64) -> Option<&RecordLocation> {
        self.records
            .binary_search_by_key(&sequence, |loc| loc.sequence)
            .ok()
            .map(|i| &self.records[i])
    }

    /// Structural checks against the data region the footer describes
    pub fn validate(&self, path: &Path, data_end: u64) -> Result<()> {
        let expected = data_end.saturating_sub(HEADER_SIZE as u64);
        if self.data_length != expected {
            return Err(Error::corrupt(
                path,
                format!(
                    "index records {} data bytes but data region holds {}",
                    self.data_length, expected
                ),
            ));
        }
        if !self.records.windows(2).all(|w| w[0].sequence < w[1].sequence) {
            return Err(Error::corrupt(path, "record index not ordered by sequence"));
        }
        if let Some(bad) = self
            .records
            .iter()
            .find(|loc| loc.block_offset < HEADER_SIZE as u64 || loc.block_offset >= data_end)
        {
            return Err(Error::corrupt(
                path,
                format!("record {} points outside the data region", bad.sequence),
            ));
        }
        if !self.timeline.is_sorted() {
            return Err(Error::corrupt(path, "timeline index not sorted"));
        }
        let events = self.records.iter().filter(|l| l.kind == RecordKind::Event).count();
        if events != self.timeline.len() {
            return Err(Error::corrupt(
                path,
                format!("timeline has {} entries for {} events", self.timeline.len(), events),
            ));
        }
        Ok(())
    }
}

/// Block frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub payload_len: u32,
    pub crc: u32,
    pub flags: u8,
    pub first_sequence: u64,
    pub record_count: u32,
}

impl BlockHeader {
    /// Build a header for `payload`, computing its CRC
    pub fn for_payload(payload: &[u8], flags: u8, first_sequence: u64, record_count: u32) -> Self {
        let crc = block_crc(flags, first_sequence, record_count, payload);
        Self {
            payload_len: payload.len() as u32,
            crc,
            flags,
            first_sequence,
            record_count,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BLOCK_HEADER_SIZE);
        buf.put_u32(self.payload_len);
        buf.put_u32(self.crc);
        buf.put_u8(self.flags);
        buf.put_u64(self.first_sequence);
        buf.put_u32(self.record_count);
        buf.freeze()
    }

    pub fn deserialize(mut buf: &[u8]) -> Self {
        Self {
            payload_len: buf.get_u32(),
            crc: buf.get_u32(),
            flags: buf.get_u8(),
            first_sequence: buf.get_u64(),
            record_count: buf.get_u32(),
        }
    }

    pub fn frame_len(&self) -> u64 {
        BLOCK_HEADER_SIZE as u64 + self.payload_len as u64
    }

    pub fn verify(&self, payload: &[u8]) -> bool {
        block_crc(self.flags, self.first_sequence, self.record_count, payload) == self.crc
    }
}

fn block_crc(flags: u8, first_sequence: u64, record_count: u32, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(&[flags]);
    hasher.update(&first_sequence.to_be_bytes());
    hasher.update(&record_count.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Append one payload entry
pub fn put_entry(buf: &mut BytesMut, sequence: u64, record: &[u8]) -> u32 {
    buf.put_u64(sequence);
    buf.put_u32(record.len() as u32);
    let offset = buf.len() as u32;
    buf.put_slice(record);
    offset
}

/// One decoded entry of a block payload
#[derive(Debug)]
pub struct PayloadEntry<'a> {
    pub sequence: u64,
    pub offset: u32,
    pub bytes: &'a [u8],
}

/// Split a decompressed payload into its entries
pub fn parse_entries(payload: &[u8]) -> std::result::Result<Vec<PayloadEntry<'_>>, String> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        if payload.len() - pos < 12 {
            return Err(format!("truncated entry header at payload offset {}", pos));
        }
        let mut head = &payload[pos..pos + 12];
        let sequence = head.get_u64();
        let len = head.get_u32() as usize;
        pos += 12;
        if payload.len() - pos < len {
            return Err(format!("entry {} overruns block payload", sequence));
        }
        entries.push(PayloadEntry {
            sequence,
            offset: pos as u32,
            bytes: &payload[pos..pos + len],
        });
        pos += len;
    }
    Ok(entries)
}

/// Compress (or not) a block payload, returning bytes and flags
pub fn pack_payload(raw: &[u8], compression: bool, level: i32) -> Result<(Vec<u8>, u8)> {
    if compression {
        let compressed = zstd::encode_all(raw, level)
            .map_err(|e| Error::Serialization(format!("ZSTD compression failed: {}", e)))?;
        Ok((compressed, BLOCK_FLAG_COMPRESSED))
    } else {
        Ok((raw.to_vec(), 0))
    }
}

/// Inverse of [`pack_payload`]
pub fn unpack_payload(payload: &[u8], flags: u8) -> std::io::Result<Vec<u8>> {
    if flags & BLOCK_FLAG_COMPRESSED != 0 {
        zstd::decode_all(payload)
    } else {
        Ok(payload.to_vec())
    }
}

/// Read and verify the block frame at `offset`, returning the decompressed payload
pub fn read_block(file: &mut File, path: &Path, offset: u64) -> Result<(BlockHeader, Vec<u8>)> {
    file.seek(SeekFrom::Start(offset))?;
    let mut head = [0u8; BLOCK_HEADER_SIZE];
    file.read_exact(&mut head)?;
    let header = BlockHeader::deserialize(&head);
    if header.payload_len as usize > MAX_BLOCK_SIZE {
        return Err(Error::corrupt(
            path,
            format!("block at {} claims {} bytes", offset, header.payload_len),
        ));
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    file.read_exact(&mut payload)?;
    if !header.verify(&payload) {
        return Err(Error::corrupt(path, format!("checksum mismatch in block at {}", offset)));
    }

    let raw = unpack_payload(&payload, header.flags).map_err(|e| {
        Error::corrupt(path, format!("block at {} failed to decompress: {}", offset, e))
    })?;
    Ok((header, raw))
}

/// Read the footer, if the file ends with one
pub fn read_footer(file: &mut File, file_len: u64) -> Result<Option<Footer>> {
    if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64))?;
    let mut buf = [0u8; FOOTER_SIZE];
    file.read_exact(&mut buf)?;
    Ok(Footer::deserialize(&buf))
}

/// Probe whether the segment at `path` is sealed, without loading its index
pub fn segment_state<P: AsRef<Path>>(path: P) -> Result<SegmentState> {
    let mut file = File::open(path.as_ref())?;
    let len = file.metadata()?.len();
    Ok(match read_footer(&mut file, len)? {
        Some(_) => SegmentState::Sealed,
        None => SegmentState::Open,
    })
}

/// Read just the header of a segment, sealed or not
pub fn read_header<P: AsRef<Path>>(path: P) -> Result<SegmentHeader> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut buf)
        .map_err(|_| Error::corrupt(path, "segment shorter than its header"))?;
    SegmentHeader::deserialize(path, &buf)
}

/// Classify a decoded record for the index
pub fn record_kind(record: &Record) -> Option<(RecordKind, Option<Timestamp>)> {
    match record {
        Record::EventData(_) => Some((RecordKind::EventData, None)),
        Record::Event(event) => Some((RecordKind::Event, Some(event.timestamp))),
        Record::EventTag(_) => None,
    }
}

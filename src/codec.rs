//! Record codec: compact, deterministic binary encoding of records
//!
//! Layout of an encoded record:
//!
//! ```text
//! [type tag u8][body]
//! ```
//!
//! Integers are big-endian and fixed width, strings are `u32` length
//! prefixed UTF-8. Every attribute value is framed as
//! `[kind u8][len u32][payload]`, so a reader can step over value kinds it
//! does not know and keep them as [`AttributeValue::Opaque`].
//!
//! Attribute maps are ordered and floats are written by bit pattern, so a
//! logical record always encodes to the same bytes.

use crate::core::event::{DataIdentifier, Event, EventData, EventIdentifier, EventTag, SegmentId};
use crate::core::temporal::Timestamp;
use crate::core::value::{AttributeValue, Attributes};
use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

/// Newest schema version this build reads and the one it writes.
pub const CODEC_VERSION: u16 = 1;

/// Deepest attribute nesting accepted by the decoder
pub const MAX_NESTING: usize = 64;

const TAG_EVENT_DATA: u8 = 1;
const TAG_EVENT: u8 = 2;
const TAG_EVENT_TAG: u8 = 3;

const KIND_STRING: u8 = 1;
const KIND_INTEGER: u8 = 2;
const KIND_FLOAT: u8 = 3;
const KIND_BOOLEAN: u8 = 4;
const KIND_LIST: u8 = 5;
const KIND_CONTAINER: u8 = 6;
const KIND_NULL: u8 = 7;

/// Any record the codec can carry
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    EventData(EventData),
    Event(Event),
    EventTag(EventTag),
}

impl Record {
    /// Type tag written in front of the body
    pub fn type_tag(&self) -> u8 {
        match self {
            Record::EventData(_) => TAG_EVENT_DATA,
            Record::Event(_) => TAG_EVENT,
            Record::EventTag(_) => TAG_EVENT_TAG,
        }
    }
}

/// Encode a record with the current schema version.
pub fn encode(record: &Record) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u8(record.type_tag());
    match record {
        Record::EventData(data) => put_event_data(&mut buf, data),
        Record::Event(event) => put_event(&mut buf, event),
        Record::EventTag(tag) => put_event_tag(&mut buf, tag),
    }
    buf.freeze()
}

/// Decode a record written with `schema_version`.
pub fn decode(bytes: &[u8], schema_version: u16) -> Result<Record, CodecError> {
    if schema_version == 0 || schema_version > CODEC_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: schema_version,
            supported: CODEC_VERSION,
        });
    }

    let mut dec = Decoder { buf: bytes };
    let record = match dec.u8()? {
        TAG_EVENT_DATA => Record::EventData(dec.event_data()?),
        TAG_EVENT => Record::Event(dec.event()?),
        TAG_EVENT_TAG => Record::EventTag(dec.event_tag()?),
        other => return Err(CodecError::UnknownRecordType(other)),
    };

    if !dec.buf.is_empty() {
        return Err(CodecError::TrailingBytes(dec.buf.len()));
    }
    Ok(record)
}

/// Deterministic encoding of an attribute map alone.
pub fn encode_attributes(attributes: &Attributes) -> Bytes {
    let mut buf = BytesMut::new();
    put_attributes(&mut buf, attributes);
    buf.freeze()
}

/// SHA-256 over the encoded attributes. Provenance is not part of the hash.
pub fn content_hash(data: &EventData) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(encode_attributes(&data.attributes));
    hasher.finalize().into()
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_attributes(buf: &mut BytesMut, attributes: &Attributes) {
    buf.put_u32(attributes.len() as u32);
    for (name, value) in attributes {
        put_string(buf, name);
        put_value(buf, value);
    }
}

fn put_value(buf: &mut BytesMut, value: &AttributeValue) {
    let mut payload = BytesMut::new();
    let kind = match value {
        AttributeValue::Null => KIND_NULL,
        AttributeValue::String(s) => {
            payload.put_slice(s.as_bytes());
            KIND_STRING
        }
        AttributeValue::Integer(v) => {
            payload.put_i64(*v);
            KIND_INTEGER
        }
        AttributeValue::Float(v) => {
            payload.put_u64(v.to_bits());
            KIND_FLOAT
        }
        AttributeValue::Boolean(v) => {
            payload.put_u8(u8::from(*v));
            KIND_BOOLEAN
        }
        AttributeValue::List(items) => {
            payload.put_u32(items.len() as u32);
            for item in items {
                put_value(&mut payload, item);
            }
            KIND_LIST
        }
        AttributeValue::Container(map) => {
            put_attributes(&mut payload, map);
            KIND_CONTAINER
        }
        AttributeValue::Opaque { kind, bytes } => {
            payload.put_slice(bytes);
            *kind
        }
    };
    buf.put_u8(kind);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
}

fn put_segment(buf: &mut BytesMut, segment: &SegmentId) {
    buf.put_slice(segment.as_bytes());
}

fn put_event_data(buf: &mut BytesMut, data: &EventData) {
    put_string(buf, &data.data_type);
    put_opt_string(buf, data.source.as_deref());
    put_attributes(buf, &data.attributes);
}

fn put_event(buf: &mut BytesMut, event: &Event) {
    buf.put_i64(event.timestamp.as_micros());
    put_string(buf, &event.timestamp_desc);
    put_segment(buf, &event.data.segment);
    buf.put_u64(event.data.sequence);
}

fn put_event_tag(buf: &mut BytesMut, tag: &EventTag) {
    put_segment(buf, &tag.event.segment);
    buf.put_u64(tag.event.sequence);
    buf.put_u32(tag.labels.len() as u32);
    for label in &tag.labels {
        put_string(buf, label);
    }
    put_opt_string(buf, tag.comment.as_deref());
}

struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn opt_string(&mut self) -> Result<Option<String>, CodecError> {
        match self.u8()? {
            0 => Ok(None),
            _ => self.string().map(Some),
        }
    }

    fn segment(&mut self) -> Result<SegmentId, CodecError> {
        let raw = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(SegmentId::from_bytes(bytes))
    }

    fn attributes(&mut self, depth: usize) -> Result<Attributes, CodecError> {
        if depth > MAX_NESTING {
            return Err(CodecError::TooDeep(MAX_NESTING));
        }
        let count = self.u32()?;
        let mut map = Attributes::new();
        for _ in 0..count {
            let name = self.string()?;
            let value = self.value(depth)?;
            map.insert(name, value);
        }
        Ok(map)
    }

    fn value(&mut self, depth: usize) -> Result<AttributeValue, CodecError> {
        let kind = self.u8()?;
        let len = self.u32()? as usize;
        let payload = self.take(len)?;
        let mut inner = Decoder { buf: payload };

        let value = match kind {
            KIND_STRING => AttributeValue::String(
                String::from_utf8(payload.to_vec()).map_err(|_| CodecError::InvalidUtf8)?,
            ),
            KIND_INTEGER => AttributeValue::Integer(inner.i64()?),
            KIND_FLOAT => AttributeValue::Float(f64::from_bits(inner.u64()?)),
            KIND_BOOLEAN => AttributeValue::Boolean(inner.u8()? != 0),
            KIND_LIST => {
                if depth >= MAX_NESTING {
                    return Err(CodecError::TooDeep(MAX_NESTING));
                }
                let count = inner.u32()?;
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(inner.value(depth + 1)?);
                }
                AttributeValue::List(items)
            }
            KIND_CONTAINER => AttributeValue::Container(inner.attributes(depth + 1)?),
            KIND_NULL => AttributeValue::Null,
            unknown => {
                return Ok(AttributeValue::Opaque {
                    kind: unknown,
                    bytes: payload.to_vec(),
                })
            }
        };

        if kind != KIND_STRING && !inner.buf.is_empty() {
            return Err(CodecError::TrailingBytes(inner.buf.len()));
        }
        Ok(value)
    }

    fn event_data(&mut self) -> Result<EventData, CodecError> {
        let data_type = self.string()?;
        let source = self.opt_string()?;
        let attributes = self.attributes(0)?;
        Ok(EventData {
            data_type,
            attributes,
            source,
        })
    }

    fn event(&mut self) -> Result<Event, CodecError> {
        let timestamp = Timestamp::from_micros(self.i64()?);
        let timestamp_desc = self.string()?;
        let segment = self.segment()?;
        let sequence = self.u64()?;
        Ok(Event {
            timestamp,
            timestamp_desc,
            data: DataIdentifier::new(segment, sequence),
        })
    }

    fn event_tag(&mut self) -> Result<EventTag, CodecError> {
        let segment = self.segment()?;
        let sequence = self.u64()?;
        let count = self.u32()?;
        let mut labels = Vec::new();
        for _ in 0..count {
            labels.push(self.string()?);
        }
        let comment = self.opt_string()?;
        Ok(EventTag {
            event: EventIdentifier::new(segment, sequence),
            labels,
            comment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_data() -> EventData {
        let mut nested = Attributes::new();
        nested.insert("hive".into(), AttributeValue::from("NTUSER.DAT"));
        EventData::new("windows:registry:run")
            .with_attribute("key_path", "HKCU\\Software\\Microsoft\\Windows\\CurrentVersion\\Run")
            .with_attribute("entries", vec![AttributeValue::from("evil.exe"), AttributeValue::Integer(3)])
            .with_attribute("size", 1.5f64)
            .with_attribute("deleted", false)
            .with_attribute("meta", AttributeValue::Container(nested))
            .with_source("/mnt/image/Users/x/NTUSER.DAT")
    }

    #[test]
    fn test_round_trip_all_record_types() {
        let seg = SegmentId::new();
        let mut tag = EventTag::new(EventIdentifier::new(seg, 7));
        tag.add_labels(["persistence", "malware"]);
        tag.comment = Some("autorun entry".into());

        let records = vec![
            Record::EventData(sample_data()),
            Record::Event(Event::new(
                Timestamp::from_micros(-42),
                "Last Written Time",
                DataIdentifier::new(seg, 0),
            )),
            Record::EventTag(tag),
        ];

        for record in records {
            let bytes = encode(&record);
            assert_eq!(decode(&bytes, CODEC_VERSION).unwrap(), record);
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = encode(&Record::EventData(sample_data()));
        let b = encode(&Record::EventData(sample_data()));
        assert_eq!(a, b);
        assert_eq!(content_hash(&sample_data()), content_hash(&sample_data()));
    }

    #[test]
    fn test_content_hash_ignores_provenance() {
        let a = sample_data();
        let b = sample_data().with_source("/elsewhere");
        assert_eq!(content_hash(&a), content_hash(&b));

        let c = sample_data().with_attribute("size", 2.0f64);
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn test_unknown_value_kind_preserved() {
        // A newer writer emitting a value kind 42 this build has never seen.
        let mut data = EventData::new("test:future");
        data.attributes.insert(
            "future".into(),
            AttributeValue::Opaque {
                kind: 42,
                bytes: vec![1, 2, 3, 4],
            },
        );
        data.attributes.insert("known".into(), AttributeValue::from("x"));

        let bytes = encode(&Record::EventData(data.clone()));
        let decoded = decode(&bytes, CODEC_VERSION).unwrap();
        assert_eq!(decoded, Record::EventData(data));
        assert_eq!(encode(&decoded), bytes);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode(&Record::EventData(sample_data()));
        for cut in [0, 1, 5, bytes.len() - 1] {
            let err = decode(&bytes[..cut], CODEC_VERSION).unwrap_err();
            assert!(matches!(err, CodecError::Truncated { .. }), "cut {cut}: {err:?}");
        }
    }

    #[test]
    fn test_unknown_record_type() {
        assert_eq!(
            decode(&[99, 0, 0], CODEC_VERSION).unwrap_err(),
            CodecError::UnknownRecordType(99)
        );
    }

    #[test]
    fn test_newer_schema_version_rejected() {
        let bytes = encode(&Record::EventData(sample_data()));
        assert_eq!(
            decode(&bytes, CODEC_VERSION + 1).unwrap_err(),
            CodecError::UnsupportedVersion {
                found: CODEC_VERSION + 1,
                supported: CODEC_VERSION
            }
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&Record::EventData(sample_data())).to_vec();
        bytes.push(0);
        assert_eq!(
            decode(&bytes, CODEC_VERSION).unwrap_err(),
            CodecError::TrailingBytes(1)
        );
    }

    fn leaf_value() -> impl Strategy<Value = AttributeValue> {
        prop_oneof![
            ".{0,16}".prop_map(AttributeValue::String),
            any::<i64>().prop_map(AttributeValue::Integer),
            (-1.0e12f64..1.0e12).prop_map(AttributeValue::Float),
            any::<bool>().prop_map(AttributeValue::Boolean),
            Just(AttributeValue::Null),
            (8u8..=255, proptest::collection::vec(any::<u8>(), 0..8))
                .prop_map(|(kind, bytes)| AttributeValue::Opaque { kind, bytes }),
        ]
    }

    fn any_value() -> impl Strategy<Value = AttributeValue> {
        leaf_value().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(AttributeValue::List),
                proptest::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(AttributeValue::Container),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_event_data_round_trip(
            data_type in "[a-z]{1,8}(:[a-z]{1,8}){0,3}",
            attributes in proptest::collection::btree_map("[a-z_]{1,12}", any_value(), 0..8),
            source in proptest::option::of(".{0,32}"),
        ) {
            let record = Record::EventData(EventData { data_type, attributes, source });
            let bytes = encode(&record);
            prop_assert_eq!(decode(&bytes, CODEC_VERSION).unwrap(), record);
        }
    }
}

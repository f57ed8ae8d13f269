//! Tag/label index: append-only annotations keyed by event identifier
//!
//! Tags live in their own file, never inside segments, so tagging never
//! rewrites event data. Every `add_tag` appends the complete new tag state
//! for an event together with a write sequence number; on read the record
//! with the highest write sequence wins.
//!
//! ```text
//! [magic "TLTAG"][version u8][codec version u16]
//! [len u32][crc32 u32][write_seq u64][encoded EventTag]   (len covers the last two)
//! ...
//! ```
//!
//! The CRC covers the length field and the body. A damaged frame is skipped
//! by scanning forward to the next intact one; only bytes with no intact
//! frame after them are treated as a torn tail.
//!
//! Writers serialise on an exclusive lock of `<file>.lock`; readers never lock
//! and pick up later writes with [`TagIndex::refresh`].

use crate::codec::{self, Record};
use crate::core::event::{EventIdentifier, EventTag, SegmentId};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use fs4::fs_std::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Magic number of a tag index file: "TLTAG"
pub const TAG_MAGIC: &[u8; 5] = b"TLTAG";

pub const TAG_FILE_VERSION: u8 = 2;

const TAG_HEADER_SIZE: u64 = 8;
const FRAME_HEAD: usize = 8;
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// A tag as stored, with the write sequence that ordered it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTag {
    pub write_seq: u64,
    pub tag: EventTag,
}

/// One `add_tag` request of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRequest {
    pub event: EventIdentifier,
    pub labels: Vec<String>,
    pub comment: Option<String>,
}

impl TagRequest {
    pub fn new<I, S>(event: EventIdentifier, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event,
            labels: labels.into_iter().map(Into::into).collect(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Labels are restricted to ASCII letters, digits and underscores.
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::InvalidTag("empty label".into()));
    }
    if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidTag(format!(
            "label {:?} may only contain letters, digits and '_'",
            label
        )));
    }
    Ok(())
}

/// Tag index backed by an append-only file
pub struct TagIndex {
    path: PathBuf,
    lock_path: PathBuf,
    codec_version: u16,
    tags: BTreeMap<EventIdentifier, StoredTag>,
    next_write_seq: u64,
    /// Offset up to which the file has been applied
    applied_to: u64,
    skipped_frames: u64,
}

impl TagIndex {
    /// Open the index at `path`, creating an empty one if needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = lock_path_for(&path);

        if !path.exists() {
            let lock = acquire_lock(&lock_path)?;
            // Another writer may have created it while we waited.
            if !path.exists() {
                let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
                let mut file = File::create(&tmp)?;
                file.write_all(TAG_MAGIC)?;
                file.write_all(&[TAG_FILE_VERSION])?;
                file.write_all(&codec::CODEC_VERSION.to_be_bytes())?;
                file.sync_all()?;
                std::fs::rename(&tmp, &path)?;
                info!(path = %path.display(), "Created tag index");
            }
            release_lock(lock)?;
        }

        let mut file = File::open(&path)?;
        let mut head = [0u8; TAG_HEADER_SIZE as usize];
        file.read_exact(&mut head)
            .map_err(|_| Error::corrupt(&path, "tag index header truncated"))?;
        if &head[0..5] != TAG_MAGIC || head[5] != TAG_FILE_VERSION {
            return Err(Error::corrupt(&path, "not a tag index file"));
        }
        let codec_version = u16::from_be_bytes([head[6], head[7]]);

        let mut index = Self {
            path,
            lock_path,
            codec_version,
            tags: BTreeMap::new(),
            next_write_seq: 0,
            applied_to: TAG_HEADER_SIZE,
            skipped_frames: 0,
        };
        index.refresh()?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply records appended since the last refresh.
    /// Returns how many records were applied.
    pub fn refresh(&mut self) -> Result<usize> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len <= self.applied_to {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(self.applied_to))?;
        let mut buf = Vec::with_capacity((len - self.applied_to) as usize);
        file.read_to_end(&mut buf)?;

        let mut applied = 0;
        let mut pos = 0usize;
        while buf.len() - pos >= FRAME_HEAD {
            let frame_len = match intact_frame(&buf[pos..]) {
                Some(frame_len) => frame_len,
                None => match (pos + 1..buf.len()).find(|&at| intact_frame(&buf[at..]).is_some()) {
                    Some(next) => {
                        warn!(
                            path = %self.path.display(),
                            offset = self.applied_to + pos as u64,
                            bytes = next - pos,
                            "Skipping damaged tag frame"
                        );
                        self.skipped_frames += 1;
                        pos = next;
                        continue;
                    }
                    // Torn tail, or a writer still appending.
                    None => break,
                },
            };

            let mut body = &buf[pos + FRAME_HEAD..pos + FRAME_HEAD + frame_len];
            pos += FRAME_HEAD + frame_len;

            let write_seq = body.get_u64();
            match codec::decode(body, self.codec_version) {
                Ok(Record::EventTag(tag)) => {
                    self.apply(StoredTag { write_seq, tag });
                    applied += 1;
                }
                Ok(_) => {
                    warn!(path = %self.path.display(), write_seq, "Non-tag record in tag index, skipping");
                    self.skipped_frames += 1;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), write_seq, error = %e, "Undecodable tag, skipping");
                    self.skipped_frames += 1;
                }
            }
        }

        self.applied_to += pos as u64;
        if applied > 0 {
            debug!(applied, total = self.tags.len(), "Refreshed tag index");
        }
        Ok(applied)
    }

    fn apply(&mut self, stored: StoredTag) {
        self.next_write_seq = self.next_write_seq.max(stored.write_seq + 1);
        let newer = self
            .tags
            .get(&stored.tag.event)
            .map_or(true, |current| stored.write_seq > current.write_seq);
        if newer {
            self.tags.insert(stored.tag.event, stored);
        }
    }

    /// Add labels (and optionally replace the comment) of one event
    pub fn add_tag<I, S>(&mut self, event: EventIdentifier, labels: I, comment: Option<String>) -> Result<EventTag>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut request = TagRequest::new(event, labels);
        request.comment = comment;
        let mut written = self.add_tags(vec![request])?;
        written
            .pop()
            .ok_or_else(|| Error::Registry("tag batch wrote nothing".into()))
    }

    /// Apply a batch of tag requests under one exclusive lock.
    ///
    /// Each request is merged into the event's current state: labels are
    /// added without duplicates and the comment is replaced only when given.
    pub fn add_tags(&mut self, requests: Vec<TagRequest>) -> Result<Vec<EventTag>> {
        for request in &requests {
            for label in &request.labels {
                validate_label(label)?;
            }
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let lock = acquire_lock(&self.lock_path)?;
        let result = self.append_locked(requests);
        release_lock(lock)?;
        result
    }

    fn append_locked(&mut self, requests: Vec<TagRequest>) -> Result<Vec<EventTag>> {
        self.refresh()?;

        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        let len = file.metadata()?.len();
        if len > self.applied_to {
            warn!(
                path = %self.path.display(),
                bytes = len - self.applied_to,
                "Truncating torn tag index tail"
            );
            file.set_len(self.applied_to)?;
        }

        let mut frames = BytesMut::new();
        let mut written = Vec::with_capacity(requests.len());
        let mut write_seq = self.next_write_seq;
        // Later requests in the batch see earlier ones.
        let mut staged: BTreeMap<EventIdentifier, EventTag> = BTreeMap::new();

        for request in requests {
            let mut tag = staged
                .get(&request.event)
                .cloned()
                .or_else(|| self.lookup(request.event).cloned())
                .unwrap_or_else(|| EventTag::new(request.event));
            tag.add_labels(request.labels);
            if request.comment.is_some() {
                tag.comment = request.comment;
            }

            let record = codec::encode(&Record::EventTag(tag.clone()));
            let mut body = BytesMut::with_capacity(8 + record.len());
            body.put_u64(write_seq);
            body.put_slice(&record);

            frames.put_u32(body.len() as u32);
            frames.put_u32(frame_crc(body.len() as u32, &body));
            frames.put_slice(&body);

            staged.insert(tag.event, tag.clone());
            written.push((write_seq, tag));
            write_seq += 1;
        }

        file.seek(SeekFrom::Start(self.applied_to))?;
        file.write_all(&frames)?;
        file.sync_data()?;
        self.applied_to += frames.len() as u64;

        let tags: Vec<EventTag> = written.iter().map(|(_, tag)| tag.clone()).collect();
        for (write_seq, tag) in written {
            self.apply(StoredTag { write_seq, tag });
        }
        debug!(count = tags.len(), "Appended tags");
        Ok(tags)
    }

    /// Latest tag state of an event
    pub fn lookup(&self, event: EventIdentifier) -> Option<&EventTag> {
        self.tags.get(&event).map(|stored| &stored.tag)
    }

    /// Latest tag state with its write sequence
    pub fn lookup_stored(&self, event: EventIdentifier) -> Option<&StoredTag> {
        self.tags.get(&event)
    }

    /// Latest tags of every event of one segment, by sequence
    pub fn all_tags_for_segment(&self, segment: SegmentId) -> impl Iterator<Item = &EventTag> + '_ {
        let start = EventIdentifier::new(segment, 0);
        let end = EventIdentifier::new(segment, u64::MAX);
        self.tags.range(start..=end).map(|(_, stored)| &stored.tag)
    }

    /// Every tagged event
    pub fn iter(&self) -> impl Iterator<Item = &EventTag> + '_ {
        self.tags.values().map(|stored| &stored.tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Frames skipped for checksum or decode errors
    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }
}

fn frame_crc(frame_len: u32, body: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(&frame_len.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Body length of the frame at the start of `buf`, if it is complete and
/// its checksum matches
fn intact_frame(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_HEAD {
        return None;
    }
    let mut head = &buf[..FRAME_HEAD];
    let frame_len = head.get_u32();
    let crc = head.get_u32();
    let len = frame_len as usize;
    if len < 8 || len > MAX_FRAME || buf.len() - FRAME_HEAD < len {
        return None;
    }
    (frame_crc(frame_len, &buf[FRAME_HEAD..FRAME_HEAD + len]) == crc).then_some(len)
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn acquire_lock(lock_path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)?;
    FileExt::lock_exclusive(&file)?;
    Ok(file)
}

fn release_lock(file: File) -> Result<()> {
    FileExt::unlock(&file)?;
    Ok(())
}

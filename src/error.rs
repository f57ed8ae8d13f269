//! Error types for Timeline-Store

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Timeline-Store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while encoding or decoding a single record.
///
/// These are always scoped to one record: a reader that hits one skips the
/// record (or truncates a torn tail) rather than failing the whole segment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the record was complete
    #[error("truncated record: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Record type tag not known to this reader
    #[error("unknown record type tag: {0}")]
    UnknownRecordType(u8),

    /// Record written by a newer codec than this reader supports
    #[error("unsupported schema version {found} (newest supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    /// A string field was not valid UTF-8
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Bytes left over after a complete record was decoded
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    /// Value nesting deeper than the codec accepts
    #[error("attribute nesting exceeds depth {0}")]
    TooDeep(usize),
}

/// Main error type for Timeline-Store
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unsupported record bytes
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Segment was never sealed (crashed or still-running writer)
    #[error("Segment not sealed: {}", path.display())]
    NotSealed { path: PathBuf },

    /// Segment index or trailer is unreadable or inconsistent with the data region
    #[error("Segment corrupt: {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Identifier lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Sealed data already exists where a writable segment was requested
    #[error("Sealed segment already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    /// Record rejected by the writer (e.g. cross-segment reference)
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Label rejected by the tag index
    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    /// Session registry misuse or inconsistent state
    #[error("Registry error: {0}")]
    Registry(String),

    /// Tasks still not terminal after waiting
    #[error("Session incomplete: {pending} task(s) not terminal")]
    SessionIncomplete { pending: usize },

    /// Merge had no readable segment at all
    #[error("No valid segments to merge ({excluded} excluded)")]
    NoValidSegments { excluded: usize },

    /// Task execution / worker communication errors
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    /// Serialization/deserialization errors (manifest, trailer, config)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors that disqualify one segment but not a whole merge.
    pub fn is_segment_level(&self) -> bool {
        matches!(
            self,
            Error::NotSealed { .. } | Error::Corrupt { .. } | Error::Codec(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::Registry(format!("lock poisoned: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Coordinator(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_level_classification() {
        let not_sealed = Error::NotSealed {
            path: PathBuf::from("a.seg"),
        };
        assert!(not_sealed.is_segment_level());
        assert!(Error::corrupt("a.seg", "bad trailer").is_segment_level());
        assert!(!Error::NoValidSegments { excluded: 2 }.is_segment_level());
        assert!(!Error::NotFound("x".into()).is_segment_level());
    }

    #[test]
    fn test_codec_error_converts() {
        let err: Error = CodecError::UnknownRecordType(9).into();
        assert!(matches!(err, Error::Codec(CodecError::UnknownRecordType(9))));
        assert!(err.to_string().contains("unknown record type tag: 9"));
    }
}

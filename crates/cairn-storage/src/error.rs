//! Storage error types.

use std::path::PathBuf;

use cairn_types::SegmentId;

/// Errors from the journal store and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying OS I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Error from the I/O backend.
    #[error(transparent)]
    Backend {
        #[from]
        source: cairn_io::IoError,
    },

    /// Opening one more segment would exceed the configured file count.
    #[error("segment count {count} exceeds configured maximum {max}")]
    SegmentLimitExceeded { count: usize, max: usize },

    /// A hash-index bucket has no free slot left.
    ///
    /// The index file has a fixed capacity; this is a sizing error, not a
    /// transient condition.
    #[error("hash index bucket {bucket} is full (file sized too small)")]
    BucketFull { bucket: u64 },

    /// A hash-index slot carries a state byte that is neither empty,
    /// occupied nor released.
    #[error("unknown slot state {byte:#04x} in hash index bucket {bucket}")]
    InvalidSlotState { byte: u8, bucket: u64 },

    /// An existing hash-index file does not match the configured capacity.
    #[error("hash index file {path} is {actual} bytes, expected {expected}")]
    IndexSizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// A record does not fit into a single container chunk.
    #[error("record of {len} bytes exceeds chunk capacity {capacity}")]
    RecordTooLarge { len: usize, capacity: u64 },

    /// An offset points outside the written part of a container or segment.
    #[error("offset {offset} is out of range (length {len})")]
    OffsetOutOfRange { offset: u64, len: u64 },

    /// An op record could not be decoded because the input is too short.
    #[error("truncated op record: got {actual} bytes, need {expected}")]
    TruncatedOpRecord { expected: usize, actual: usize },

    /// An op record carries an unknown operation byte.
    ///
    /// During replay this is a warn-and-skip condition; elsewhere it
    /// surfaces as an error.
    #[error("unknown op byte {byte:#04x}")]
    UnknownOpKind { byte: u8 },

    /// A store file is structurally damaged.
    #[error("corrupt store file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A segment failed the startup integrity validation.
    #[error("segment {segment} failed startup validation: {reason}")]
    StartupInconsistency { segment: SegmentId, reason: String },

    /// The background writer hit a fatal error; the store is dead and all
    /// subsequent calls fail fast.
    #[error("background writer failed: {reason}")]
    WriterFailed { reason: String },

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Checkpoint (de)serialization failed.
    #[error("checkpoint serialization failed: {source}")]
    Checkpoint {
        #[from]
        source: serde_json::Error,
    },
}

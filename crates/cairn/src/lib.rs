//! # Cairn
//!
//! Embedded, persistent key/value store for 16-byte fingerprint keys
//! (typically MD5 digests) with arbitrary byte-string values.
//!
//! Cairn keeps values in an append-only journal of fixed-size segment
//! pairs — a data file plus an op log per segment — indexed by an
//! in-memory map that can optionally spill to a durable hash index file.
//! A single background writer batches appends and amortizes fsyncs;
//! recovery replays the op logs bounded by a checkpoint; a background
//! compaction pass migrates long-lived values out of old segments so those
//! segments drain and get deleted.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                          Cairn                            │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────┐   │
//! │  │  Writer    │ → │ JournalStore │ → │   Compactor    │   │
//! │  │ (batching) │   │ (segments +  │   │ (age-based     │   │
//! │  │            │   │  index)      │   │  reclaim)      │   │
//! │  └────────────┘   └──────────────┘   └────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use cairn::{Cairn, CairnConfig};
//!
//! let store = Cairn::open(CairnConfig::new("./data", "blobs"))?;
//!
//! let key = md5::compute(b"hello").0; // any 16-byte fingerprint
//! store.add_sync(&key, b"world")?;
//! assert_eq!(store.get(&key)?.as_deref(), Some(&b"world"[..]));
//!
//! store.remove(&key)?;
//! store.close()?;
//! ```
//!
//! # Guarantees
//!
//! - A read after a returned write sees that write or a later one,
//!   whether or not it has reached disk yet.
//! - A returned `_sync` call implies durability of that op and every op
//!   submitted before it.
//! - After a clean close, reopening recovers exactly the closed state;
//!   after a crash, every `_sync`-acknowledged add is recovered.

mod cairn;
mod config;
mod error;

pub use cairn::Cairn;
pub use config::CairnConfig;
pub use error::{CairnError, Result};

// Re-export core types callers interact with.
pub use bytes::Bytes;
pub use cairn_types::{Fingerprint, FingerprintError, JournalLocation, OpKind, SegmentId};

// Re-export storage types for advanced usage.
pub use cairn_storage::{
    BucketIndex, ChunkContainer, CompactionConfig, CompactionResult, ConcurrentMemIndex, MemIndex,
    SegmentInfo, SpillMemIndex, StorageError,
};

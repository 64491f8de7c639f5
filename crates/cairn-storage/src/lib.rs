//! # cairn-storage: Journal Store Core
//!
//! The persistence engine behind Cairn: an append-only journal of numbered
//! segment pairs (data file + op log) with a durable hash index, a single
//! batching writer, checkpoint-bounded recovery and background compaction.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       JournalStore                        │
//! │  add / get / update / remove / keys / sync / check        │
//! │     │                │                   │                │
//! │     ▼                ▼                   ▼                │
//! │ ┌─────────┐   ┌────────────┐      ┌────────────┐          │
//! │ │ Writer  │   │  MemIndex  │      │ Checkpoint │          │
//! │ │(1 thread│   │ concurrent │      │ (position +│          │
//! │ │ batches)│   │  or spill  │      │ resume map)│          │
//! │ └────┬────┘   └─────┬──────┘      └────────────┘          │
//! │      ▼              ▼                                     │
//! │ ┌──────────────────────────┐   ┌─────────────────┐        │
//! │ │      SegmentRegistry     │   │   BucketIndex   │        │
//! │ │ name.1 name.1.log  ...   │   │ (mmap'd buckets)│        │
//! │ └──────────────────────────┘   └─────────────────┘        │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`ChunkContainer`] is a second, simpler persistence mode (offset-
//! addressed variable-length records in capacity-bounded chunk files),
//! exposed as an independent abstraction.
//!
//! # On-disk formats
//!
//! All binary formats are big-endian; the layouts live with their codecs
//! ([`op_record`], [`bucket_index`], [`segment`], [`chunk`]).

mod bucket_index;
mod checkpoint;
mod chunk;
mod compaction;
mod error;
mod mem_index;
mod op_record;
mod segment;
mod spill_cache;
mod store;
mod writer;

pub use bucket_index::{BUCKET_BYTES, BucketIndex, SLOT_BYTES, SLOTS_PER_BUCKET};
pub use chunk::{ChunkContainer, MIN_CHUNK_CAPACITY, RecordIter};
pub use compaction::{CompactionConfig, CompactionResult};
pub use error::StorageError;
pub use mem_index::{ConcurrentMemIndex, MemIndex, SpillMemIndex};
pub use op_record::{OP_RECORD_BYTES, OpRecord};
pub use store::{
    DEFAULT_BUCKET_COUNT, DEFAULT_CACHE_CAPACITY, DEFAULT_FILE_SIZE, DEFAULT_MAX_FILE_COUNT,
    JournalStore, SegmentInfo, StoreOptions,
};
pub use writer::DEFAULT_MAX_BATCH_SIZE;

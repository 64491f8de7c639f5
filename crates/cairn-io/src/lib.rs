//! # cairn-io: I/O Backend Abstraction for Cairn
//!
//! This crate provides a trait-based abstraction over file I/O operations,
//! enabling the journal layer to use different I/O strategies:
//!
//! - **`SyncBackend`** (default): Standard `std::fs` operations with
//!   optional `O_SYNC` on unix for stores opened in `force` (durable
//!   write) mode
//!
//! The storage layer only ever sees [`IoBackend`]: positional reads for
//! concurrent readers, append writes for the single writer thread, and
//! explicit fsync for batch durability boundaries.

mod backend;
mod error;
mod sync_backend;

pub use backend::{FileHandle, IoBackend, OpenFlags};
pub use error::IoError;
pub use sync_backend::SyncBackend;

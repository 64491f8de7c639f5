//! Pluggable in-memory index: key → latest live ADD record.
//!
//! The journal store consults this index on every read and mutation. Two
//! implementations satisfy the same [`MemIndex`] capability:
//!
//! - [`ConcurrentMemIndex`] — everything in RAM behind an `RwLock`.
//! - [`SpillMemIndex`] — a [`SpillCache`] behind a `Mutex`: a bounded
//!   resident set that demotes cold entries to a file-backed
//!   [`BucketIndex`], for stores whose key population outgrows memory.
//!   The spill file is scratch space: recovery rebuilds the index from
//!   the journal, so the file is recreated empty at every open.
//!
//! [`SpillCache`]: crate::spill_cache::SpillCache

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};

use cairn_types::Fingerprint;

use crate::StorageError;
use crate::bucket_index::BucketIndex;
use crate::op_record::OpRecord;
use crate::spill_cache::SpillCache;

/// Capability contract for the in-memory index.
///
/// Implementations are internally synchronized; the store shares one
/// instance across all caller threads.
pub trait MemIndex: Send + Sync {
    /// Returns the live record for `key`.
    fn get(&self, key: &Fingerprint) -> Result<Option<OpRecord>, StorageError>;

    /// Inserts or replaces the record for `key`, returning the previous one.
    fn put(&self, key: Fingerprint, record: OpRecord) -> Result<Option<OpRecord>, StorageError>;

    /// Removes the record for `key`, returning it.
    fn remove(&self, key: &Fingerprint) -> Result<Option<OpRecord>, StorageError>;

    /// Bulk-loads entries during recovery.
    fn put_all(&self, entries: Vec<(Fingerprint, OpRecord)>) -> Result<(), StorageError>;

    /// Returns a snapshot of all live keys.
    fn keys(&self) -> Result<Vec<Fingerprint>, StorageError>;

    /// Number of live entries.
    fn len(&self) -> usize;

    /// Returns `true` if the index holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forces any file-backed state to disk.
    fn flush(&self) -> Result<(), StorageError>;

    /// Releases file-backed resources.
    fn close(&self) -> Result<(), StorageError>;
}

/// Fully in-memory index variant.
#[derive(Debug, Default)]
pub struct ConcurrentMemIndex {
    map: RwLock<HashMap<Fingerprint, OpRecord>>,
}

impl ConcurrentMemIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemIndex for ConcurrentMemIndex {
    fn get(&self, key: &Fingerprint) -> Result<Option<OpRecord>, StorageError> {
        Ok(self.map.read().expect("index lock poisoned").get(key).copied())
    }

    fn put(&self, key: Fingerprint, record: OpRecord) -> Result<Option<OpRecord>, StorageError> {
        Ok(self
            .map
            .write()
            .expect("index lock poisoned")
            .insert(key, record))
    }

    fn remove(&self, key: &Fingerprint) -> Result<Option<OpRecord>, StorageError> {
        Ok(self.map.write().expect("index lock poisoned").remove(key))
    }

    fn put_all(&self, entries: Vec<(Fingerprint, OpRecord)>) -> Result<(), StorageError> {
        self.map
            .write()
            .expect("index lock poisoned")
            .extend(entries);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<Fingerprint>, StorageError> {
        Ok(self
            .map
            .read()
            .expect("index lock poisoned")
            .keys()
            .copied()
            .collect())
    }

    fn len(&self) -> usize {
        self.map.read().expect("index lock poisoned").len()
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.map.write().expect("index lock poisoned").clear();
        Ok(())
    }
}

/// Cache-plus-spill index variant.
///
/// The promotion/demotion and single-homing rules live in [`SpillCache`];
/// this type contributes the lock that also guards the spill file (the
/// file-backed hash index is not thread-safe on its own).
pub struct SpillMemIndex {
    inner: Mutex<SpillCache>,
}

impl SpillMemIndex {
    /// Creates a spill index over a freshly opened [`BucketIndex`].
    pub fn new(cache_capacity: usize, spill: BucketIndex) -> Self {
        Self {
            inner: Mutex::new(SpillCache::new(cache_capacity, spill)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpillCache> {
        self.inner.lock().expect("index lock poisoned")
    }
}

impl MemIndex for SpillMemIndex {
    fn get(&self, key: &Fingerprint) -> Result<Option<OpRecord>, StorageError> {
        self.lock().get(key)
    }

    fn put(&self, key: Fingerprint, record: OpRecord) -> Result<Option<OpRecord>, StorageError> {
        self.lock().put(key, record)
    }

    fn remove(&self, key: &Fingerprint) -> Result<Option<OpRecord>, StorageError> {
        self.lock().remove(key)
    }

    fn put_all(&self, entries: Vec<(Fingerprint, OpRecord)>) -> Result<(), StorageError> {
        let mut cache = self.lock();
        for (key, record) in entries {
            cache.put(key, record)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<Fingerprint>, StorageError> {
        self.lock().keys()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.lock().flush()
    }

    fn close(&self) -> Result<(), StorageError> {
        self.lock().close()
    }
}

//! Main entry point for embedding Cairn.
//!
//! [`Cairn`] wraps the journal store with key validation, the background
//! compaction scheduler, and a close-on-drop guarantee. Keys arrive as
//! plain byte slices and are validated into [`Fingerprint`]s at the
//! boundary; everything below works with the typed key.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;

use cairn_storage::{CompactionResult, JournalStore, SegmentInfo};
use cairn_types::{Fingerprint, JournalLocation};

use crate::config::CairnConfig;
use crate::error::Result;

/// Embedded journal-backed key/value store for 16-byte fingerprint keys.
///
/// All methods are callable from any thread. Writes return as soon as they
/// are queued; the `_sync` variants block until the op is on disk.
/// Dropping the handle closes the store, but an explicit [`Cairn::close`]
/// surfaces shutdown errors instead of logging them.
pub struct Cairn {
    store: Arc<JournalStore>,
    compactor: Mutex<Option<Compactor>>,
}

impl Cairn {
    /// Opens (or creates) a store, running recovery and starting the
    /// writer and compaction threads.
    pub fn open(config: CairnConfig) -> Result<Self> {
        let check_interval = config.check_interval;
        let store = Arc::new(JournalStore::open(config.store_options())?);
        let compactor = Compactor::spawn(store.clone(), check_interval);
        Ok(Self {
            store,
            compactor: Mutex::new(Some(compactor)),
        })
    }

    fn fingerprint(key: &[u8]) -> Result<Fingerprint> {
        Ok(Fingerprint::from_slice(key)?)
    }

    /// Adds (or overwrites) the value for `key` without waiting for disk.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let key = Self::fingerprint(key)?;
        self.store
            .add(key, Bytes::copy_from_slice(value), false)?;
        Ok(())
    }

    /// Adds the value for `key` and blocks until it is durable.
    pub fn add_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let key = Self::fingerprint(key)?;
        self.store.add(key, Bytes::copy_from_slice(value), true)?;
        Ok(())
    }

    /// Returns the value for `key`, or `None` if absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let key = Self::fingerprint(key)?;
        Ok(self.store.get(&key)?)
    }

    /// Replaces the value for an existing key; returns `false` if absent.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let key = Self::fingerprint(key)?;
        Ok(self.store.update(key, Bytes::copy_from_slice(value))?)
    }

    /// Removes `key` without waiting for disk; returns whether it existed.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let key = Self::fingerprint(key)?;
        Ok(self.store.remove(&key, false)?)
    }

    /// Removes `key` and blocks until the removal is durable.
    pub fn remove_sync(&self, key: &[u8]) -> Result<bool> {
        let key = Self::fingerprint(key)?;
        Ok(self.store.remove(&key, true)?)
    }

    /// Iterates a snapshot of the live keys.
    ///
    /// The snapshot is taken when this is called; concurrent mutations are
    /// not reflected and removal through the iterator is not supported.
    pub fn iter_keys(&self) -> Result<std::vec::IntoIter<Fingerprint>> {
        Ok(self.store.keys()?.into_iter())
    }

    /// Number of live keys.
    pub fn size(&self) -> usize {
        self.store.size()
    }

    /// Blocks until everything submitted so far is durable.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()?;
        Ok(())
    }

    /// Runs one compaction pass right now (the background thread runs the
    /// same pass on its own schedule).
    pub fn check(&self) -> Result<CompactionResult> {
        Ok(self.store.check()?)
    }

    /// Stops the background threads, flushes and closes the store.
    pub fn close(&self) -> Result<()> {
        if let Some(compactor) = self
            .compactor
            .lock()
            .expect("compactor lock poisoned")
            .take()
        {
            compactor.stop();
        }
        self.store.close()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Observability surface
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Per-segment file and refcount information.
    pub fn segments_info(&self) -> Vec<SegmentInfo> {
        self.store.segments_info()
    }

    /// Information about the appendable segment.
    pub fn active_segment_info(&self) -> Option<SegmentInfo> {
        self.store.active_segment_info()
    }

    /// Every live key with its value's location.
    pub fn index_dump(&self) -> Result<Vec<(Fingerprint, JournalLocation)>> {
        Ok(self.store.index_dump()?)
    }

    pub fn interval_for_compact(&self) -> Duration {
        self.store.interval_for_compact()
    }

    pub fn set_interval_for_compact(&self, interval: Duration) {
        self.store.set_interval_for_compact(interval);
    }

    pub fn interval_for_remove(&self) -> Duration {
        self.store.interval_for_remove()
    }

    pub fn set_interval_for_remove(&self, interval: Duration) {
        self.store.set_interval_for_remove(interval);
    }

    pub fn max_file_count(&self) -> usize {
        self.store.max_file_count()
    }

    pub fn set_max_file_count(&self, max: usize) {
        self.store.set_max_file_count(max);
    }
}

impl Drop for Cairn {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "failed to close store during drop");
        }
    }
}

impl std::fmt::Debug for Cairn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cairn")
            .field("name", &self.name())
            .field("path", &self.path())
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

/// Background compaction scheduler.
///
/// Wakes every `check_interval`, runs [`JournalStore::check`], and stops
/// promptly when signalled.
struct Compactor {
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Compactor {
    fn spawn(store: Arc<JournalStore>, check_interval: Duration) -> Self {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name("cairn-compactor".to_string())
            .spawn(move || {
                let (lock, condvar) = &*thread_signal;
                loop {
                    let stopped = lock.lock().expect("compactor lock poisoned");
                    let (stopped, timeout) = condvar
                        .wait_timeout(stopped, check_interval)
                        .expect("compactor lock poisoned");
                    if *stopped {
                        break;
                    }
                    if timeout.timed_out() {
                        drop(stopped);
                        match store.check() {
                            Ok(result) => tracing::debug!(
                                removed = result.removed,
                                migrated = result.migrated,
                                "scheduled compaction pass finished"
                            ),
                            Err(e) => {
                                tracing::error!(error = %e, "scheduled compaction pass failed");
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn compactor thread");

        Self {
            signal,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        let (lock, condvar) = &*self.signal;
        *lock.lock().expect("compactor lock poisoned") = true;
        condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

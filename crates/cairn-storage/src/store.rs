//! The journal store coordinator.
//!
//! [`JournalStore`] ties the subsystems together: the segment registry,
//! the background writer, the pluggable in-memory index, the last-modified
//! map and the checkpoint. It owns the public add/get/update/remove
//! contract, startup recovery, and the compaction pass.
//!
//! # Recovery
//!
//! Opening a store lists the numbered data files, seeds the index from the
//! checkpoint's resume map, and replays each segment's log from the
//! checkpoint position onward. Replay is self-correcting: a second live
//! ADD for a key found in a later segment is a dangling update (a crash
//! hit between an update's ADD and its paired DEL) and is healed by
//! writing the missing DEL now. Segments that reached the size limit and
//! drained to refcount zero are deleted; every surviving non-terminal
//! segment must be full and used, otherwise the store refuses to start.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use cairn_io::{IoBackend, SyncBackend};
use cairn_types::{Fingerprint, JournalLocation, OpKind, SegmentId};

use crate::StorageError;
use crate::bucket_index::BucketIndex;
use crate::checkpoint::Checkpoint;
use crate::compaction::{CompactionConfig, CompactionResult};
use crate::mem_index::{ConcurrentMemIndex, MemIndex, SpillMemIndex};
use crate::op_record::{OP_RECORD_BYTES, OpRecord};
use crate::segment::{Segment, SegmentRegistry};
use crate::writer::{DEFAULT_MAX_BATCH_SIZE, JournalWriter};

/// Default data-file size limit before rollover (64 MiB).
pub const DEFAULT_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Default cap on the number of segment files.
pub const DEFAULT_MAX_FILE_COUNT: usize = 1024;

/// Default entry capacity of the spill index's in-memory cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 64 * 1024;

/// Default bucket count of the spill index file (32 MiB, ~1.1M slots).
pub const DEFAULT_BUCKET_COUNT: usize = 8192;

const CHECKPOINT_FILENAME: &str = "checkpoint";
const INDEX_CACHE_SUFFIX: &str = "_indexCache";

/// Configuration consumed by [`JournalStore::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Directory holding the store's files.
    pub dir: PathBuf,
    /// Store name; file names derive from it (`{name}.N`, `{name}.N.log`).
    pub name: String,
    /// Open data and log files with synchronous writes (`O_SYNC`).
    pub force: bool,
    /// Use the bounded-cache index that spills cold entries to a
    /// file-backed hash index instead of keeping everything in RAM.
    pub index_lru: bool,
    /// Verify every recovered index entry against its data file at open.
    pub data_file_check: bool,
    /// Upper bound on live segment files.
    pub max_file_count: usize,
    /// Data-file size limit before rollover.
    pub file_size: u64,
    /// Cap on value bytes per writer batch.
    pub max_batch_size: usize,
    /// Entry capacity of the spill index's in-memory cache.
    pub cache_capacity: usize,
    /// Bucket count of the spill index file.
    pub bucket_count: usize,
    /// Compaction thresholds.
    pub compaction: CompactionConfig,
}

impl StoreOptions {
    /// Options with production defaults.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            force: false,
            index_lru: false,
            data_file_check: false,
            max_file_count: DEFAULT_MAX_FILE_COUNT,
            file_size: DEFAULT_FILE_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            bucket_count: DEFAULT_BUCKET_COUNT,
            compaction: CompactionConfig::default(),
        }
    }
}

/// Read-only description of one segment, for the observability surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: SegmentId,
    pub data_len: u64,
    pub log_len: u64,
    pub ref_count: i64,
    pub active: bool,
}

/// Milliseconds since the epoch.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The persistent key/value journal store.
pub struct JournalStore {
    name: String,
    dir: PathBuf,
    file_size: u64,
    registry: Arc<SegmentRegistry>,
    writer: JournalWriter,
    index: Box<dyn MemIndex>,
    /// Key → millis of original insertion, preserved across compaction.
    last_modified: RwLock<HashMap<Fingerprint, u64>>,
    checkpoint: Mutex<Checkpoint>,
    checkpoint_path: PathBuf,
    /// Serial of the segment the last op landed in, for rollover detection.
    last_active: AtomicU32,
    closed: AtomicBool,
    interval_for_compact: AtomicU64,
    interval_for_remove: AtomicU64,
}

impl JournalStore {
    /// Opens the store, running recovery and starting the writer.
    pub fn open(options: StoreOptions) -> Result<Self, StorageError> {
        fs::create_dir_all(&options.dir)?;
        let io: Arc<dyn IoBackend> = Arc::new(SyncBackend::new());
        let registry = Arc::new(SegmentRegistry::new(
            options.dir.clone(),
            options.name.clone(),
            options.force,
            options.file_size,
            options.max_file_count,
            io,
        ));

        // The spill file is scratch: the index is rebuilt from the journal
        // below, so any previous content is stale by construction.
        let index: Box<dyn MemIndex> = if options.index_lru {
            let spill_path = options
                .dir
                .join(format!("{}{INDEX_CACHE_SUFFIX}", options.name));
            let spill = BucketIndex::create_fresh(spill_path, options.bucket_count)?;
            Box::new(SpillMemIndex::new(options.cache_capacity, spill))
        } else {
            Box::new(ConcurrentMemIndex::new())
        };

        let checkpoint_path = options.dir.join(CHECKPOINT_FILENAME);
        let recovered = recover(&registry, &checkpoint_path, options.data_file_check)?;

        let active = match registry.active() {
            Some(active) => active,
            None => registry.create_segment(SegmentId::FIRST)?,
        };

        let mut checkpoint = Checkpoint::cold();
        for (key, record) in &recovered.entries {
            checkpoint.record_add(*key, record.location());
        }
        checkpoint.set_position(active.id(), active.log_len());
        if let Err(e) = checkpoint.save(&checkpoint_path) {
            tracing::warn!(error = %e, "failed to persist checkpoint after recovery");
        }

        let entry_count = recovered.entries.len();
        index.put_all(recovered.entries.into_iter().collect())?;

        let writer = JournalWriter::spawn(
            registry.clone(),
            active.clone(),
            options.force,
            options.file_size,
            options.max_batch_size,
        )?;

        tracing::info!(
            name = %options.name,
            segments = registry.len(),
            entries = entry_count,
            "journal store opened"
        );

        Ok(Self {
            name: options.name,
            dir: options.dir,
            file_size: options.file_size,
            registry,
            writer,
            index,
            last_modified: RwLock::new(recovered.last_modified),
            checkpoint: Mutex::new(checkpoint),
            checkpoint_path,
            last_active: AtomicU32::new(active.id().as_u32()),
            closed: AtomicBool::new(false),
            interval_for_compact: AtomicU64::new(
                options.compaction.interval_for_compact.as_millis() as u64,
            ),
            interval_for_remove: AtomicU64::new(
                options.compaction.interval_for_remove.as_millis() as u64,
            ),
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Adds (or overwrites) the value for `key`.
    ///
    /// With `sync`, blocks until the op is durable. A second add for an
    /// existing key is legal: the index moves on and the orphaned old
    /// record is reclaimed at the next recovery.
    pub fn add(&self, key: Fingerprint, value: Bytes, sync: bool) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.inner_add(key, value, sync, None)?;
        Ok(())
    }

    fn inner_add(
        &self,
        key: Fingerprint,
        value: Bytes,
        sync: bool,
        preserve_modified: Option<u64>,
    ) -> Result<OpRecord, StorageError> {
        let record = self.writer.store(key, value, sync)?;
        self.last_modified
            .write()
            .expect("store lock poisoned")
            .insert(key, preserve_modified.unwrap_or_else(now_millis));
        self.index.put(key, record)?;
        self.checkpoint
            .lock()
            .expect("store lock poisoned")
            .record_add(key, record.location());
        // React to a rollover only once the key is in the resume map: the
        // checkpoint persisted at the boundary points past this op's log
        // entry, so a map without the key would lose it on crash.
        self.note_rollover(record.segment());
        Ok(record)
    }

    /// Returns the value for `key`, serving not-yet-durable writes from
    /// the writer's in-flight buffer.
    pub fn get(&self, key: &Fingerprint) -> Result<Option<Bytes>, StorageError> {
        self.ensure_open()?;
        // The index is authoritative for liveness — a removed key must
        // read as absent even while its ADD still sits in the writer
        // queue. The in-flight map only sources bytes that have not
        // reached the data file yet.
        let Some(record) = self.index.get(key)? else {
            return Ok(None);
        };
        if let Some(bytes) = self.writer.in_flight(key) {
            return Ok(Some(bytes));
        }
        let Some(segment) = self.registry.get(record.segment()) else {
            // The segment is gone; the index entry is stale. Heal it.
            tracing::warn!(key = %key, segment = %record.segment(), "dropping index entry for missing segment");
            self.forget(key)?;
            return Ok(None);
        };
        let value = segment.read_value(record.offset())?;
        Ok(Some(Bytes::from(value)))
    }

    /// Replaces the value for an existing key.
    ///
    /// Returns `false` (without writing anything) when the key is absent.
    /// The old record is cancelled: by a DEL when it lives in another
    /// segment, by a bare refcount decrement when the new record landed
    /// beside it.
    pub fn update(&self, key: Fingerprint, value: Bytes) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let Some(previous) = self.index.get(&key)? else {
            return Ok(false);
        };
        let record = self.inner_add(key, value, false, None)?;
        self.retire(previous, record, false)?;
        Ok(true)
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &Fingerprint, sync: bool) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let Some(record) = self.index.remove(key)? else {
            return Ok(false);
        };
        self.last_modified
            .write()
            .expect("store lock poisoned")
            .remove(key);
        self.checkpoint
            .lock()
            .expect("store lock poisoned")
            .record_remove(key);
        if let Some(segment) = self.registry.get(record.segment()) {
            self.writer.remove(record, sync)?;
            self.maybe_delete_segment(&segment);
        }
        Ok(true)
    }

    /// Re-adds a key's current value into the active segment, preserving
    /// its original last-modified time.
    ///
    /// This is the compaction migration step: live records leave
    /// nearly-empty old segments so those drain to refcount zero. Records
    /// already in the active segment are left alone.
    pub fn reuse(&self, key: &Fingerprint) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let Some(previous) = self.index.get(key)? else {
            return Ok(false);
        };
        let active_id = self.registry.active().map(|segment| segment.id());
        if Some(previous.segment()) == active_id {
            return Ok(false);
        }
        let Some(value) = self.get(key)? else {
            return Ok(false);
        };
        let original = self
            .last_modified
            .read()
            .expect("store lock poisoned")
            .get(key)
            .copied();
        let record = self.inner_add(*key, value, true, original)?;
        self.retire(previous, record, true)?;
        Ok(true)
    }

    /// Cancels a replaced record after its successor has been written.
    fn retire(
        &self,
        previous: OpRecord,
        replacement: OpRecord,
        sync: bool,
    ) -> Result<(), StorageError> {
        if replacement.segment() == previous.segment() {
            // Same segment: fold the DEL into a refcount decrement; replay
            // dedupes the two ADDs.
            if let Some(segment) = self.registry.get(previous.segment()) {
                segment.decrement();
            }
        } else {
            self.writer.remove(previous, sync)?;
            if let Some(segment) = self.registry.get(previous.segment()) {
                self.maybe_delete_segment(&segment);
            }
        }
        Ok(())
    }

    /// Drops a key from index, last-modified map and checkpoint.
    fn forget(&self, key: &Fingerprint) -> Result<(), StorageError> {
        self.index.remove(key)?;
        self.last_modified
            .write()
            .expect("store lock poisoned")
            .remove(key);
        self.checkpoint
            .lock()
            .expect("store lock poisoned")
            .record_remove(key);
        Ok(())
    }

    /// Deletes a finalized segment the moment it drains.
    fn maybe_delete_segment(&self, segment: &Arc<Segment>) {
        let active_id = self.registry.active().map(|active| active.id());
        if Some(segment.id()) == active_id {
            return;
        }
        if segment.data_len() >= self.file_size && segment.is_unused() {
            // A DEL for this segment may still sit in the writer queue;
            // it lands in the unlinked file and vanishes with it.
            if let Err(e) = self.registry.remove(segment.id()) {
                tracing::error!(segment = %segment.id(), error = %e, "failed to delete drained segment");
            }
        }
    }

    /// Reacts to an op landing in a new segment: reap anything the
    /// finalized segment left behind and persist the checkpoint at the
    /// boundary.
    fn note_rollover(&self, segment: SegmentId) {
        let current = segment.as_u32();
        let previous = self.last_active.swap(current, Ordering::AcqRel);
        if previous != current {
            // A segment can drain to zero while still active; now that it
            // rolled it must not linger full and empty.
            let active_id = self.registry.active().map(|active| active.id());
            for candidate in self.registry.all() {
                if Some(candidate.id()) != active_id
                    && candidate.data_len() >= self.file_size
                    && candidate.is_unused()
                {
                    if let Err(e) = self.registry.remove(candidate.id()) {
                        tracing::error!(segment = %candidate.id(), error = %e, "failed to delete drained segment");
                    }
                }
            }
            if let Err(e) = self.persist_checkpoint() {
                tracing::warn!(error = %e, "failed to persist checkpoint after rollover");
            }
        }
    }

    /// Syncs the writer, then writes the checkpoint file.
    ///
    /// The sync first: the persisted position must never run ahead of
    /// durable log bytes.
    fn persist_checkpoint(&self) -> Result<(), StorageError> {
        self.writer.sync()?;
        self.persist_checkpoint_synced()
    }

    fn persist_checkpoint_synced(&self) -> Result<(), StorageError> {
        let active = self.registry.active();
        let mut checkpoint = self.checkpoint.lock().expect("store lock poisoned");
        if let Some(active) = active {
            checkpoint.set_position(active.id(), active.log_len());
        }
        checkpoint.save(&self.checkpoint_path)
    }

    /// Snapshot of the live keys.
    pub fn keys(&self) -> Result<Vec<Fingerprint>, StorageError> {
        self.ensure_open()?;
        self.index.keys()
    }

    /// Number of live keys.
    pub fn size(&self) -> usize {
        self.index.len()
    }

    /// Blocks until everything submitted so far is durable.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.writer.sync()
    }

    /// One compaction pass over every live key.
    ///
    /// Keys older than `interval_for_remove` are removed; keys older than
    /// `interval_for_compact` are migrated into the active segment.
    pub fn check(&self) -> Result<CompactionResult, StorageError> {
        self.ensure_open()?;
        let now = now_millis();
        let compact_after = self.interval_for_compact.load(Ordering::Acquire);
        let remove_after = self.interval_for_remove.load(Ordering::Acquire);

        let mut result = CompactionResult::default();
        for key in self.index.keys()? {
            result.examined += 1;
            let Some(modified) = self
                .last_modified
                .read()
                .expect("store lock poisoned")
                .get(&key)
                .copied()
            else {
                continue;
            };
            let age = now.saturating_sub(modified);
            if age > remove_after {
                if self.remove(&key, true)? {
                    result.removed += 1;
                }
            } else if age > compact_after && self.reuse(&key)? {
                result.migrated += 1;
            }
        }

        if let Err(e) = self.persist_checkpoint() {
            tracing::warn!(error = %e, "failed to persist checkpoint after compaction");
        }
        tracing::info!(
            examined = result.examined,
            removed = result.removed,
            migrated = result.migrated,
            "compaction pass finished"
        );
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Observability surface
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Per-segment file and refcount information.
    pub fn segments_info(&self) -> Vec<SegmentInfo> {
        let active_id = self.registry.active().map(|segment| segment.id());
        self.registry
            .all()
            .into_iter()
            .map(|segment| SegmentInfo {
                id: segment.id(),
                data_len: segment.data_len(),
                log_len: segment.log_len(),
                ref_count: segment.ref_count(),
                active: Some(segment.id()) == active_id,
            })
            .collect()
    }

    /// Information about the appendable segment.
    pub fn active_segment_info(&self) -> Option<SegmentInfo> {
        self.segments_info().into_iter().find(|info| info.active)
    }

    /// Every live key with its value's location.
    pub fn index_dump(&self) -> Result<Vec<(Fingerprint, JournalLocation)>, StorageError> {
        let mut dump = Vec::with_capacity(self.index.len());
        for key in self.index.keys()? {
            if let Some(record) = self.index.get(&key)? {
                dump.push((key, record.location()));
            }
        }
        Ok(dump)
    }

    pub fn interval_for_compact(&self) -> Duration {
        Duration::from_millis(self.interval_for_compact.load(Ordering::Acquire))
    }

    pub fn set_interval_for_compact(&self, interval: Duration) {
        self.interval_for_compact
            .store(interval.as_millis() as u64, Ordering::Release);
    }

    pub fn interval_for_remove(&self) -> Duration {
        Duration::from_millis(self.interval_for_remove.load(Ordering::Acquire))
    }

    pub fn set_interval_for_remove(&self, interval: Duration) {
        self.interval_for_remove
            .store(interval.as_millis() as u64, Ordering::Release);
    }

    pub fn max_file_count(&self) -> usize {
        self.registry.max_file_count()
    }

    pub fn set_max_file_count(&self, max: usize) {
        self.registry.set_max_file_count(max);
    }

    /// Syncs, stops the writer, persists the checkpoint and releases every
    /// file. Idempotent.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.writer.sync() {
            tracing::error!(error = %e, "final sync failed during close");
        }
        self.writer.shutdown();
        if let Err(e) = self.persist_checkpoint_synced() {
            tracing::error!(error = %e, "failed to persist checkpoint during close");
        }
        if let Err(e) = self.index.close() {
            tracing::error!(error = %e, "failed to close index");
        }
        self.registry.clear();
        tracing::info!(name = %self.name, "journal store closed");
        Ok(())
    }
}

impl Drop for JournalStore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                tracing::error!(error = %e, "failed to close store during drop");
            }
        }
    }
}

impl std::fmt::Debug for JournalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalStore")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("size", &self.size())
            .field("segments", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------
// Recovery
// ----------------------------------------------------------------------

struct Recovered {
    entries: HashMap<Fingerprint, OpRecord>,
    last_modified: HashMap<Fingerprint, u64>,
}

fn recover(
    registry: &SegmentRegistry,
    checkpoint_path: &Path,
    data_file_check: bool,
) -> Result<Recovered, StorageError> {
    let ids = registry.scan()?;
    let mut checkpoint = Checkpoint::load(checkpoint_path).unwrap_or_else(Checkpoint::cold);

    // A checkpoint pointing past the journal on disk is meaningless.
    let highest = ids.last().copied();
    if checkpoint.segment.as_u32() > 0 && highest.is_none_or(|h| checkpoint.segment > h) {
        tracing::warn!(
            checkpoint_segment = %checkpoint.segment,
            "checkpoint is ahead of the journal, cold start"
        );
        checkpoint = Checkpoint::cold();
    }

    // Seed the global index from the resume map.
    let mut global: HashMap<Fingerprint, OpRecord> = HashMap::new();
    for (key, location) in &checkpoint.entries {
        if ids.binary_search(&location.segment).is_ok() {
            global.insert(
                *key,
                OpRecord::new(OpKind::Add, *key, location.segment, location.offset),
            );
        } else {
            tracing::warn!(key = %key, segment = %location.segment, "dropping resume entry for missing segment");
        }
    }

    let mut healed: Vec<Arc<Segment>> = Vec::new();

    for id in ids {
        let segment = registry.open_segment(id)?;

        if id < checkpoint.segment {
            // Trusted prefix: the resume map is the segment's live set.
            let refs = global
                .values()
                .filter(|record| record.segment() == id)
                .count() as i64;
            segment.set_ref_count(refs);
            continue;
        }

        let start = if id == checkpoint.segment {
            checkpoint.log_offset
        } else {
            0
        };
        replay_segment(registry, &segment, start, &mut global, &mut healed)?;

        if segment.data_len() >= registry.file_size() && segment.is_unused() {
            global.retain(|_, record| record.segment() != id);
            registry.remove(id)?;
        }
    }

    if data_file_check {
        check_data_files(registry, &mut global, &mut healed)?;
    }

    // Heals can drain a full segment registered earlier in the scan.
    let active_id = registry.active().map(|segment| segment.id());
    for segment in registry.all() {
        if Some(segment.id()) != active_id
            && segment.data_len() >= registry.file_size()
            && segment.is_unused()
        {
            registry.remove(segment.id())?;
        }
    }

    // Make the healing DELs durable before trusting the recovered state.
    let mut synced = std::collections::BTreeSet::new();
    for segment in healed {
        if registry.get(segment.id()).is_some() && synced.insert(segment.id()) {
            segment.sync_log()?;
        }
    }

    validate(registry)?;

    // Log mtimes seed the last-modified map for everything recovered.
    let mut mtimes: HashMap<SegmentId, u64> = HashMap::new();
    let mut last_modified = HashMap::with_capacity(global.len());
    for (key, record) in &global {
        let mtime = *mtimes.entry(record.segment()).or_insert_with(|| {
            registry
                .get(record.segment())
                .map_or(0, |segment| segment.log_mtime_millis())
        });
        last_modified.insert(*key, mtime);
    }

    Ok(Recovered {
        entries: global,
        last_modified,
    })
}

fn replay_segment(
    registry: &SegmentRegistry,
    segment: &Arc<Segment>,
    start: u64,
    global: &mut HashMap<Fingerprint, OpRecord>,
    healed: &mut Vec<Arc<Segment>>,
) -> Result<(), StorageError> {
    let id = segment.id();

    // Local view of this segment's live ADDs, seeded from resume-map
    // entries already attributed to it (only the checkpoint segment can
    // have any).
    let mut local: HashMap<Fingerprint, u64> = global
        .iter()
        .filter(|(_, record)| record.segment() == id)
        .map(|(key, record)| (*key, record.offset()))
        .collect();
    let mut refs = local.len() as i64;

    let log = segment.read_log()?;
    let usable = (log.len() / OP_RECORD_BYTES) * OP_RECORD_BYTES;
    if usable < log.len() {
        tracing::warn!(
            segment = %id,
            torn_bytes = log.len() - usable,
            "cutting torn tail off log"
        );
        segment.truncate_log(usable as u64)?;
    }

    let mut pos = start as usize;
    while pos + OP_RECORD_BYTES <= usable {
        let record = match OpRecord::from_bytes(&log[pos..]) {
            Ok(record) => record,
            Err(StorageError::UnknownOpKind { byte }) => {
                tracing::warn!(segment = %id, offset = pos, byte, "skipping unknown op in log");
                pos += OP_RECORD_BYTES;
                continue;
            }
            Err(e) => return Err(e),
        };
        pos += OP_RECORD_BYTES;

        match record.kind() {
            OpKind::Add => match global.get(&record.key()).copied() {
                Some(previous) if previous.location() == record.location() => {
                    // The resume-map seed for this very entry.
                }
                Some(previous) if previous.segment() == id => {
                    // Same-segment re-add: an update whose DEL was folded
                    // into a refcount decrement. Replace, don't recount.
                    local.insert(record.key(), record.offset());
                    global.insert(record.key(), record);
                }
                Some(previous) => {
                    // Dangling update: a crash hit between this ADD and
                    // the DEL of the older record. Write the DEL now.
                    tracing::warn!(
                        key = %record.key(),
                        old = %previous.location(),
                        new = %record.location(),
                        "healing dangling update"
                    );
                    if let Some(old_segment) = registry.get(previous.segment()) {
                        old_segment.append_log(&previous.cancelling().to_bytes())?;
                        old_segment.decrement();
                        healed.push(old_segment);
                    }
                    if local.insert(record.key(), record.offset()).is_none() {
                        refs += 1;
                    }
                    global.insert(record.key(), record);
                }
                None => {
                    if local.insert(record.key(), record.offset()).is_none() {
                        refs += 1;
                    }
                    global.insert(record.key(), record);
                }
            },
            OpKind::Del => {
                local.remove(&record.key());
                refs -= 1;
                if global
                    .get(&record.key())
                    .is_some_and(|live| live.location() == record.location())
                {
                    global.remove(&record.key());
                }
            }
        }
    }

    segment.set_ref_count(refs);
    Ok(())
}

/// Verifies every recovered entry's value record header; entries that do
/// not check out are healed away.
fn check_data_files(
    registry: &SegmentRegistry,
    global: &mut HashMap<Fingerprint, OpRecord>,
    healed: &mut Vec<Arc<Segment>>,
) -> Result<(), StorageError> {
    let mut bad: Vec<Fingerprint> = Vec::new();
    for (key, record) in global.iter() {
        let ok = registry
            .get(record.segment())
            .is_some_and(|segment| segment.check_value(record.offset()).unwrap_or(false));
        if !ok {
            bad.push(*key);
        }
    }
    for key in bad {
        if let Some(record) = global.remove(&key) {
            tracing::warn!(
                key = %key,
                location = %record.location(),
                "data file check failed, dropping entry"
            );
            if let Some(segment) = registry.get(record.segment()) {
                segment.append_log(&record.cancelling().to_bytes())?;
                segment.decrement();
                healed.push(segment);
            }
        }
    }
    Ok(())
}

/// Every registered segment except the terminal one must be full and used.
fn validate(registry: &SegmentRegistry) -> Result<(), StorageError> {
    let all = registry.all();
    let Some((_, rest)) = all.split_last() else {
        return Ok(());
    };
    for segment in rest {
        if segment.data_len() < registry.file_size() {
            return Err(StorageError::StartupInconsistency {
                segment: segment.id(),
                reason: format!(
                    "non-terminal segment is only {} bytes (limit {})",
                    segment.data_len(),
                    registry.file_size()
                ),
            });
        }
        if segment.is_unused() {
            return Err(StorageError::StartupInconsistency {
                segment: segment.id(),
                reason: "non-terminal segment holds no live records".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cairn_io::SyncBackend;

    use crate::segment::value_frame;

    use super::*;

    fn key(byte: u8) -> Fingerprint {
        Fingerprint::new([byte; 16])
    }

    fn options(dir: &Path) -> StoreOptions {
        StoreOptions::new(dir, "store")
    }

    fn small_options(dir: &Path) -> StoreOptions {
        let mut options = options(dir);
        options.file_size = 256;
        options
    }

    #[test]
    fn add_get_remove_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(options(dir.path())).unwrap();

        store
            .add(key(1), Bytes::from_static(b"world"), false)
            .unwrap();
        store.sync().unwrap();
        assert_eq!(store.get(&key(1)).unwrap().unwrap(), "world");
        assert_eq!(store.size(), 1);

        assert!(store.remove(&key(1), true).unwrap());
        assert_eq!(store.get(&key(1)).unwrap(), None);
        assert_eq!(store.size(), 0);
        assert!(!store.remove(&key(1), true).unwrap());

        store.close().unwrap();
    }

    #[test]
    fn get_sees_unsynced_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(options(dir.path())).unwrap();

        store
            .add(key(1), Bytes::from_static(b"pending"), false)
            .unwrap();
        // Whether the batch has flushed yet or not, the value is visible.
        assert_eq!(store.get(&key(1)).unwrap().unwrap(), "pending");
        store.close().unwrap();
    }

    #[test]
    fn removed_key_is_invisible_while_its_add_is_still_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(options(dir.path())).unwrap();

        // Neither the queued ADD's in-flight bytes nor the flushed record
        // may resurrect a removed key.
        store
            .add(key(1), Bytes::from_static(b"ghost"), false)
            .unwrap();
        assert!(store.remove(&key(1), false).unwrap());
        assert_eq!(store.get(&key(1)).unwrap(), None);
        assert_eq!(store.size(), 0);

        store.sync().unwrap();
        assert_eq!(store.get(&key(1)).unwrap(), None);
        store.close().unwrap();
    }

    #[test]
    fn update_replaces_value_without_changing_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(options(dir.path())).unwrap();

        assert!(!store.update(key(1), Bytes::from_static(b"v1")).unwrap());
        store.add(key(1), Bytes::from_static(b"v1"), true).unwrap();
        assert!(store.update(key(1), Bytes::from_static(b"v2")).unwrap());
        store.sync().unwrap();

        assert_eq!(store.get(&key(1)).unwrap().unwrap(), "v2");
        assert_eq!(store.size(), 1);

        // Same-segment update folds the DEL into a refcount decrement:
        // two ADDs live in the log, one reference survives.
        let info = store.active_segment_info().unwrap();
        assert_eq!(info.ref_count, 1);
        assert_eq!(info.log_len, 2 * OP_RECORD_BYTES as u64);

        store.close().unwrap();
    }

    #[test]
    fn close_and_reopen_recovers_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JournalStore::open(options(dir.path())).unwrap();
            for i in 0..50u8 {
                store.add(key(i), Bytes::from(vec![i; 32]), false).unwrap();
            }
            store.remove(&key(7), false).unwrap();
            store.update(key(8), Bytes::from_static(b"fresh")).unwrap();
            store.close().unwrap();
        }

        let store = JournalStore::open(options(dir.path())).unwrap();
        assert_eq!(store.size(), 49);
        assert_eq!(store.get(&key(7)).unwrap(), None);
        assert_eq!(store.get(&key(8)).unwrap().unwrap(), "fresh");
        assert_eq!(store.get(&key(42)).unwrap().unwrap(), vec![42u8; 32]);
        store.close().unwrap();
    }

    #[test]
    fn recovery_without_checkpoint_replays_logs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JournalStore::open(options(dir.path())).unwrap();
            for i in 0..20u8 {
                store.add(key(i), Bytes::from(vec![i; 16]), false).unwrap();
            }
            store.remove(&key(3), false).unwrap();
            store.close().unwrap();
        }
        fs::remove_file(dir.path().join("checkpoint")).unwrap();

        let store = JournalStore::open(options(dir.path())).unwrap();
        assert_eq!(store.size(), 19);
        assert_eq!(store.get(&key(3)).unwrap(), None);
        assert_eq!(store.get(&key(19)).unwrap().unwrap(), vec![19u8; 16]);
        store.close().unwrap();
    }

    #[test]
    fn rollover_spreads_keys_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(small_options(dir.path())).unwrap();

        for i in 0..40u8 {
            store.add(key(i), Bytes::from(vec![i; 20]), false).unwrap();
        }
        store.sync().unwrap();

        assert!(store.segments_info().len() >= 2);
        for i in 0..40u8 {
            assert_eq!(store.get(&key(i)).unwrap().unwrap(), vec![i; 20], "key {i}");
        }
        store.close().unwrap();
    }

    #[test]
    fn crash_after_rollover_recovers_first_key_of_new_segment() {
        let dir = tempfile::tempdir().unwrap();
        let count;
        {
            let store = JournalStore::open(small_options(dir.path())).unwrap();
            // Add synced keys until one lands in segment 2; the rollover
            // persists a checkpoint pointing past that key's log entry,
            // so its resume map must already carry the key.
            let mut i = 0u8;
            while store.segments_info().len() < 2 {
                store.add(key(i), Bytes::from(vec![i; 20]), true).unwrap();
                i += 1;
            }
            count = usize::from(i);
            // Crash: no close, the rollover checkpoint is the last word.
            std::mem::forget(store);
        }

        let store = JournalStore::open(small_options(dir.path())).unwrap();
        assert_eq!(store.size(), count);
        // The record that opened segment 2 survived.
        assert!(
            store
                .index_dump()
                .unwrap()
                .iter()
                .any(|(_, location)| location.segment == SegmentId::new(2)
                    && location.offset == 0)
        );
        for i in 0..count as u8 {
            assert_eq!(store.get(&key(i)).unwrap().unwrap(), vec![i; 20], "key {i}");
        }
        store.close().unwrap();
    }

    #[test]
    fn draining_a_full_segment_deletes_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(small_options(dir.path())).unwrap();

        // Fill past one segment so segment 1 is finalized.
        for i in 0..20u8 {
            store.add(key(i), Bytes::from(vec![i; 20]), false).unwrap();
        }
        store.sync().unwrap();
        let infos = store.segments_info();
        assert!(infos.len() >= 2);
        let first = &infos[0];
        assert!(first.data_len >= 256);

        let keys_in_first: Vec<Fingerprint> = store
            .index_dump()
            .unwrap()
            .into_iter()
            .filter(|(_, location)| location.segment == first.id)
            .map(|(key, _)| key)
            .collect();
        assert!(!keys_in_first.is_empty());
        for key in &keys_in_first {
            assert!(store.remove(key, true).unwrap());
        }

        let remaining: Vec<SegmentId> = store
            .segments_info()
            .into_iter()
            .map(|info| info.id)
            .collect();
        assert!(!remaining.contains(&first.id));
        assert!(!dir.path().join("store.1").exists());
        assert!(!dir.path().join("store.1.log").exists());
        store.close().unwrap();
    }

    #[test]
    fn recovery_heals_dangling_update() {
        let dir = tempfile::tempdir().unwrap();
        let file_size = 64;
        // Hand-craft the crash remnant: segment 1 (full) holds the old
        // revision with its ADD; segment 2 holds the new revision's ADD
        // but no DEL ever made it to segment 1's log.
        {
            let registry = SegmentRegistry::new(
                dir.path().to_path_buf(),
                "store".to_string(),
                false,
                file_size,
                64,
                Arc::new(SyncBackend::new()),
            );
            let first = registry.create_segment(SegmentId::new(1)).unwrap();
            let offset = first.append_data(&value_frame(&[1u8; 60])).unwrap();
            first
                .append_log(&OpRecord::new(OpKind::Add, key(1), SegmentId::new(1), offset).to_bytes())
                .unwrap();
            assert!(first.data_len() >= file_size);

            let second = registry.create_segment(SegmentId::new(2)).unwrap();
            let offset = second.append_data(&value_frame(b"new revision")).unwrap();
            second
                .append_log(
                    &OpRecord::new(OpKind::Add, key(1), SegmentId::new(2), offset).to_bytes(),
                )
                .unwrap();
        }

        let mut options = options(dir.path());
        options.file_size = file_size;
        let store = JournalStore::open(options).unwrap();

        // The old record was healed away and its drained segment deleted.
        assert_eq!(store.size(), 1);
        assert_eq!(store.get(&key(1)).unwrap().unwrap(), "new revision");
        assert!(!dir.path().join("store.1").exists());
        assert_eq!(store.segments_info().len(), 1);
        store.close().unwrap();
    }

    #[test]
    fn startup_rejects_underfull_middle_segment() {
        let dir = tempfile::tempdir().unwrap();
        let file_size = 1024;
        {
            let registry = SegmentRegistry::new(
                dir.path().to_path_buf(),
                "store".to_string(),
                false,
                file_size,
                64,
                Arc::new(SyncBackend::new()),
            );
            // Segment 1 holds a live record but never filled up.
            let first = registry.create_segment(SegmentId::new(1)).unwrap();
            let offset = first.append_data(&value_frame(b"stranded")).unwrap();
            first
                .append_log(&OpRecord::new(OpKind::Add, key(1), SegmentId::new(1), offset).to_bytes())
                .unwrap();
            let second = registry.create_segment(SegmentId::new(2)).unwrap();
            let offset = second.append_data(&value_frame(b"tail")).unwrap();
            second
                .append_log(
                    &OpRecord::new(OpKind::Add, key(2), SegmentId::new(2), offset).to_bytes(),
                )
                .unwrap();
        }

        let mut options = options(dir.path());
        options.file_size = file_size;
        let err = JournalStore::open(options).unwrap_err();
        assert!(matches!(
            err,
            StorageError::StartupInconsistency { segment, .. } if segment == SegmentId::new(1)
        ));
    }

    #[test]
    fn torn_log_tail_is_cut_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JournalStore::open(options(dir.path())).unwrap();
            store.add(key(1), Bytes::from_static(b"kept"), true).unwrap();
            store.close().unwrap();
        }
        // Simulate a torn write: a partial op record at the log tail.
        let log_path = dir.path().join("store.1.log");
        let mut raw = fs::read(&log_path).unwrap();
        raw.extend_from_slice(&[0xaa; 11]);
        fs::write(&log_path, &raw).unwrap();
        fs::remove_file(dir.path().join("checkpoint")).unwrap();

        let store = JournalStore::open(options(dir.path())).unwrap();
        assert_eq!(store.size(), 1);
        assert_eq!(store.get(&key(1)).unwrap().unwrap(), "kept");
        assert_eq!(fs::metadata(&log_path).unwrap().len() % OP_RECORD_BYTES as u64, 0);
        store.close().unwrap();
    }

    #[test]
    fn unknown_op_bytes_are_skipped_in_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JournalStore::open(options(dir.path())).unwrap();
            store.add(key(1), Bytes::from_static(b"one"), true).unwrap();
            store.add(key(2), Bytes::from_static(b"two"), true).unwrap();
            store.close().unwrap();
        }
        // Corrupt the first log entry's op byte.
        let log_path = dir.path().join("store.1.log");
        let mut raw = fs::read(&log_path).unwrap();
        raw[0] = 0x6f;
        fs::write(&log_path, &raw).unwrap();
        fs::remove_file(dir.path().join("checkpoint")).unwrap();

        let store = JournalStore::open(options(dir.path())).unwrap();
        assert_eq!(store.size(), 1);
        assert_eq!(store.get(&key(2)).unwrap().unwrap(), "two");
        store.close().unwrap();
    }

    #[test]
    fn spill_index_variant_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(dir.path());
        options.index_lru = true;
        options.cache_capacity = 4;
        options.bucket_count = 8;

        {
            let store = JournalStore::open(options.clone()).unwrap();
            for i in 0..64u8 {
                store.add(key(i), Bytes::from(vec![i; 24]), false).unwrap();
            }
            store.sync().unwrap();
            assert_eq!(store.size(), 64);
            for i in 0..64u8 {
                assert_eq!(store.get(&key(i)).unwrap().unwrap(), vec![i; 24]);
            }
            store.close().unwrap();
        }

        let store = JournalStore::open(options).unwrap();
        assert_eq!(store.size(), 64);
        assert_eq!(store.get(&key(63)).unwrap().unwrap(), vec![63u8; 24]);
        store.close().unwrap();
    }

    #[test]
    fn data_file_check_heals_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JournalStore::open(options(dir.path())).unwrap();
            store.add(key(1), Bytes::from_static(b"sane"), true).unwrap();
            store.close().unwrap();
        }
        // Forge a log entry pointing past the end of the data file.
        let log_path = dir.path().join("store.1.log");
        let mut raw = fs::read(&log_path).unwrap();
        raw.extend_from_slice(
            &OpRecord::new(OpKind::Add, key(2), SegmentId::new(1), 9_999).to_bytes(),
        );
        fs::write(&log_path, &raw).unwrap();
        fs::remove_file(dir.path().join("checkpoint")).unwrap();

        let mut options = options(dir.path());
        options.data_file_check = true;
        let store = JournalStore::open(options).unwrap();
        assert_eq!(store.size(), 1);
        assert_eq!(store.get(&key(1)).unwrap().unwrap(), "sane");
        assert_eq!(store.get(&key(2)).unwrap(), None);
        store.close().unwrap();
    }

    #[test]
    fn closed_store_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(options(dir.path())).unwrap();
        store.close().unwrap();

        assert!(matches!(
            store.add(key(1), Bytes::from_static(b"x"), false),
            Err(StorageError::Closed)
        ));
        assert!(matches!(store.get(&key(1)), Err(StorageError::Closed)));
        assert!(store.close().is_ok());
    }
}

//! Segment pairs and the segment registry.
//!
//! A segment is one numbered data file (`{name}.N`) holding value records
//! plus one log file (`{name}.N.log`) holding fixed-size op records. The
//! data file starts with an 8-byte reserved capacity header; value records
//! are `length:u32 | bytes` (big-endian) and op-record offsets are relative
//! to the data-file *body* (the byte after the header).
//!
//! Each segment carries a reference count: +1 per live ADD in its log, −1
//! per DEL in its log. DELs are appended to the log of the segment that
//! holds the record being deleted, so every log is self-contained and a
//! segment whose data file reached the size limit becomes deletable the
//! moment its refcount drains to zero.
//!
//! The [`SegmentRegistry`] is the narrow capability shared between the
//! coordinator and the writer: naming, lookup, rollover and removal —
//! nothing else.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use cairn_io::{FileHandle, IoBackend, OpenFlags};
use cairn_types::SegmentId;

use crate::StorageError;

/// Reserved header at the start of every data file (big-endian capacity).
pub const DATA_HEADER_BYTES: u64 = 8;

/// Size of the `length` prefix framing each value record.
pub const VALUE_LEN_BYTES: usize = 4;

/// Builds the `length | bytes` frame for a value record.
pub(crate) fn value_frame(value: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(VALUE_LEN_BYTES + value.len());
    frame.extend_from_slice(&(value.len() as u32).to_be_bytes());
    frame.extend_from_slice(value);
    frame
}

/// One data/log file pair.
pub(crate) struct Segment {
    id: SegmentId,
    data_path: PathBuf,
    log_path: PathBuf,
    io: Arc<dyn IoBackend>,
    /// Writer appends take the write lock; positional reads share the read
    /// lock.
    data: RwLock<FileHandle>,
    log: Mutex<FileHandle>,
    /// Whole-file length including the 8-byte header.
    data_len: AtomicU64,
    log_len: AtomicU64,
    /// Live ADDs minus DELs recorded in this segment's log.
    refs: AtomicI64,
}

impl Segment {
    /// Opens (or creates) the segment's file pair.
    ///
    /// A brand-new data file gets its capacity header written immediately;
    /// an existing data file shorter than the header is corrupt.
    pub(crate) fn open(
        io: Arc<dyn IoBackend>,
        id: SegmentId,
        data_path: PathBuf,
        log_path: PathBuf,
        force: bool,
        capacity: u64,
    ) -> Result<Self, StorageError> {
        let mut data = io.open(&data_path, OpenFlags::append_create(force))?;
        let mut data_len = io.file_size(&data)?;
        if data_len == 0 {
            io.write(&mut data, &capacity.to_be_bytes())?;
            data_len = DATA_HEADER_BYTES;
        } else if data_len < DATA_HEADER_BYTES {
            return Err(StorageError::Corrupt {
                path: data_path,
                reason: format!("data file is {data_len} bytes, shorter than its header"),
            });
        }

        let log = io.open(&log_path, OpenFlags::append_create(force))?;
        let log_len = io.file_size(&log)?;

        Ok(Self {
            id,
            data_path,
            log_path,
            io,
            data: RwLock::new(data),
            log: Mutex::new(log),
            data_len: AtomicU64::new(data_len),
            log_len: AtomicU64::new(log_len),
            refs: AtomicI64::new(0),
        })
    }

    pub(crate) fn id(&self) -> SegmentId {
        self.id
    }

    /// Data file length in bytes, header included.
    pub(crate) fn data_len(&self) -> u64 {
        self.data_len.load(Ordering::Acquire)
    }

    /// Log file length in bytes.
    pub(crate) fn log_len(&self) -> u64 {
        self.log_len.load(Ordering::Acquire)
    }

    pub(crate) fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub(crate) fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Appends a pre-framed batch to the data file, returning the body
    /// offset at which it begins.
    pub(crate) fn append_data(&self, buf: &[u8]) -> Result<u64, StorageError> {
        let mut handle = self.data.write().expect("segment lock poisoned");
        self.io.write(&mut handle, buf)?;
        let previous = self.data_len.fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(previous - DATA_HEADER_BYTES)
    }

    /// Appends encoded op records to the log file, returning the log offset
    /// at which they begin.
    pub(crate) fn append_log(&self, buf: &[u8]) -> Result<u64, StorageError> {
        let mut handle = self.log.lock().expect("segment lock poisoned");
        self.io.write(&mut handle, buf)?;
        Ok(self.log_len.fetch_add(buf.len() as u64, Ordering::AcqRel))
    }

    /// Reads the value record at the given body offset.
    pub(crate) fn read_value(&self, body_offset: u64) -> Result<Vec<u8>, StorageError> {
        let data_len = self.data_len();
        let pos = DATA_HEADER_BYTES + body_offset;
        if pos + VALUE_LEN_BYTES as u64 > data_len {
            return Err(StorageError::OffsetOutOfRange {
                offset: body_offset,
                len: data_len - DATA_HEADER_BYTES,
            });
        }

        let handle = self.data.read().expect("segment lock poisoned");
        let mut len_buf = [0u8; VALUE_LEN_BYTES];
        self.io.read_exact_at(&handle, pos, &mut len_buf)?;
        let value_len = u64::from(u32::from_be_bytes(len_buf));

        if pos + VALUE_LEN_BYTES as u64 + value_len > data_len {
            return Err(StorageError::Corrupt {
                path: self.data_path.clone(),
                reason: format!(
                    "value record at body offset {body_offset} claims {value_len} bytes past end of file"
                ),
            });
        }

        let mut value = vec![0u8; value_len as usize];
        self.io
            .read_exact_at(&handle, pos + VALUE_LEN_BYTES as u64, &mut value)?;
        Ok(value)
    }

    /// Verifies that a plausible value record starts at the given body
    /// offset, without reading the value itself.
    pub(crate) fn check_value(&self, body_offset: u64) -> Result<bool, StorageError> {
        let data_len = self.data_len();
        let pos = DATA_HEADER_BYTES + body_offset;
        if pos + VALUE_LEN_BYTES as u64 > data_len {
            return Ok(false);
        }
        let handle = self.data.read().expect("segment lock poisoned");
        let mut len_buf = [0u8; VALUE_LEN_BYTES];
        self.io.read_exact_at(&handle, pos, &mut len_buf)?;
        let value_len = u64::from(u32::from_be_bytes(len_buf));
        Ok(pos + VALUE_LEN_BYTES as u64 + value_len <= data_len)
    }

    /// Reads the entire log file (replay path).
    pub(crate) fn read_log(&self) -> Result<Bytes, StorageError> {
        Ok(self.io.read_all(&self.log_path)?)
    }

    /// Cuts a torn tail off the log file.
    pub(crate) fn truncate_log(&self, len: u64) -> Result<(), StorageError> {
        let handle = self.log.lock().expect("segment lock poisoned");
        self.io.set_len(&handle, len)?;
        self.log_len.store(len, Ordering::Release);
        Ok(())
    }

    pub(crate) fn sync_data(&self) -> Result<(), StorageError> {
        let handle = self.data.read().expect("segment lock poisoned");
        self.io.fsync(&handle)?;
        Ok(())
    }

    pub(crate) fn sync_log(&self) -> Result<(), StorageError> {
        let handle = self.log.lock().expect("segment lock poisoned");
        self.io.fsync(&handle)?;
        Ok(())
    }

    pub(crate) fn increment(&self) -> i64 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn decrement(&self) -> i64 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn set_ref_count(&self, refs: i64) {
        self.refs.store(refs, Ordering::Release);
    }

    pub(crate) fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    /// A segment with no live ADDs left.
    pub(crate) fn is_unused(&self) -> bool {
        self.ref_count() <= 0
    }

    /// Modification time of the log file in millis since the epoch.
    ///
    /// Used to seed last-modified times during recovery; falls back to 0
    /// when the platform withholds mtimes.
    pub(crate) fn log_mtime_millis(&self) -> u64 {
        fs::metadata(&self.log_path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |age| age.as_millis() as u64)
    }

    /// Unlinks both files.
    pub(crate) fn delete(&self) -> Result<(), StorageError> {
        fs::remove_file(&self.data_path)?;
        fs::remove_file(&self.log_path)?;
        tracing::info!(segment = %self.id, "deleted drained segment");
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("data_len", &self.data_len())
            .field("log_len", &self.log_len())
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}

/// Owns the live segment set and the file naming scheme.
///
/// Shared between the coordinator and the writer so the writer can roll
/// segments without holding a back-reference to the whole store.
pub(crate) struct SegmentRegistry {
    dir: PathBuf,
    name: String,
    force: bool,
    file_size: u64,
    max_file_count: AtomicUsize,
    io: Arc<dyn IoBackend>,
    segments: RwLock<BTreeMap<SegmentId, Arc<Segment>>>,
}

impl SegmentRegistry {
    pub(crate) fn new(
        dir: PathBuf,
        name: String,
        force: bool,
        file_size: u64,
        max_file_count: usize,
        io: Arc<dyn IoBackend>,
    ) -> Self {
        Self {
            dir,
            name,
            force,
            file_size,
            max_file_count: AtomicUsize::new(max_file_count),
            io,
            segments: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn data_path(&self, id: SegmentId) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, id.as_u32()))
    }

    pub(crate) fn log_path(&self, id: SegmentId) -> PathBuf {
        self.dir.join(format!("{}.{}.log", self.name, id.as_u32()))
    }

    /// Lists the segment serials present on disk, ascending.
    ///
    /// Matches `{name}.N` exactly; `.log` files fail the numeric-suffix
    /// parse and fall out naturally.
    pub(crate) fn scan(&self) -> Result<Vec<SegmentId>, StorageError> {
        let prefix = format!("{}.", self.name);
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(suffix) = file_name.strip_prefix(&prefix) {
                if let Ok(serial) = suffix.parse::<u32>() {
                    ids.push(SegmentId::new(serial));
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<SegmentId, Arc<Segment>>> {
        self.segments.write().expect("registry lock poisoned")
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<SegmentId, Arc<Segment>>> {
        self.segments.read().expect("registry lock poisoned")
    }

    /// Opens an existing segment from disk and registers it.
    pub(crate) fn open_segment(&self, id: SegmentId) -> Result<Arc<Segment>, StorageError> {
        let segment = Arc::new(Segment::open(
            self.io.clone(),
            id,
            self.data_path(id),
            self.log_path(id),
            self.force,
            self.file_size,
        )?);
        self.lock_write().insert(id, segment.clone());
        Ok(segment)
    }

    /// Creates and registers a fresh segment, enforcing `max_file_count`.
    pub(crate) fn create_segment(&self, id: SegmentId) -> Result<Arc<Segment>, StorageError> {
        let max = self.max_file_count.load(Ordering::Acquire);
        let count = self.lock_read().len();
        if count + 1 > max {
            return Err(StorageError::SegmentLimitExceeded {
                count: count + 1,
                max,
            });
        }
        self.open_segment(id)
    }

    /// Rolls to the next segment and returns it.
    pub(crate) fn roll(&self) -> Result<Arc<Segment>, StorageError> {
        let next = self
            .active()
            .map_or(SegmentId::FIRST, |active| active.id().next());
        let segment = self.create_segment(next)?;
        tracing::info!(segment = %next, "rolled to new segment");
        Ok(segment)
    }

    pub(crate) fn get(&self, id: SegmentId) -> Option<Arc<Segment>> {
        self.lock_read().get(&id).cloned()
    }

    /// The highest-numbered (appendable) segment.
    pub(crate) fn active(&self) -> Option<Arc<Segment>> {
        self.lock_read()
            .last_key_value()
            .map(|(_, segment)| segment.clone())
    }

    /// Deregisters a segment and unlinks its files.
    pub(crate) fn remove(&self, id: SegmentId) -> Result<(), StorageError> {
        let segment = self.lock_write().remove(&id);
        if let Some(segment) = segment {
            segment.delete()?;
        }
        Ok(())
    }

    /// Deregisters a segment without touching its files.
    pub(crate) fn deregister(&self, id: SegmentId) {
        self.lock_write().remove(&id);
    }

    /// All registered segments, ascending by serial.
    pub(crate) fn all(&self) -> Vec<Arc<Segment>> {
        self.lock_read().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock_read().len()
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn max_file_count(&self) -> usize {
        self.max_file_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_file_count(&self, max: usize) {
        self.max_file_count.store(max, Ordering::Release);
    }

    /// Drops every segment handle. Files stay on disk.
    pub(crate) fn clear(&self) {
        self.lock_write().clear();
    }
}

#[cfg(test)]
mod tests {
    use cairn_io::SyncBackend;

    use super::*;

    fn registry(dir: &Path) -> SegmentRegistry {
        SegmentRegistry::new(
            dir.to_path_buf(),
            "store".to_string(),
            false,
            1024,
            16,
            Arc::new(SyncBackend::new()),
        )
    }

    #[test]
    fn fresh_segment_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let segment = registry.create_segment(SegmentId::FIRST).unwrap();

        assert_eq!(segment.data_len(), DATA_HEADER_BYTES);
        assert_eq!(segment.log_len(), 0);
        let raw = fs::read(registry.data_path(SegmentId::FIRST)).unwrap();
        assert_eq!(raw, 1024u64.to_be_bytes());
    }

    #[test]
    fn append_and_read_value() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let segment = registry.create_segment(SegmentId::FIRST).unwrap();

        let offset = segment.append_data(&value_frame(b"hello")).unwrap();
        assert_eq!(offset, 0);
        let second = segment.append_data(&value_frame(b"world!")).unwrap();
        assert_eq!(second, 4 + 5);

        assert_eq!(segment.read_value(offset).unwrap(), b"hello");
        assert_eq!(segment.read_value(second).unwrap(), b"world!");
    }

    #[test]
    fn read_past_end_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let segment = registry.create_segment(SegmentId::FIRST).unwrap();
        segment.append_data(&value_frame(b"x")).unwrap();

        assert!(matches!(
            segment.read_value(500),
            Err(StorageError::OffsetOutOfRange { .. })
        ));
        assert!(segment.check_value(0).unwrap());
        assert!(!segment.check_value(500).unwrap());
    }

    #[test]
    fn ref_count_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let segment = registry.create_segment(SegmentId::FIRST).unwrap();

        assert!(segment.is_unused());
        assert_eq!(segment.increment(), 1);
        assert_eq!(segment.increment(), 2);
        assert!(!segment.is_unused());
        assert_eq!(segment.decrement(), 1);
        assert_eq!(segment.decrement(), 0);
        assert!(segment.is_unused());
    }

    #[test]
    fn roll_creates_consecutive_serials() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.create_segment(SegmentId::FIRST).unwrap();

        let second = registry.roll().unwrap();
        assert_eq!(second.id(), SegmentId::new(2));
        assert_eq!(registry.active().unwrap().id(), SegmentId::new(2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn segment_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.set_max_file_count(2);
        registry.create_segment(SegmentId::FIRST).unwrap();
        registry.roll().unwrap();

        assert!(matches!(
            registry.roll(),
            Err(StorageError::SegmentLimitExceeded { count: 3, max: 2 })
        ));
    }

    #[test]
    fn scan_finds_data_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.create_segment(SegmentId::FIRST).unwrap();
        registry.roll().unwrap();
        fs::write(dir.path().join("store_indexCache"), b"").unwrap();
        fs::write(dir.path().join("checkpoint"), b"{}").unwrap();

        let ids = registry.scan().unwrap();
        assert_eq!(ids, vec![SegmentId::new(1), SegmentId::new(2)]);
    }

    #[test]
    fn remove_unlinks_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let segment = registry.create_segment(SegmentId::FIRST).unwrap();
        segment.append_log(&[0u8; 29]).unwrap();

        registry.remove(SegmentId::FIRST).unwrap();
        assert!(!registry.data_path(SegmentId::FIRST).exists());
        assert!(!registry.log_path(SegmentId::FIRST).exists());
        assert!(registry.active().is_none());
    }

    #[test]
    fn truncate_log_cuts_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let segment = registry.create_segment(SegmentId::FIRST).unwrap();
        segment.append_log(&[1u8; 29 + 13]).unwrap();

        segment.truncate_log(29).unwrap();
        assert_eq!(segment.log_len(), 29);
        assert_eq!(segment.read_log().unwrap().len(), 29);
    }
}

//! File-backed hash index: memory-mapped buckets of fixed-size slots.
//!
//! The index maps 16-byte fingerprints to [`JournalLocation`]s in a file of
//! `B` buckets. Capacity is fixed at open time; the file is never grown.
//!
//! # File Format
//!
//! ```text
//! ┌──────────── bucket 0 (4096 bytes) ────────────┐┌── bucket 1 ──┐ ...
//! │ slot 0 │ slot 1 │ ... │ slot 140 │ 7B unused  ││              │
//! └───────────────────────────────────────────────┘└──────────────┘
//!
//! slot: [state:u8][key:16B][segment:u32][offset:u64]  = 29 bytes
//! ```
//!
//! Integers are big-endian. Slot states: `EMPTY = 0` (never used,
//! terminates scans), `OCCUPIED = 1`, `RELEASED = 2` (tombstone — free for
//! reuse but scanned past). A key's bucket is its stable 64-bit reduction
//! modulo the bucket count; collisions probe linearly within the bucket
//! only, so a full bucket is a sizing error, not a rehash trigger.
//!
//! Not thread-safe on its own; the owning index guards it with a lock.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use cairn_types::{Fingerprint, JournalLocation, SegmentId};

use crate::StorageError;

/// Size of one bucket in bytes.
pub const BUCKET_BYTES: usize = 4096;

/// Size of one slot in bytes: state(1) + key(16) + segment(4) + offset(8).
pub const SLOT_BYTES: usize = 29;

/// Number of slots per bucket (141; the trailing 7 bytes are unused).
pub const SLOTS_PER_BUCKET: usize = BUCKET_BYTES / SLOT_BYTES;

const STATE_EMPTY: u8 = 0;
const STATE_OCCUPIED: u8 = 1;
const STATE_RELEASED: u8 = 2;

const KEY_START: usize = 1;
const SEGMENT_START: usize = 17;
const OFFSET_START: usize = 21;

/// A memory-mapped, fixed-capacity hash index file.
#[derive(Debug)]
pub struct BucketIndex {
    path: PathBuf,
    buckets: usize,
    /// Count of occupied slots, kept in memory for O(1) `len`.
    occupied: usize,
    /// `None` only after `close` unmapped the file.
    map: Option<MmapMut>,
    file: Option<std::fs::File>,
}

impl BucketIndex {
    /// Opens (or creates) an index file with exactly `buckets` buckets.
    ///
    /// An existing file whose size does not match `buckets * 4096` is a
    /// configuration error ([`StorageError::IndexSizeMismatch`]).
    pub fn open(path: impl Into<PathBuf>, buckets: usize) -> Result<Self, StorageError> {
        assert!(buckets > 0, "bucket count must be > 0");
        let path = path.into();
        let expected = (buckets * BUCKET_BYTES) as u64;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            // Fresh file: extend to capacity; the kernel zero-fills, which
            // leaves every slot EMPTY.
            file.set_len(expected)?;
        } else if len != expected {
            return Err(StorageError::IndexSizeMismatch {
                path,
                expected,
                actual: len,
            });
        }

        // SAFETY: `file` is open read/write and has just been sized to
        // exactly the mapped length, so the mapping range is fully
        // allocated. The store owns the file exclusively (single-process
        // contract), so no other mapping mutates it underneath us.
        let map = unsafe { MmapMut::map_mut(&file)? };

        let mut index = Self {
            path,
            buckets,
            occupied: 0,
            map: Some(map),
            file: Some(file),
        };
        index.occupied = index.count_occupied()?;
        Ok(index)
    }

    /// Recreates the index file from scratch, discarding any content.
    pub fn create_fresh(path: impl Into<PathBuf>, buckets: usize) -> Result<Self, StorageError> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Self::open(path, buckets)
    }

    fn mmap(&self) -> &MmapMut {
        self.map.as_ref().expect("index used after close")
    }

    fn mmap_mut(&mut self) -> &mut MmapMut {
        self.map.as_mut().expect("index used after close")
    }

    fn bucket_of(&self, key: &Fingerprint) -> u64 {
        key.stable_hash() % self.buckets as u64
    }

    fn slot_base(bucket: u64, slot: usize) -> usize {
        bucket as usize * BUCKET_BYTES + slot * SLOT_BYTES
    }

    fn slot_state(&self, base: usize) -> u8 {
        self.mmap()[base]
    }

    fn slot_key(&self, base: usize) -> Fingerprint {
        Fingerprint::from_slice(&self.mmap()[base + KEY_START..base + SEGMENT_START])
            .expect("slot key is exactly 16 bytes")
    }

    fn slot_location(&self, base: usize) -> JournalLocation {
        let data = self.mmap();
        let segment = u32::from_be_bytes(
            data[base + SEGMENT_START..base + OFFSET_START]
                .try_into()
                .expect("slice is exactly 4 bytes"),
        );
        let offset = u64::from_be_bytes(
            data[base + OFFSET_START..base + SLOT_BYTES]
                .try_into()
                .expect("slice is exactly 8 bytes"),
        );
        JournalLocation::new(SegmentId::new(segment), offset)
    }

    fn write_slot(&mut self, base: usize, key: &Fingerprint, location: JournalLocation) {
        let data = self.mmap_mut();
        data[base] = STATE_OCCUPIED;
        data[base + KEY_START..base + SEGMENT_START].copy_from_slice(key.as_bytes());
        data[base + SEGMENT_START..base + OFFSET_START]
            .copy_from_slice(&location.segment.as_u32().to_be_bytes());
        data[base + OFFSET_START..base + SLOT_BYTES]
            .copy_from_slice(&location.offset.to_be_bytes());
    }

    /// Inserts or overwrites the entry for `key`, returning the previous
    /// location if one was present.
    ///
    /// Scan protocol: the first EMPTY slot ends the scan (no live entry can
    /// lie past one, because inserts never skip an EMPTY); RELEASED slots
    /// are remembered for reuse but scanned past; a matching OCCUPIED slot
    /// is overwritten in place.
    pub fn put(
        &mut self,
        key: &Fingerprint,
        location: JournalLocation,
    ) -> Result<Option<JournalLocation>, StorageError> {
        let bucket = self.bucket_of(key);
        let mut released: Option<usize> = None;

        for slot in 0..SLOTS_PER_BUCKET {
            let base = Self::slot_base(bucket, slot);
            match self.slot_state(base) {
                STATE_EMPTY => {
                    self.write_slot(base, key, location);
                    self.occupied += 1;
                    return Ok(None);
                }
                STATE_OCCUPIED => {
                    if self.slot_key(base) == *key {
                        let previous = self.slot_location(base);
                        self.write_slot(base, key, location);
                        return Ok(Some(previous));
                    }
                }
                STATE_RELEASED => {
                    if released.is_none() {
                        released = Some(base);
                    }
                }
                byte => return Err(StorageError::InvalidSlotState { byte, bucket }),
            }
        }

        if let Some(base) = released {
            self.write_slot(base, key, location);
            self.occupied += 1;
            return Ok(None);
        }

        Err(StorageError::BucketFull { bucket })
    }

    /// Looks up the location for `key`.
    pub fn get(&self, key: &Fingerprint) -> Result<Option<JournalLocation>, StorageError> {
        let bucket = self.bucket_of(key);
        for slot in 0..SLOTS_PER_BUCKET {
            let base = Self::slot_base(bucket, slot);
            match self.slot_state(base) {
                STATE_EMPTY => return Ok(None),
                STATE_OCCUPIED => {
                    if self.slot_key(base) == *key {
                        return Ok(Some(self.slot_location(base)));
                    }
                }
                STATE_RELEASED => {}
                byte => return Err(StorageError::InvalidSlotState { byte, bucket }),
            }
        }
        Ok(None)
    }

    /// Removes the entry for `key`, returning its location.
    ///
    /// The slot becomes a RELEASED tombstone so later entries in the same
    /// bucket stay reachable.
    pub fn remove(&mut self, key: &Fingerprint) -> Result<Option<JournalLocation>, StorageError> {
        let bucket = self.bucket_of(key);
        for slot in 0..SLOTS_PER_BUCKET {
            let base = Self::slot_base(bucket, slot);
            match self.slot_state(base) {
                STATE_EMPTY => return Ok(None),
                STATE_OCCUPIED => {
                    if self.slot_key(base) == *key {
                        let previous = self.slot_location(base);
                        self.mmap_mut()[base] = STATE_RELEASED;
                        self.occupied -= 1;
                        return Ok(Some(previous));
                    }
                }
                STATE_RELEASED => {}
                byte => return Err(StorageError::InvalidSlotState { byte, bucket }),
            }
        }
        Ok(None)
    }

    /// Returns every occupied key (full file scan).
    pub fn keys(&self) -> Result<Vec<Fingerprint>, StorageError> {
        let mut keys = Vec::with_capacity(self.occupied);
        for bucket in 0..self.buckets as u64 {
            for slot in 0..SLOTS_PER_BUCKET {
                let base = Self::slot_base(bucket, slot);
                match self.slot_state(base) {
                    STATE_EMPTY => break,
                    STATE_OCCUPIED => keys.push(self.slot_key(base)),
                    STATE_RELEASED => {}
                    byte => return Err(StorageError::InvalidSlotState { byte, bucket }),
                }
            }
        }
        Ok(keys)
    }

    fn count_occupied(&self) -> Result<usize, StorageError> {
        let mut count = 0;
        for bucket in 0..self.buckets as u64 {
            for slot in 0..SLOTS_PER_BUCKET {
                let base = Self::slot_base(bucket, slot);
                match self.slot_state(base) {
                    STATE_EMPTY => break,
                    STATE_OCCUPIED => count += 1,
                    STATE_RELEASED => {}
                    byte => return Err(StorageError::InvalidSlotState { byte, bucket }),
                }
            }
        }
        Ok(count)
    }

    /// Number of occupied entries.
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Returns `true` if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Number of buckets the file was sized for.
    pub fn bucket_count(&self) -> usize {
        self.buckets
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forces the mapping to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    /// Flushes, unmaps, then closes the backing file.
    ///
    /// The mapping must go before the file on platforms that hold file
    /// locks for live mappings.
    pub fn close(&mut self) -> Result<(), StorageError> {
        self.flush()?;
        self.map = None;
        self.file = None;
        Ok(())
    }
}

impl Drop for BucketIndex {
    fn drop(&mut self) {
        if self.map.is_some() {
            if let Err(e) = self.close() {
                tracing::error!(path = %self.path.display(), error = %e, "failed to close hash index");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn key(byte: u8) -> Fingerprint {
        Fingerprint::new([byte; 16])
    }

    fn loc(segment: u32, offset: u64) -> JournalLocation {
        JournalLocation::new(SegmentId::new(segment), offset)
    }

    #[test]
    fn put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = BucketIndex::open(dir.path().join("idx"), 4).unwrap();

        assert_eq!(index.put(&key(1), loc(1, 10)).unwrap(), None);
        assert_eq!(index.get(&key(1)).unwrap(), Some(loc(1, 10)));
        assert_eq!(index.len(), 1);

        // Overwrite returns previous.
        assert_eq!(index.put(&key(1), loc(2, 20)).unwrap(), Some(loc(1, 10)));
        assert_eq!(index.get(&key(1)).unwrap(), Some(loc(2, 20)));
        assert_eq!(index.len(), 1);

        assert_eq!(index.remove(&key(1)).unwrap(), Some(loc(2, 20)));
        assert_eq!(index.get(&key(1)).unwrap(), None);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn single_bucket_linear_probing() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = BucketIndex::open(dir.path().join("idx"), 1).unwrap();

        // One bucket: 141 distinct keys all probe the same chain.
        for i in 0..SLOTS_PER_BUCKET {
            assert_eq!(index.put(&key(i as u8), loc(1, i as u64)).unwrap(), None);
        }
        assert_eq!(index.len(), SLOTS_PER_BUCKET);

        // The 142nd insert finds no slot.
        let err = index.put(&key(200), loc(1, 0)).unwrap_err();
        assert!(matches!(err, StorageError::BucketFull { bucket: 0 }));

        // Release two slots, re-insert one: it reuses a released slot and
        // reports no previous value.
        assert!(index.remove(&key(0)).unwrap().is_some());
        assert!(index.remove(&key(1)).unwrap().is_some());
        assert_eq!(index.put(&key(1), loc(9, 99)).unwrap(), None);
        assert_eq!(index.get(&key(1)).unwrap(), Some(loc(9, 99)));

        // Entries past the tombstones are still reachable.
        assert_eq!(index.get(&key(140)).unwrap(), Some(loc(1, 140)));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        {
            let mut index = BucketIndex::open(&path, 8).unwrap();
            for i in 0..50u8 {
                index.put(&key(i), loc(1, u64::from(i))).unwrap();
            }
            index.remove(&key(7)).unwrap();
            index.close().unwrap();
        }

        let index = BucketIndex::open(&path, 8).unwrap();
        assert_eq!(index.len(), 49);
        assert_eq!(index.get(&key(7)).unwrap(), None);
        assert_eq!(index.get(&key(12)).unwrap(), Some(loc(1, 12)));
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        {
            let index = BucketIndex::open(&path, 2).unwrap();
            drop(index);
        }
        let err = BucketIndex::open(&path, 4).unwrap_err();
        assert!(matches!(err, StorageError::IndexSizeMismatch { .. }));
    }

    #[test]
    fn create_fresh_discards_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        {
            let mut index = BucketIndex::open(&path, 2).unwrap();
            index.put(&key(1), loc(1, 1)).unwrap();
            index.close().unwrap();
        }
        let index = BucketIndex::create_fresh(&path, 2).unwrap();
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn keys_lists_occupied_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = BucketIndex::open(dir.path().join("idx"), 4).unwrap();
        for i in 0..10u8 {
            index.put(&key(i), loc(1, u64::from(i))).unwrap();
        }
        index.remove(&key(3)).unwrap();

        let mut keys = index.keys().unwrap();
        keys.sort();
        let mut expected: Vec<_> = (0..10u8).filter(|&i| i != 3).map(key).collect();
        expected.sort();
        assert_eq!(keys, expected);
    }

    proptest! {
        // The index must agree with a plain HashMap under arbitrary
        // sequences of put/remove/get on a small key universe.
        #[test]
        fn behaves_like_a_hash_map(ops in proptest::collection::vec((0u8..32, 0u8..3, any::<u32>()), 1..200)) {
            let dir = tempfile::tempdir().unwrap();
            let mut index = BucketIndex::open(dir.path().join("idx"), 2).unwrap();
            let mut model: HashMap<Fingerprint, JournalLocation> = HashMap::new();

            for (k, op, v) in ops {
                let k = key(k);
                let location = loc(1, u64::from(v));
                match op {
                    0 => {
                        let expected = model.insert(k, location);
                        let actual = index.put(&k, location).unwrap();
                        prop_assert_eq!(actual, expected);
                    }
                    1 => {
                        let expected = model.remove(&k);
                        let actual = index.remove(&k).unwrap();
                        prop_assert_eq!(actual, expected);
                    }
                    _ => {
                        let expected = model.get(&k).copied();
                        let actual = index.get(&k).unwrap();
                        prop_assert_eq!(actual, expected);
                    }
                }
                prop_assert_eq!(index.len(), model.len());
            }
        }
    }
}

//! Bounded resident set over a file-backed spill index.
//!
//! [`SpillCache`] keeps the hottest index entries in memory and pushes
//! cold ones out to a [`BucketIndex`] file. The two homes are managed as
//! one map: a lookup that misses the resident set promotes the entry back
//! from the spill file, an insert into a full resident set demotes a cold
//! entry to make room, and every key lives in exactly one home at a time —
//! which keeps `len` and `keys` exact and a resident hit from shadowing a
//! stale spilled copy.
//!
//! Cold entries are picked by SIEVE: each resident entry carries a
//! `visited` bit set on access, and a rotating hand clears bits until it
//! finds an unvisited entry to demote. Close to LRU behavior with O(1)
//! operations and no recency list to maintain.
//!
//! Only live ADD records are ever indexed, so a spilled entry round-trips
//! through a bare [`JournalLocation`].

use std::collections::HashMap;

use cairn_types::{Fingerprint, JournalLocation, OpKind};

use crate::StorageError;
use crate::bucket_index::BucketIndex;
use crate::op_record::OpRecord;

/// In-memory half of a spilling index entry.
struct Resident {
    key: Fingerprint,
    record: OpRecord,
    /// Accessed since the SIEVE hand last passed; protects from demotion.
    visited: bool,
}

/// Bounded in-memory record set backed by a spill file.
///
/// Not internally synchronized; the owning index guards it with a lock
/// (which also covers the spill file, per its contract).
pub(crate) struct SpillCache {
    /// Fixed-size circular buffer of resident entries.
    resident: Vec<Option<Resident>>,
    /// Key → position in `resident`.
    slots: HashMap<Fingerprint, usize>,
    /// SIEVE hand position for the demotion scan.
    hand: usize,
    /// Number of live resident entries.
    resident_len: usize,
    /// Cold entries, keyed like the resident set.
    spill: BucketIndex,
}

impl SpillCache {
    /// Creates a cache holding at most `capacity` resident entries over a
    /// freshly opened spill file.
    pub(crate) fn new(capacity: usize, spill: BucketIndex) -> Self {
        let capacity = capacity.max(1);
        Self {
            resident: (0..capacity).map(|_| None).collect(),
            slots: HashMap::with_capacity(capacity),
            hand: 0,
            resident_len: 0,
            spill,
        }
    }

    /// Rebuilds the record a spilled location stands for.
    fn from_spilled(key: Fingerprint, location: JournalLocation) -> OpRecord {
        OpRecord::new(OpKind::Add, key, location.segment, location.offset)
    }

    /// Returns the record for `key`, promoting it into the resident set
    /// on a spill hit.
    pub(crate) fn get(&mut self, key: &Fingerprint) -> Result<Option<OpRecord>, StorageError> {
        if let Some(&slot) = self.slots.get(key) {
            let resident = self.resident[slot]
                .as_mut()
                .expect("slot map points at a live resident entry");
            resident.visited = true;
            return Ok(Some(resident.record));
        }
        let Some(location) = self.spill.remove(key)? else {
            return Ok(None);
        };
        let record = Self::from_spilled(*key, location);
        self.install(*key, record)?;
        Ok(Some(record))
    }

    /// Inserts or replaces the record for `key`, returning the previous
    /// one from whichever home held it.
    pub(crate) fn put(
        &mut self,
        key: Fingerprint,
        record: OpRecord,
    ) -> Result<Option<OpRecord>, StorageError> {
        if let Some(&slot) = self.slots.get(&key) {
            let resident = self.resident[slot]
                .as_mut()
                .expect("slot map points at a live resident entry");
            let previous = std::mem::replace(&mut resident.record, record);
            resident.visited = true;
            return Ok(Some(previous));
        }
        // Pull any cold copy out of the spill file so the key stays
        // single-homed; it doubles as the previous value.
        let previous = self
            .spill
            .remove(&key)?
            .map(|location| Self::from_spilled(key, location));
        self.install(key, record)?;
        Ok(previous)
    }

    /// Removes `key` from whichever home holds it.
    pub(crate) fn remove(&mut self, key: &Fingerprint) -> Result<Option<OpRecord>, StorageError> {
        if let Some(slot) = self.slots.remove(key) {
            let resident = self.resident[slot]
                .take()
                .expect("slot map points at a live resident entry");
            self.resident_len -= 1;
            return Ok(Some(resident.record));
        }
        Ok(self
            .spill
            .remove(key)?
            .map(|location| Self::from_spilled(*key, location)))
    }

    /// Places a record in the resident set, demoting a cold entry to the
    /// spill file when the set is full.
    fn install(&mut self, key: Fingerprint, record: OpRecord) -> Result<(), StorageError> {
        let slot = if self.resident_len < self.resident.len() {
            self.resident
                .iter()
                .position(Option::is_none)
                .expect("resident set below capacity has a free slot")
        } else {
            let victim = self.find_victim();
            if let Some(cold) = self.resident[victim].take() {
                self.slots.remove(&cold.key);
                self.resident_len -= 1;
                self.spill.put(&cold.key, cold.record.location())?;
            }
            victim
        };
        self.resident[slot] = Some(Resident {
            key,
            record,
            visited: false,
        });
        self.slots.insert(key, slot);
        self.resident_len += 1;
        Ok(())
    }

    /// SIEVE scan: the hand clears `visited` bits as it advances and stops
    /// at the first unvisited entry.
    fn find_victim(&mut self) -> usize {
        // Two sweeps bound the scan: the first clears every visited bit,
        // the second must find a target.
        for _ in 0..self.resident.len() * 2 {
            let slot = self.hand;
            self.hand = (self.hand + 1) % self.resident.len();
            match &mut self.resident[slot] {
                Some(resident) if resident.visited => resident.visited = false,
                _ => return slot,
            }
        }
        let slot = self.hand;
        self.hand = (self.hand + 1) % self.resident.len();
        slot
    }

    /// Total live entries across both homes.
    pub(crate) fn len(&self) -> usize {
        self.resident_len + self.spill.len()
    }

    /// Every live key, resident and spilled.
    pub(crate) fn keys(&self) -> Result<Vec<Fingerprint>, StorageError> {
        let mut keys: Vec<Fingerprint> = self.slots.keys().copied().collect();
        keys.extend(self.spill.keys()?);
        Ok(keys)
    }

    /// Forces the spill file to disk.
    pub(crate) fn flush(&self) -> Result<(), StorageError> {
        self.spill.flush()
    }

    /// Flushes and unmaps the spill file.
    pub(crate) fn close(&mut self) -> Result<(), StorageError> {
        self.spill.close()
    }
}

//! Recovery checkpoint: replay position plus the live index image.
//!
//! The checkpoint bounds log replay at startup. It records the position
//! `(segment, log_offset)` up to which the journal is known applied, and
//! the resume map — every live key with its value's location — so segments
//! below the position can be trusted without re-reading their logs.
//!
//! The in-memory structure tracks every add/remove as it happens; it is
//! persisted as JSON beside the data files on clean close, on segment
//! rollover, after each compaction pass and at the end of recovery —
//! always after a writer sync, so the recorded position never runs ahead
//! of durable log bytes. A missing or unreadable file is a cold start.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use cairn_types::{Fingerprint, JournalLocation, SegmentId};

use crate::StorageError;

/// Replay bound and resume map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    /// Segment whose log replay must start in.
    pub(crate) segment: SegmentId,
    /// Byte offset into that segment's log.
    pub(crate) log_offset: u64,
    /// Live keys and their value locations at checkpoint time.
    pub(crate) entries: HashMap<Fingerprint, JournalLocation>,
}

impl Checkpoint {
    /// A checkpoint that trusts nothing: full replay from the start.
    pub(crate) fn cold() -> Self {
        Self {
            segment: SegmentId::new(0),
            log_offset: 0,
            entries: HashMap::new(),
        }
    }

    /// Loads a checkpoint from disk.
    ///
    /// Absent, unreadable or unparsable files degrade to a cold start
    /// (recovery replays every log), never to an error.
    pub(crate) fn load(path: &Path) -> Option<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable checkpoint, cold start");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt checkpoint, cold start");
                None
            }
        }
    }

    /// Persists the checkpoint to disk.
    pub(crate) fn save(&self, path: &Path) -> Result<(), StorageError> {
        let json = serde_json::to_string(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Moves the replay bound forward.
    pub(crate) fn set_position(&mut self, segment: SegmentId, log_offset: u64) {
        self.segment = segment;
        self.log_offset = log_offset;
    }

    /// Records a key's new live location.
    pub(crate) fn record_add(&mut self, key: Fingerprint, location: JournalLocation) {
        self.entries.insert(key, location);
    }

    /// Drops a removed key from the resume map.
    pub(crate) fn record_remove(&mut self, key: &Fingerprint) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint");

        let mut checkpoint = Checkpoint::cold();
        checkpoint.set_position(SegmentId::new(3), 290);
        checkpoint.record_add(
            Fingerprint::new([7; 16]),
            JournalLocation::new(SegmentId::new(2), 4096),
        );
        checkpoint.record_add(
            Fingerprint::new([9; 16]),
            JournalLocation::new(SegmentId::new(3), 0),
        );
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.segment, SegmentId::new(3));
        assert_eq!(loaded.log_offset, 290);
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(
            loaded.entries[&Fingerprint::new([7; 16])],
            JournalLocation::new(SegmentId::new(2), 4096)
        );
    }

    #[test]
    fn missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::load(&dir.path().join("checkpoint")).is_none());
    }

    #[test]
    fn corrupt_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint");
        fs::write(&path, b"{not json").unwrap();
        assert!(Checkpoint::load(&path).is_none());
    }

    #[test]
    fn remove_drops_resume_entry() {
        let mut checkpoint = Checkpoint::cold();
        let key = Fingerprint::new([1; 16]);
        checkpoint.record_add(key, JournalLocation::new(SegmentId::FIRST, 0));
        checkpoint.record_remove(&key);
        assert!(checkpoint.entries.is_empty());
    }
}

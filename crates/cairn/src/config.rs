//! Configuration for opening a Cairn store.

use std::path::PathBuf;
use std::time::Duration;

use cairn_storage::{CompactionConfig, StoreOptions};

/// Configuration for opening a [`crate::Cairn`] store.
///
/// Built with `new` plus `with_*` methods; every knob has a production
/// default.
#[derive(Debug, Clone)]
pub struct CairnConfig {
    /// Directory holding the store's files.
    pub path: PathBuf,
    /// Store name; all file names derive from it.
    pub name: String,
    /// Open files with synchronous (`O_SYNC`) writes.
    pub force: bool,
    /// Use the bounded-cache index that spills cold entries to the
    /// `{name}_indexCache` file instead of keeping every entry in RAM.
    pub index_lru: bool,
    /// Verify recovered index entries against the data files at open.
    pub data_file_check: bool,
    /// Upper bound on segment files.
    pub max_file_count: usize,
    /// Data-file size limit before rollover.
    pub file_size: u64,
    /// Cap on value bytes per writer batch.
    pub max_batch_size: usize,
    /// Entry capacity of the spill index's in-memory cache.
    pub cache_capacity: usize,
    /// Bucket count of the spill index file.
    pub bucket_count: usize,
    /// How often the background compaction pass runs.
    pub check_interval: Duration,
    /// Entries older than this are migrated into the active segment.
    pub interval_for_compact: Duration,
    /// Entries older than this are removed outright.
    pub interval_for_remove: Duration,
}

impl CairnConfig {
    /// Creates a configuration with production defaults.
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let compaction = CompactionConfig::default();
        Self {
            path: path.into(),
            name: name.into(),
            force: false,
            index_lru: false,
            data_file_check: false,
            max_file_count: cairn_storage::DEFAULT_MAX_FILE_COUNT,
            file_size: cairn_storage::DEFAULT_FILE_SIZE,
            max_batch_size: cairn_storage::DEFAULT_MAX_BATCH_SIZE,
            cache_capacity: cairn_storage::DEFAULT_CACHE_CAPACITY,
            bucket_count: cairn_storage::DEFAULT_BUCKET_COUNT,
            check_interval: compaction.check_interval,
            interval_for_compact: compaction.interval_for_compact,
            interval_for_remove: compaction.interval_for_remove,
        }
    }

    /// Selects durable (`O_SYNC`) writes.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Selects the spill-backed index variant.
    pub fn with_index_lru(mut self, index_lru: bool) -> Self {
        self.index_lru = index_lru;
        self
    }

    /// Enables the data-file consistency check at open.
    pub fn with_data_file_check(mut self, check: bool) -> Self {
        self.data_file_check = check;
        self
    }

    /// Sets the segment-count bound.
    pub fn with_max_file_count(mut self, max: usize) -> Self {
        self.max_file_count = max;
        self
    }

    /// Sets the data-file size limit.
    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    /// Sets the writer batch cap.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Sets the spill cache capacity (entries).
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the spill index bucket count.
    pub fn with_bucket_count(mut self, buckets: usize) -> Self {
        self.bucket_count = buckets;
        self
    }

    /// Sets how often the compaction pass runs.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets the migration age threshold.
    pub fn with_interval_for_compact(mut self, interval: Duration) -> Self {
        self.interval_for_compact = interval;
        self
    }

    /// Sets the expiry age threshold.
    pub fn with_interval_for_remove(mut self, interval: Duration) -> Self {
        self.interval_for_remove = interval;
        self
    }

    pub(crate) fn store_options(&self) -> StoreOptions {
        let mut options = StoreOptions::new(&self.path, &self.name);
        options.force = self.force;
        options.index_lru = self.index_lru;
        options.data_file_check = self.data_file_check;
        options.max_file_count = self.max_file_count;
        options.file_size = self.file_size;
        options.max_batch_size = self.max_batch_size;
        options.cache_capacity = self.cache_capacity;
        options.bucket_count = self.bucket_count;
        options.compaction = CompactionConfig {
            check_interval: self.check_interval,
            interval_for_compact: self.interval_for_compact,
            interval_for_remove: self.interval_for_remove,
        };
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_storage_constants() {
        let config = CairnConfig::new("/tmp/cairn", "events");
        assert_eq!(config.file_size, 64 * 1024 * 1024);
        assert_eq!(config.max_batch_size, 4 * 1024 * 1024);
        assert!(!config.force);
        assert!(!config.index_lru);
        assert_eq!(config.interval_for_compact, Duration::from_secs(43_200));
        assert_eq!(config.interval_for_remove, Duration::from_secs(604_800));
    }

    #[test]
    fn builders_override_fields() {
        let config = CairnConfig::new("/tmp/cairn", "events")
            .with_force(true)
            .with_index_lru(true)
            .with_file_size(1024)
            .with_max_file_count(8)
            .with_check_interval(Duration::from_secs(60));
        assert!(config.force);
        assert!(config.index_lru);
        assert_eq!(config.file_size, 1024);
        assert_eq!(config.max_file_count, 8);
        assert_eq!(config.check_interval, Duration::from_secs(60));

        let options = config.store_options();
        assert_eq!(options.file_size, 1024);
        assert!(options.force);
    }
}

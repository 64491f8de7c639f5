//! Compaction policy types.
//!
//! The compaction pass walks every live key and, based on its age, either
//! expires it (`remove`) or migrates it into the active segment (`reuse`)
//! so nearly-empty old segments drain to refcount zero and become
//! deletable. The pass itself lives on the store
//! ([`crate::JournalStore::check`]); this module holds the tunables and
//! the result summary.

use std::time::Duration;

/// Age thresholds for the compaction pass.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// How often the background scheduler runs the pass.
    pub check_interval: Duration,
    /// Entries older than this are migrated into the active segment.
    pub interval_for_compact: Duration,
    /// Entries older than this are removed outright.
    pub interval_for_remove: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(24 * 60 * 60),
            interval_for_compact: Duration::from_secs(12 * 60 * 60),
            interval_for_remove: Duration::from_secs(12 * 60 * 60 * 2 * 7),
        }
    }
}

/// Result of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Keys examined.
    pub examined: usize,
    /// Keys removed because they aged past `interval_for_remove`.
    pub removed: usize,
    /// Keys re-added into the active segment.
    pub migrated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = CompactionConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(86_400));
        assert_eq!(config.interval_for_compact, Duration::from_secs(43_200));
        assert_eq!(config.interval_for_remove, Duration::from_secs(604_800));
    }

    #[test]
    fn result_fields() {
        let result = CompactionResult {
            examined: 100,
            removed: 12,
            migrated: 30,
        };
        assert_eq!(result.examined, 100);
        assert_eq!(result.removed, 12);
        assert_eq!(result.migrated, 30);
    }
}

//! Facade error type.

use cairn_storage::StorageError;
use cairn_types::FingerprintError;

/// Errors surfaced by the [`crate::Cairn`] API.
#[derive(Debug, thiserror::Error)]
pub enum CairnError {
    /// The caller-supplied key is not a valid 16-byte fingerprint.
    #[error("invalid key: {source}")]
    InvalidKey {
        #[from]
        source: FingerprintError,
    },

    /// Error from the journal store.
    #[error(transparent)]
    Storage {
        #[from]
        source: StorageError,
    },
}

/// Convenience result alias for the Cairn API.
pub type Result<T> = std::result::Result<T, CairnError>;

//! I/O backend trait.
//!
//! The [`IoBackend`] trait abstracts file I/O operations so the journal
//! layer can be tested against alternative backends and so the durability
//! mode (buffered vs. `O_SYNC`) is decided once, at open time, rather than
//! sprinkled through the storage code.

use std::path::Path;

use bytes::Bytes;

use crate::IoError;

/// Flags for opening files.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Create the file if it doesn't exist.
    pub create: bool,
    /// Open in append mode.
    pub append: bool,
    /// Make every write synchronous (`O_SYNC` on unix, ignored elsewhere).
    pub sync: bool,
}

impl OpenFlags {
    /// Flags for reading an existing file.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Flags for creating or appending to a file.
    ///
    /// `sync` selects synchronous writes for stores opened in `force` mode.
    pub fn append_create(sync: bool) -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            append: true,
            sync,
        }
    }
}

/// Opaque handle to an open file.
///
/// The handle is backend-specific. For `SyncBackend`, it wraps a
/// `std::fs::File`. The handle closes when dropped or via
/// [`IoBackend::close`].
#[derive(Debug)]
pub struct FileHandle {
    /// Internal file descriptor or identifier.
    pub(crate) id: u64,
    /// The open file (for sync backend).
    pub(crate) file: Option<std::fs::File>,
}

impl FileHandle {
    /// Creates a new file handle wrapping a `std::fs::File`.
    pub(crate) fn from_file(id: u64, file: std::fs::File) -> Self {
        Self {
            id,
            file: Some(file),
        }
    }

    /// Returns the internal file reference.
    pub(crate) fn file(&self) -> Result<&std::fs::File, IoError> {
        self.file
            .as_ref()
            .ok_or(IoError::InvalidHandle { handle: self.id })
    }

    /// Returns the internal file reference mutably.
    pub(crate) fn file_mut(&mut self) -> Result<&mut std::fs::File, IoError> {
        self.file
            .as_mut()
            .ok_or(IoError::InvalidHandle { handle: self.id })
    }
}

/// Abstraction over file I/O operations.
///
/// All methods are synchronous. Positional reads take `&FileHandle` and are
/// safe to issue from many threads at once; writes take `&mut FileHandle`
/// and belong to the single writer thread.
pub trait IoBackend: Send + Sync {
    /// Opens a file with the given flags.
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, IoError>;

    /// Reads data from a file at the given byte offset.
    ///
    /// Returns the number of bytes read.
    fn read_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Fills `buf` from the given byte offset, failing on short reads.
    fn read_exact_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8])
    -> Result<(), IoError>;

    /// Writes data to a file (at the end, in append mode).
    ///
    /// Returns the number of bytes written.
    fn write(&self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize, IoError>;

    /// Syncs file data and metadata to disk.
    fn fsync(&self, handle: &FileHandle) -> Result<(), IoError>;

    /// Truncates (or extends with zeros) a file to the given length.
    fn set_len(&self, handle: &FileHandle, len: u64) -> Result<(), IoError>;

    /// Closes a file handle.
    fn close(&self, handle: FileHandle) -> Result<(), IoError>;

    /// Reads an entire file into memory.
    ///
    /// Convenience method for small files (logs during replay, checkpoint).
    fn read_all(&self, path: &Path) -> Result<Bytes, IoError>;

    /// Returns the file size in bytes.
    fn file_size(&self, handle: &FileHandle) -> Result<u64, IoError>;
}

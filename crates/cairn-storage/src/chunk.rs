//! Paged record container: variable-length records in capacity-bounded
//! chunk files.
//!
//! A container is a directory of chunk files, each named by the decimal
//! container offset at which it begins. Records are framed as
//! `length:u32 | bytes` (big-endian) and laid end to end; a chunk accepts
//! appends until the next record would exceed its capacity, at which point
//! the container rolls a new chunk beginning where the previous one ended.
//! Container offsets are therefore contiguous and a record's offset is
//! `chunk.begin + position_within_chunk`.
//!
//! # File Layout
//!
//! ```text
//! {dir}/
//! ├── 0          <- first chunk (records from offset 0)
//! ├── 4087       <- second chunk (records from offset 4087)
//! └── 8190       <- active chunk
//! ```
//!
//! Only the newest chunk accepts appends. Lookups binary-search the chunk
//! list by begin offset.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_io::{FileHandle, IoBackend, IoError, OpenFlags, SyncBackend};

use crate::StorageError;

/// Smallest permitted chunk capacity in bytes.
pub const MIN_CHUNK_CAPACITY: u64 = 4096;

/// Size of the `length` prefix framing each record.
const LEN_PREFIX_BYTES: usize = 4;

/// Why an append could not be served by the active chunk.
enum ChunkAppendError {
    /// The record does not fit into the chunk's remaining capacity.
    /// Caught by the container, which rolls a new chunk and retries.
    Overflow,
    /// The underlying write failed.
    Io(IoError),
}

impl From<IoError> for ChunkAppendError {
    fn from(source: IoError) -> Self {
        ChunkAppendError::Io(source)
    }
}

/// One capacity-bounded chunk file.
struct Chunk {
    /// Container offset of this chunk's first byte.
    begin: u64,
    /// Bytes written so far.
    len: u64,
    path: PathBuf,
    handle: FileHandle,
}

impl Chunk {
    fn create(io: &dyn IoBackend, dir: &Path, begin: u64) -> Result<Self, StorageError> {
        let path = dir.join(begin.to_string());
        let handle = io.open(&path, OpenFlags::append_create(false))?;
        Ok(Self {
            begin,
            len: 0,
            path,
            handle,
        })
    }

    fn open(io: &dyn IoBackend, path: PathBuf, begin: u64) -> Result<Self, StorageError> {
        let handle = io.open(&path, OpenFlags::append_create(false))?;
        let len = io.file_size(&handle)?;
        Ok(Self {
            begin,
            len,
            path,
            handle,
        })
    }

    /// One past the last container offset covered by this chunk.
    fn end(&self) -> u64 {
        self.begin + self.len
    }

    fn append(
        &mut self,
        io: &dyn IoBackend,
        capacity: u64,
        frame: &[u8],
    ) -> Result<u64, ChunkAppendError> {
        if self.len + frame.len() as u64 > capacity {
            return Err(ChunkAppendError::Overflow);
        }
        io.write(&mut self.handle, frame)?;
        let pos = self.len;
        self.len += frame.len() as u64;
        Ok(pos)
    }
}

/// Ordered list of chunk files with container-wide offset addressing.
///
/// Supports `append`, offset-addressed `get`, `truncate`, ordered
/// iteration, `flush` and `close`. Not internally synchronized.
pub struct ChunkContainer {
    dir: PathBuf,
    capacity: u64,
    io: Arc<SyncBackend>,
    /// Chunks in ascending begin-offset order; the last one is active.
    chunks: Vec<Chunk>,
}

impl ChunkContainer {
    /// Opens (or creates) a container in `dir`.
    ///
    /// `chunk_capacity` is clamped to [`MIN_CHUNK_CAPACITY`]. Existing
    /// chunk files are validated for contiguity: each chunk must begin
    /// exactly where the previous one ends.
    pub fn open(dir: impl Into<PathBuf>, chunk_capacity: u64) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let io = Arc::new(SyncBackend::new());
        let capacity = chunk_capacity.max(MIN_CHUNK_CAPACITY);

        let mut begins = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Ok(begin) = name.parse::<u64>() {
                begins.push((begin, entry.path()));
            }
        }
        begins.sort_unstable_by_key(|(begin, _)| *begin);

        let mut chunks: Vec<Chunk> = Vec::with_capacity(begins.len().max(1));
        for (begin, path) in begins {
            let chunk = Chunk::open(io.as_ref(), path, begin)?;
            if let Some(prev) = chunks.last() {
                if chunk.begin != prev.end() {
                    return Err(StorageError::Corrupt {
                        path: chunk.path,
                        reason: format!(
                            "chunk begins at {} but previous chunk ends at {}",
                            chunk.begin,
                            prev.end()
                        ),
                    });
                }
            } else if chunk.begin != 0 {
                return Err(StorageError::Corrupt {
                    path: chunk.path,
                    reason: format!("first chunk begins at {} instead of 0", chunk.begin),
                });
            }
            chunks.push(chunk);
        }

        if chunks.is_empty() {
            chunks.push(Chunk::create(io.as_ref(), &dir, 0)?);
        }

        Ok(Self {
            dir,
            capacity,
            io,
            chunks,
        })
    }

    /// Total container length in bytes.
    pub fn len(&self) -> u64 {
        self.chunks.last().map_or(0, Chunk::end)
    }

    /// Returns `true` if no record has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the configured chunk capacity.
    pub fn chunk_capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of chunk files currently backing the container.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Appends a record and returns its container offset.
    ///
    /// Rolls a new chunk when the record does not fit into the active
    /// chunk's remaining capacity. A record that cannot fit into any chunk
    /// is rejected with [`StorageError::RecordTooLarge`].
    pub fn append(&mut self, record: &[u8]) -> Result<u64, StorageError> {
        let frame_len = LEN_PREFIX_BYTES + record.len();
        if frame_len as u64 > self.capacity {
            return Err(StorageError::RecordTooLarge {
                len: record.len(),
                capacity: self.capacity,
            });
        }

        let mut frame = Vec::with_capacity(frame_len);
        frame.extend_from_slice(&(record.len() as u32).to_be_bytes());
        frame.extend_from_slice(record);

        let active = self.chunks.last_mut().expect("container has a chunk");
        match active.append(self.io.as_ref(), self.capacity, &frame) {
            Ok(pos) => Ok(active.begin + pos),
            Err(ChunkAppendError::Io(source)) => Err(source.into()),
            Err(ChunkAppendError::Overflow) => {
                let begin = active.end();
                let mut next = Chunk::create(self.io.as_ref(), &self.dir, begin)?;
                let pos = match next.append(self.io.as_ref(), self.capacity, &frame) {
                    Ok(pos) => pos,
                    Err(ChunkAppendError::Io(source)) => return Err(source.into()),
                    Err(ChunkAppendError::Overflow) => {
                        unreachable!("record fits capacity but overflowed a fresh chunk")
                    }
                };
                self.chunks.push(next);
                Ok(begin + pos)
            }
        }
    }

    /// Index of the chunk containing `offset`.
    fn chunk_index_for(&self, offset: u64) -> Result<usize, StorageError> {
        let idx = match self
            .chunks
            .binary_search_by_key(&offset, |chunk| chunk.begin)
        {
            Ok(idx) => idx,
            Err(0) => {
                return Err(StorageError::OffsetOutOfRange {
                    offset,
                    len: self.len(),
                });
            }
            Err(idx) => idx - 1,
        };
        if offset >= self.chunks[idx].end() {
            return Err(StorageError::OffsetOutOfRange {
                offset,
                len: self.len(),
            });
        }
        Ok(idx)
    }

    /// Reads the record starting at the given container offset.
    pub fn get(&self, offset: u64) -> Result<Vec<u8>, StorageError> {
        let chunk = &self.chunks[self.chunk_index_for(offset)?];
        let pos = offset - chunk.begin;
        self.read_record(chunk, pos).map(|(record, _)| record)
    }

    fn read_record(&self, chunk: &Chunk, pos: u64) -> Result<(Vec<u8>, u64), StorageError> {
        if pos + LEN_PREFIX_BYTES as u64 > chunk.len {
            return Err(StorageError::OffsetOutOfRange {
                offset: chunk.begin + pos,
                len: self.len(),
            });
        }

        let mut len_buf = [0u8; LEN_PREFIX_BYTES];
        self.io.read_exact_at(&chunk.handle, pos, &mut len_buf)?;
        let record_len = u64::from(u32::from_be_bytes(len_buf));

        if pos + LEN_PREFIX_BYTES as u64 + record_len > chunk.len {
            return Err(StorageError::Corrupt {
                path: chunk.path.clone(),
                reason: format!(
                    "record at {} claims {} bytes but chunk holds {}",
                    chunk.begin + pos,
                    record_len,
                    chunk.len
                ),
            });
        }

        let mut record = vec![0u8; record_len as usize];
        self.io
            .read_exact_at(&chunk.handle, pos + LEN_PREFIX_BYTES as u64, &mut record)?;
        Ok((record, pos + LEN_PREFIX_BYTES as u64 + record_len))
    }

    /// Truncates the container so it ends at `offset`.
    ///
    /// Chunks entirely past `offset` are unlinked, the chunk containing
    /// `offset` is cut down, and a fresh active chunk is opened at the
    /// truncation point.
    pub fn truncate(&mut self, offset: u64) -> Result<(), StorageError> {
        if offset > self.len() {
            return Err(StorageError::OffsetOutOfRange {
                offset,
                len: self.len(),
            });
        }

        while let Some(last) = self.chunks.last() {
            if last.begin < offset {
                break;
            }
            let chunk = self.chunks.pop().expect("last chunk exists");
            drop(chunk.handle);
            fs::remove_file(&chunk.path)?;
        }

        if let Some(last) = self.chunks.last_mut() {
            let new_len = offset - last.begin;
            if new_len < last.len {
                self.io.set_len(&last.handle, new_len)?;
                last.len = new_len;
            }
        }

        self.chunks
            .push(Chunk::create(self.io.as_ref(), &self.dir, offset)?);
        Ok(())
    }

    /// Iterates all records in container order.
    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter {
            container: self,
            chunk_idx: 0,
            pos: 0,
        }
    }

    /// Forces written data to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        let active = self.chunks.last().expect("container has a chunk");
        self.io.fsync(&active.handle)?;
        Ok(())
    }

    /// Flushes and closes every chunk file.
    pub fn close(mut self) -> Result<(), StorageError> {
        self.flush()?;
        for chunk in self.chunks.drain(..) {
            self.io.close(chunk.handle)?;
        }
        Ok(())
    }
}

/// Iterator over `(offset, record)` pairs of a [`ChunkContainer`].
pub struct RecordIter<'a> {
    container: &'a ChunkContainer,
    chunk_idx: usize,
    pos: u64,
}

impl Iterator for RecordIter<'_> {
    type Item = Result<(u64, Vec<u8>), StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = self.container.chunks.get(self.chunk_idx)?;
            if self.pos + LEN_PREFIX_BYTES as u64 > chunk.len {
                self.chunk_idx += 1;
                self.pos = 0;
                continue;
            }
            let offset = chunk.begin + self.pos;
            return match self.container.read_record(chunk, self.pos) {
                Ok((record, next_pos)) => {
                    self.pos = next_pos;
                    Some(Ok((offset, record)))
                }
                Err(e) => {
                    // Stop after a corrupt record; later offsets are unreliable.
                    self.chunk_idx = self.container.chunks.len();
                    Some(Err(e))
                }
            };
        }
    }
}

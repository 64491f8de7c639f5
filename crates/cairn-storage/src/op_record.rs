//! Op record type for the journal log files.
//!
//! Every mutation of the store is described by one fixed-size op record
//! appended to a segment's log file. The record names the operation, the
//! key, and where the affected value lives.
//!
//! # Record Format
//!
//! ```text
//! [op:u8][key:16B][segment:u32][offset:u64]
//!   1B     16B        4B           8B        = 29 bytes
//! ```
//!
//! All integers are big-endian. The value length is deliberately absent:
//! the data-file value record is itself length-prefixed, so the length is
//! recovered from the record header at `offset` when the value is read.

use cairn_types::{Fingerprint, JournalLocation, OpKind, SegmentId};

use crate::StorageError;

/// On-disk size of an op record in bytes.
pub const OP_RECORD_BYTES: usize = 29;

// Field offsets within the encoded record.
const KEY_START: usize = 1;
const SEGMENT_START: usize = 17;
const OFFSET_START: usize = 21;

/// A single operation in a segment's journal log.
///
/// An ADD records that a value for `key` was appended to `segment`'s data
/// file at `offset`; a DEL records that the value previously added at that
/// location is dead. Updates are expressed as an ADD of the new revision
/// followed by a DEL of the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpRecord {
    kind: OpKind,
    key: Fingerprint,
    segment: SegmentId,
    offset: u64,
}

impl OpRecord {
    /// Creates a new op record.
    pub fn new(kind: OpKind, key: Fingerprint, segment: SegmentId, offset: u64) -> Self {
        Self {
            kind,
            key,
            segment,
            offset,
        }
    }

    /// Creates the DEL record cancelling this ADD.
    ///
    /// The DEL keeps the target's location so replay can attribute the
    /// refcount decrement to the right segment.
    pub fn cancelling(&self) -> Self {
        Self {
            kind: OpKind::Del,
            ..*self
        }
    }

    /// Returns the operation kind.
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Returns the key this operation concerns.
    pub fn key(&self) -> Fingerprint {
        self.key
    }

    /// Returns the segment holding the affected value.
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    /// Returns the value's offset within the data-file body.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the affected value's location.
    pub fn location(&self) -> JournalLocation {
        JournalLocation::new(self.segment, self.offset)
    }

    /// Serializes the record into its fixed 29-byte form.
    pub fn to_bytes(&self) -> [u8; OP_RECORD_BYTES] {
        let mut buf = [0u8; OP_RECORD_BYTES];
        buf[0] = self.kind.as_byte();
        buf[KEY_START..SEGMENT_START].copy_from_slice(self.key.as_bytes());
        buf[SEGMENT_START..OFFSET_START].copy_from_slice(&self.segment.as_u32().to_be_bytes());
        buf[OFFSET_START..].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    /// Appends the encoded record to a buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_bytes());
    }

    /// Deserializes a record from the first 29 bytes of `data`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::TruncatedOpRecord`] if fewer than 29 bytes remain
    /// - [`StorageError::UnknownOpKind`] if the op byte is not ADD or DEL
    ///   (replay treats this as warn-and-skip)
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < OP_RECORD_BYTES {
            return Err(StorageError::TruncatedOpRecord {
                expected: OP_RECORD_BYTES,
                actual: data.len(),
            });
        }

        let kind = OpKind::from_byte(data[0]).ok_or(StorageError::UnknownOpKind { byte: data[0] })?;

        let key = Fingerprint::from_slice(&data[KEY_START..SEGMENT_START])
            .expect("slice is exactly 16 bytes after bounds check");

        let segment = SegmentId::new(u32::from_be_bytes(
            data[SEGMENT_START..OFFSET_START]
                .try_into()
                .expect("slice is exactly 4 bytes after bounds check"),
        ));

        let offset = u64::from_be_bytes(
            data[OFFSET_START..OP_RECORD_BYTES]
                .try_into()
                .expect("slice is exactly 8 bytes after bounds check"),
        );

        Ok(Self {
            kind,
            key,
            segment,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Fingerprint {
        Fingerprint::new([byte; 16])
    }

    #[test]
    fn encode_decode_round_trip() {
        let record = OpRecord::new(OpKind::Add, key(0x5a), SegmentId::new(7), 123_456);
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), OP_RECORD_BYTES);

        let decoded = OpRecord::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn layout_is_big_endian() {
        let record = OpRecord::new(OpKind::Del, key(0), SegmentId::new(0x0102_0304), 0x0506);
        let bytes = record.to_bytes();
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[17..21], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[21..29], &[0, 0, 0, 0, 0, 0, 0x05, 0x06]);
    }

    #[test]
    fn cancelling_flips_kind_only() {
        let add = OpRecord::new(OpKind::Add, key(9), SegmentId::new(3), 42);
        let del = add.cancelling();
        assert_eq!(del.kind(), OpKind::Del);
        assert_eq!(del.key(), add.key());
        assert_eq!(del.location(), add.location());
    }

    #[test_case::test_case(0x00; "zero is reserved")]
    #[test_case::test_case(0x03; "one past del")]
    #[test_case::test_case(0x7f; "garbage")]
    #[test_case::test_case(0xff; "all bits")]
    fn unknown_op_byte_is_rejected(bad: u8) {
        let mut bytes = OpRecord::new(OpKind::Add, key(1), SegmentId::FIRST, 0).to_bytes();
        bytes[0] = bad;
        assert!(matches!(
            OpRecord::from_bytes(&bytes),
            Err(StorageError::UnknownOpKind { byte }) if byte == bad
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = OpRecord::new(OpKind::Add, key(1), SegmentId::FIRST, 0).to_bytes();
        assert!(matches!(
            OpRecord::from_bytes(&bytes[..28]),
            Err(StorageError::TruncatedOpRecord {
                expected: 29,
                actual: 28
            })
        ));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let record = OpRecord::new(OpKind::Add, key(3), SegmentId::new(2), 99);
        let mut buf = Vec::new();
        record.encode_into(&mut buf);
        buf.extend_from_slice(&[0xff; 10]);
        assert_eq!(OpRecord::from_bytes(&buf).unwrap(), record);
    }
}

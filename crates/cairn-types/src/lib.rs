//! # cairn-types: Core Domain Types for Cairn
//!
//! Shared vocabulary for the Cairn key/value store:
//!
//! - [`Fingerprint`] — the 16-byte opaque key
//! - [`OpKind`] — journal operation discriminants (ADD / DEL)
//! - [`SegmentId`] — serial number of a segment pair
//! - [`JournalLocation`] — where a record lives (segment + body offset)
//!
//! All types are small `Copy` values with no I/O. Serde support exists for
//! the checkpoint file; fingerprints serialize as lowercase hex so they can
//! be used as JSON map keys.

use std::fmt::{self, Display, Write as _};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Errors constructing a [`Fingerprint`] from caller-supplied bytes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FingerprintError {
    /// Key material has the wrong length.
    #[error("fingerprint must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex string could not be decoded.
    #[error("invalid fingerprint hex: {0:?}")]
    InvalidHex(String),
}

/// A 16-byte opaque key, typically an MD5 digest of the stored entity.
///
/// Equality and hashing are by byte content. The store never interprets
/// the bytes; callers are responsible for producing well-distributed
/// fingerprints (a cryptographic digest qualifies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Fingerprint length in bytes.
    pub const SIZE: usize = 16;

    /// Creates a fingerprint from an owned byte array.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a fingerprint from a byte slice, validating its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FingerprintError> {
        let arr: [u8; 16] =
            bytes
                .try_into()
                .map_err(|_| FingerprintError::InvalidLength {
                    expected: Self::SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns a stable 64-bit reduction of the fingerprint.
    ///
    /// Fingerprints are digests and therefore uniformly distributed, so the
    /// first 8 bytes (big-endian) are as good a hash as any — and unlike a
    /// process-seeded hasher, the result is identical across runs and
    /// platforms, which the on-disk bucket layout requires.
    pub fn stable_hash(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().expect("fingerprint has 16 bytes"))
    }

    /// Parses a fingerprint from its 32-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, FingerprintError> {
        if s.len() != Self::SIZE * 2 || !s.is_ascii() {
            return Err(FingerprintError::InvalidHex(s.to_string()));
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| FingerprintError::InvalidHex(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::with_capacity(Self::SIZE * 2);
        for byte in &self.0 {
            write!(out, "{byte:02x}")?;
        }
        f.write_str(&out)
    }
}

impl From<[u8; 16]> for Fingerprint {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

// Hex serde so fingerprints can key the checkpoint's JSON resume map.
impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Kind of a journal operation.
///
/// An update is expressed as an ADD of the new revision followed by a DEL
/// of the old one, so these two discriminants are the whole alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// A value was appended to a data file.
    Add,
    /// A previously added value was logically deleted.
    Del,
}

impl OpKind {
    /// Returns the on-disk byte discriminant.
    pub fn as_byte(self) -> u8 {
        match self {
            OpKind::Add => 1,
            OpKind::Del => 2,
        }
    }

    /// Creates an `OpKind` from its byte discriminant.
    ///
    /// Returns `None` for unknown bytes; replay treats those as corrupt
    /// entries to warn about and skip.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(OpKind::Add),
            2 => Some(OpKind::Del),
            _ => None,
        }
    }
}

/// Serial number of a segment pair (`{name}.N` / `{name}.N.log`).
///
/// Serials start at 1 and only ever grow; the highest-numbered segment is
/// the only one open for appending.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SegmentId(u32);

impl SegmentId {
    /// The first segment a fresh store creates.
    pub const FIRST: SegmentId = SegmentId(1);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the serial as a `u32`.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next serial.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SegmentId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SegmentId> for u32 {
    fn from(id: SegmentId) -> Self {
        id.0
    }
}

/// Where a value record lives: a segment and a byte offset into that
/// segment's data-file body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JournalLocation {
    /// Segment holding the record.
    pub segment: SegmentId,
    /// Offset of the record within the data-file body.
    pub offset: u64,
}

impl JournalLocation {
    pub const fn new(segment: SegmentId, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl Display for JournalLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_from_slice_validates_length() {
        assert!(Fingerprint::from_slice(&[0u8; 16]).is_ok());
        assert_eq!(
            Fingerprint::from_slice(&[0u8; 15]),
            Err(FingerprintError::InvalidLength {
                expected: 16,
                actual: 15
            })
        );
        assert_eq!(
            Fingerprint::from_slice(&[0u8; 20]),
            Err(FingerprintError::InvalidLength {
                expected: 16,
                actual: 20
            })
        );
    }

    #[test]
    fn fingerprint_hex_round_trip() {
        let fp = Fingerprint::new([
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ]);
        let hex = fp.to_string();
        assert_eq!(hex, "00112233445566778899aabbccddeeff");
        assert_eq!(Fingerprint::from_hex(&hex).unwrap(), fp);
    }

    #[test]
    fn fingerprint_rejects_bad_hex() {
        assert!(Fingerprint::from_hex("xyz").is_err());
        assert!(Fingerprint::from_hex("00112233445566778899aabbccddee").is_err());
        assert!(Fingerprint::from_hex("g0112233445566778899aabbccddeeff").is_err());
    }

    #[test]
    fn fingerprint_serde_as_hex_string() {
        let fp = Fingerprint::new([0xab; 16]);
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"abababababababababababababababab\"");
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn stable_hash_uses_leading_bytes() {
        let fp = Fingerprint::new([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0, 0, 0, 0, 0, 0, 0, 0,
        ]);
        assert_eq!(fp.stable_hash(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn op_kind_byte_round_trip() {
        assert_eq!(OpKind::from_byte(OpKind::Add.as_byte()), Some(OpKind::Add));
        assert_eq!(OpKind::from_byte(OpKind::Del.as_byte()), Some(OpKind::Del));
        assert_eq!(OpKind::from_byte(0), None);
        assert_eq!(OpKind::from_byte(3), None);
    }

    #[test]
    fn segment_id_ordering_and_next() {
        assert_eq!(SegmentId::FIRST.as_u32(), 1);
        assert_eq!(SegmentId::FIRST.next(), SegmentId::new(2));
        assert!(SegmentId::new(2) > SegmentId::FIRST);
    }
}

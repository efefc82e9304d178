//! Core type definitions for Tarn.

use crate::error::CoreError;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Four bits of the low half of a segment id encode the segment family.
const FAMILY_SHIFT: u32 = 60;
const FAMILY_MASK: u64 = 0xF << FAMILY_SHIFT;

/// Family nibble for data segments (tree structure, small, frequent).
const DATA_FAMILY: u64 = 0xA;
/// Family nibble for bulk segments (large binary values).
const BULK_FAMILY: u64 = 0xB;

/// Identifier of an immutable segment.
///
/// Segment identifiers are 128-bit random values, not content hashes, so
/// writing the same bytes twice produces two distinct segments. The four
/// bits at position 60 of the low half carry the family: `0xA` for data
/// segments, `0xB` for bulk segments.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u128);

impl SegmentId {
    /// Generates a fresh random identifier in the data family.
    #[must_use]
    pub fn random_data() -> Self {
        Self::random_tagged(DATA_FAMILY)
    }

    /// Generates a fresh random identifier in the bulk family.
    #[must_use]
    pub fn random_bulk() -> Self {
        Self::random_tagged(BULK_FAMILY)
    }

    fn random_tagged(family: u64) -> Self {
        let raw = Uuid::new_v4().as_u128();
        let hi = (raw >> 64) as u64;
        let lo = (raw as u64 & !FAMILY_MASK) | (family << FAMILY_SHIFT);
        Self((u128::from(hi) << 64) | u128::from(lo))
    }

    /// Returns whether this identifier belongs to the bulk family.
    #[must_use]
    pub fn is_bulk(self) -> bool {
        (self.0 as u64 & FAMILY_MASK) >> FAMILY_SHIFT == BULK_FAMILY
    }

    /// Returns the raw 128-bit value.
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Creates an identifier from a raw 128-bit value.
    #[must_use]
    pub const fn from_u128(raw: u128) -> Self {
        Self(raw)
    }

    /// Returns the big-endian byte representation.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Creates an identifier from big-endian bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_u128(self.0).hyphenated())
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({self})")
    }
}

impl FromStr for SegmentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|_| CoreError::InvalidRecordId {
            value: s.to_string(),
        })?;
        Ok(Self(uuid.as_u128()))
    }
}

/// Address of a record inside the segment graph: a segment identifier
/// plus a byte offset within that segment.
///
/// Equality is structural; two `RecordId`s naming the same segment and
/// offset are the same record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    /// The segment holding the record.
    pub segment_id: SegmentId,
    /// Byte offset of the record inside the segment.
    pub offset: u32,
}

impl RecordId {
    /// Creates a new record identifier.
    #[must_use]
    pub const fn new(segment_id: SegmentId, offset: u32) -> Self {
        Self { segment_id, offset }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.segment_id, self.offset)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({self})")
    }
}

impl FromStr for RecordId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (segment, offset) = s.split_once(':').ok_or_else(|| CoreError::InvalidRecordId {
            value: s.to_string(),
        })?;
        let segment_id = segment.parse()?;
        let offset =
            u32::from_str_radix(offset, 16).map_err(|_| CoreError::InvalidRecordId {
                value: s.to_string(),
            })?;
        Ok(Self::new(segment_id, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_ids_are_not_bulk() {
        for _ in 0..32 {
            assert!(!SegmentId::random_data().is_bulk());
        }
    }

    #[test]
    fn bulk_ids_are_bulk() {
        for _ in 0..32 {
            assert!(SegmentId::random_bulk().is_bulk());
        }
    }

    #[test]
    fn random_ids_are_distinct() {
        let a = SegmentId::random_data();
        let b = SegmentId::random_data();
        assert_ne!(a, b);
    }

    #[test]
    fn segment_id_byte_roundtrip() {
        let id = SegmentId::random_bulk();
        assert_eq!(SegmentId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn segment_id_string_roundtrip() {
        let id = SegmentId::random_data();
        let parsed: SegmentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn record_id_string_roundtrip() {
        let id = RecordId::new(SegmentId::random_data(), 0xCAFE);
        let parsed: RecordId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn record_id_structural_equality() {
        let segment = SegmentId::random_data();
        assert_eq!(RecordId::new(segment, 7), RecordId::new(segment, 7));
        assert_ne!(RecordId::new(segment, 7), RecordId::new(segment, 8));
    }

    #[test]
    fn invalid_record_id_rejected() {
        assert!(matches!(
            "not a record id".parse::<RecordId>(),
            Err(CoreError::InvalidRecordId { .. })
        ));
        assert!(matches!(
            "0ed90b02-b6ab-4e23-9f6d-2b8c9a6cf3a1:zzzz".parse::<RecordId>(),
            Err(CoreError::InvalidRecordId { .. })
        ));
    }
}

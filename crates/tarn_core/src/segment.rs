//! Immutable segments and the record envelope.
//!
//! A segment is an immutable byte buffer identified by a random 128-bit
//! [`SegmentId`]. Data segments hold a sequence of framed records; bulk
//! segments hold one raw binary value with no framing. Once a segment has
//! been written to a container file it is never mutated.

use crate::error::{CoreError, CoreResult};
use crate::types::SegmentId;
use std::sync::Arc;

/// Size of the record length prefix.
const RECORD_LEN_SIZE: usize = 4;
/// Size of the trailing record checksum.
const RECORD_CRC_SIZE: usize = 4;

/// An immutable segment loaded into memory.
#[derive(Debug, Clone)]
pub struct Segment {
    id: SegmentId,
    data: Arc<Vec<u8>>,
}

impl Segment {
    /// Creates a segment over the given bytes.
    #[must_use]
    pub fn new(id: SegmentId, data: Vec<u8>) -> Self {
        Self {
            id,
            data: Arc::new(data),
        }
    }

    /// Returns the segment identifier.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the segment length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether the segment is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the raw segment bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the payload of the record starting at `offset`.
    ///
    /// Records are framed as `[len u32][payload][crc32 u32]` where `len`
    /// covers the whole frame and the checksum covers everything before
    /// it. The frame is validated before the payload is returned.
    ///
    /// # Errors
    ///
    /// Returns `SegmentCorruption` if the offset or length is out of
    /// bounds, or `ChecksumMismatch` if the stored checksum does not
    /// match the frame contents.
    pub fn record_payload(&self, offset: u32) -> CoreResult<&[u8]> {
        let start = offset as usize;
        let data: &[u8] = &self.data;

        if start + RECORD_LEN_SIZE + RECORD_CRC_SIZE > data.len() {
            return Err(CoreError::segment_corruption(format!(
                "record offset {offset} beyond segment of {} bytes",
                data.len()
            )));
        }

        let len_bytes = &data[start..start + RECORD_LEN_SIZE];
        let total = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;

        if total < RECORD_LEN_SIZE + RECORD_CRC_SIZE || start + total > data.len() {
            return Err(CoreError::segment_corruption(format!(
                "record at offset {offset} extends beyond segment"
            )));
        }

        let crc_start = start + total - RECORD_CRC_SIZE;
        let stored = u32::from_le_bytes([
            data[crc_start],
            data[crc_start + 1],
            data[crc_start + 2],
            data[crc_start + 3],
        ]);
        let computed = compute_crc32(&data[start..crc_start]);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        Ok(&data[start + RECORD_LEN_SIZE..crc_start])
    }
}

/// Frames a record payload for appending to a data segment.
///
/// The returned bytes are `[len u32][payload][crc32 u32]`, the inverse of
/// [`Segment::record_payload`].
#[must_use]
pub(crate) fn frame_record(payload: &[u8]) -> Vec<u8> {
    let total = RECORD_LEN_SIZE + payload.len() + RECORD_CRC_SIZE;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // Simple CRC32 implementation (IEEE polynomial)
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_values() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn record_frame_roundtrip() {
        let payload = b"a tree record".to_vec();
        let framed = frame_record(&payload);

        let segment = Segment::new(SegmentId::random_data(), framed);
        assert_eq!(segment.record_payload(0).unwrap(), payload.as_slice());
    }

    #[test]
    fn multiple_records_addressed_by_offset() {
        let mut data = Vec::new();
        let first = frame_record(b"first");
        let second = frame_record(b"second");
        data.extend_from_slice(&first);
        let second_offset = data.len() as u32;
        data.extend_from_slice(&second);

        let segment = Segment::new(SegmentId::random_data(), data);
        assert_eq!(segment.record_payload(0).unwrap(), b"first");
        assert_eq!(segment.record_payload(second_offset).unwrap(), b"second");
    }

    #[test]
    fn corrupted_record_detected() {
        let mut framed = frame_record(b"payload");
        framed[5] ^= 0xFF;

        let segment = Segment::new(SegmentId::random_data(), framed);
        assert!(matches!(
            segment.record_payload(0),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn out_of_bounds_offset_rejected() {
        let segment = Segment::new(SegmentId::random_data(), frame_record(b"x"));
        assert!(matches!(
            segment.record_payload(1000),
            Err(CoreError::SegmentCorruption { .. })
        ));
    }
}

//! The fixed-format header stamped at byte 0 of every segment.

use crc32fast::Hasher;

use vtm_core::error::{Error, Result};
use vtm_core::limits::SEGMENT_SEAL;

/// Bytes occupied by [`SegmentHeader`] on disk, aligned to 16 bytes so the
/// topology's slot table starts on an aligned boundary.
pub const SEGMENT_HEADER_SIZE: u32 = 16;

/// Header written at offset 0 of every segment.
///
/// On-disk layout (host-endian, not portable across machine endianness):
/// `seal: [u8; 4] | segment_size: u32 | checksum: u32 | reserved: [u8; 4]`.
/// `checksum` is the CRC-32 of the seal and `segment_size` fields, guarding
/// against a torn or partially-zeroed header that still happens to carry the
/// right seal bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    segment_size: u32,
}

impl SegmentHeader {
    /// Build a header for a segment of the given size.
    pub fn new(segment_size: u32) -> Self {
        SegmentHeader { segment_size }
    }

    /// The fixed per-segment size this database was created with.
    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    fn checksum(segment_size: u32) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&SEGMENT_SEAL);
        hasher.update(&segment_size.to_ne_bytes());
        hasher.finalize()
    }

    /// Serialize into the fixed-size on-disk representation.
    pub fn to_bytes(self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&SEGMENT_SEAL);
        bytes[4..8].copy_from_slice(&self.segment_size.to_ne_bytes());
        bytes[8..12].copy_from_slice(&Self::checksum(self.segment_size).to_ne_bytes());
        bytes
    }

    /// Parse a header from raw bytes, validating the seal and checksum.
    ///
    /// Returns [`Error::Corruption`] when the seal is absent or mismatched,
    /// or the checksum doesn't match: an absent or mismatched seal means the
    /// file isn't one of ours, or is damaged.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SEGMENT_HEADER_SIZE as usize {
            return Err(Error::Corruption(format!(
                "segment header truncated: expected {SEGMENT_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0..4] != SEGMENT_SEAL {
            return Err(Error::Corruption(format!(
                "segment seal mismatch: expected {:?}, got {:?}",
                SEGMENT_SEAL,
                &bytes[0..4]
            )));
        }
        let segment_size = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
        let checksum = u32::from_ne_bytes(bytes[8..12].try_into().unwrap());
        if checksum != Self::checksum(segment_size) {
            return Err(Error::Corruption(format!(
                "segment header checksum mismatch: expected {:#x}, got {:#x}",
                Self::checksum(segment_size),
                checksum
            )));
        }
        Ok(SegmentHeader { segment_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = SegmentHeader::new(1024 * 1024);
        let bytes = header.to_bytes();
        let parsed = SegmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.segment_size(), 1024 * 1024);
    }

    #[test]
    fn rejects_bad_seal() {
        let mut bytes = SegmentHeader::new(4096).to_bytes();
        bytes[0] = b'x';
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn rejects_tampered_segment_size_via_checksum() {
        let mut bytes = SegmentHeader::new(4096).to_bytes();
        // Flip a bit in segment_size without touching the seal or checksum.
        bytes[4] ^= 0x01;
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let bytes = [0u8; 4];
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(Error::Corruption(_))
        ));
    }
}

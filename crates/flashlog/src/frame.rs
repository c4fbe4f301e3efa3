//! On-flash record framing.
//!
//! A record occupies a whole number of blocks and never crosses a segment
//! boundary. All fixed fields are big-endian:
//!
//! ```text
//! offset 0            u64  segment_id
//! offset 8            u32  serialized_size   (RECORD_OVERHEAD + payload len)
//! offset 12           u64  header_checksum   (CRC32 of bytes 0..12, widened)
//! offset 20           ...  payload
//! offset 20+payload   u64  payload_checksum  (CRC32 of the payload, widened)
//! remaining tail           zero padding to the block boundary
//! ```
//!
//! The checksums are split so that a damaged `serialized_size` is caught by
//! the header checksum before it is ever used to index into the buffer.

use byteorder::{BigEndian, ByteOrder};

use crate::config::{block_count, SegmentId, BLOCK_SIZE, MIN_SERIALIZED_SIZE, RECORD_OVERHEAD};
use crate::error::{CommitLogError, CommitLogResult};

/// Byte offset of the payload within a frame.
pub const PAYLOAD_OFFSET: usize = 20;

/// Outcome of decoding one frame out of a segment buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome<'a> {
    /// A validated record.
    Valid {
        payload: &'a [u8],
        block_count: u32,
    },
    /// The bytes do not belong to the expected segment: the clean tail of the
    /// segment, not corruption.
    EndOfRecords,
    /// A record that fails validation. Scanning must not continue past it.
    Corrupt(&'static str),
}

/// Blocks needed to frame a payload of the given length.
#[inline]
pub fn framed_block_count(payload_len: usize) -> u64 {
    block_count((RECORD_OVERHEAD + payload_len) as u64)
}

/// Encode one record into `out`, zero-padding to the next block boundary.
///
/// Returns the number of blocks written. Fails with
/// [`CommitLogError::RecordTooLarge`] when the framed record does not fit
/// `out`. Payloads shorter than `MIN_SERIALIZED_SIZE - RECORD_OVERHEAD` bytes
/// are indistinguishable from corruption on decode; host mutations always
/// exceed that floor.
pub fn encode(segment_id: SegmentId, payload: &[u8], out: &mut [u8]) -> CommitLogResult<u32> {
    encode_with(segment_id, payload.len(), out, |dst| {
        dst.copy_from_slice(payload);
        Ok(())
    })
}

/// Like [`encode`], but the payload bytes are produced by `write` directly
/// into the frame, so callers can serialize a mutation into a staging buffer
/// without an intermediate copy. `write` receives exactly `payload_len`
/// bytes.
pub fn encode_with<F>(
    segment_id: SegmentId,
    payload_len: usize,
    out: &mut [u8],
    write: F,
) -> CommitLogResult<u32>
where
    F: FnOnce(&mut [u8]) -> CommitLogResult<()>,
{
    let serialized_size = RECORD_OVERHEAD + payload_len;
    let blocks = block_count(serialized_size as u64);
    let frame_len = blocks as usize * BLOCK_SIZE;
    if frame_len > out.len() {
        return Err(CommitLogError::RecordTooLarge {
            needed: blocks,
            capacity: (out.len() / BLOCK_SIZE) as u64,
        });
    }

    BigEndian::write_u64(&mut out[0..8], segment_id.as_u64());
    BigEndian::write_u32(&mut out[8..12], serialized_size as u32);
    let header_crc = crc32_widened(&out[0..12]);
    BigEndian::write_u64(&mut out[12..PAYLOAD_OFFSET], header_crc);

    let payload_end = PAYLOAD_OFFSET + payload_len;
    write(&mut out[PAYLOAD_OFFSET..payload_end])?;
    let payload_crc = crc32_widened(&out[PAYLOAD_OFFSET..payload_end]);
    BigEndian::write_u64(&mut out[payload_end..serialized_size], payload_crc);

    // The staging buffer is reused across appends; stale bytes in the final
    // block must not reach the device.
    out[serialized_size..frame_len].fill(0);

    Ok(blocks as u32)
}

/// Decode the frame at the start of `bytes`, validating it against the
/// segment it is expected to live in.
pub fn decode(bytes: &[u8], expected_segment_id: SegmentId) -> DecodeOutcome<'_> {
    if bytes.len() < RECORD_OVERHEAD {
        return DecodeOutcome::EndOfRecords;
    }

    let segment_id = BigEndian::read_u64(&bytes[0..8]);
    if segment_id != expected_segment_id.as_u64() {
        return DecodeOutcome::EndOfRecords;
    }

    let serialized_size = BigEndian::read_u32(&bytes[8..12]);
    if serialized_size < MIN_SERIALIZED_SIZE {
        return DecodeOutcome::Corrupt("size");
    }

    let claimed_header_crc = BigEndian::read_u64(&bytes[12..PAYLOAD_OFFSET]);
    if crc32_widened(&bytes[0..12]) != claimed_header_crc {
        return DecodeOutcome::Corrupt("header-crc");
    }

    // The header checksum has vouched for serialized_size; it is now safe to
    // index with it.
    let serialized_size = serialized_size as usize;
    let blocks = block_count(serialized_size as u64);
    if blocks as usize * BLOCK_SIZE > bytes.len() {
        return DecodeOutcome::Corrupt("length");
    }

    let payload_end = serialized_size - 8;
    let payload = &bytes[PAYLOAD_OFFSET..payload_end];
    let claimed_payload_crc = BigEndian::read_u64(&bytes[payload_end..serialized_size]);
    if crc32_widened(payload) != claimed_payload_crc {
        return DecodeOutcome::Corrupt("payload-crc");
    }

    DecodeOutcome::Valid {
        payload,
        block_count: blocks as u32,
    }
}

/// CRC32 of `bytes`, widened to the u64 slot the frame stores it in.
fn crc32_widened(bytes: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_for(payload: &[u8], segment_id: u64) -> (Vec<u8>, u32) {
        let mut buf = vec![0xAAu8; 4 * BLOCK_SIZE];
        let blocks = encode(SegmentId::new(segment_id), payload, &mut buf).expect("encode");
        (buf, blocks)
    }

    #[test]
    fn round_trip_small_payload() {
        let payload = b"hello commit log";
        let (buf, blocks) = frame_for(payload, 9);
        assert_eq!(blocks, 1);
        match decode(&buf, SegmentId::new(9)) {
            DecodeOutcome::Valid {
                payload: decoded,
                block_count,
            } => {
                assert_eq!(decoded, payload);
                assert_eq!(block_count, 1);
            }
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_block_spanning_payload() {
        // 4096-byte payload plus overhead needs two blocks.
        let payload = vec![0x5Au8; BLOCK_SIZE];
        let (buf, blocks) = frame_for(&payload, 3);
        assert_eq!(blocks, 2);
        match decode(&buf, SegmentId::new(3)) {
            DecodeOutcome::Valid {
                payload: decoded,
                block_count,
            } => {
                assert_eq!(decoded, payload.as_slice());
                assert_eq!(block_count, 2);
            }
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn padding_is_zeroed() {
        let payload = vec![7u8; 100];
        let (buf, _) = frame_for(&payload, 1);
        let serialized_size = RECORD_OVERHEAD + payload.len();
        assert!(buf[serialized_size..BLOCK_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn foreign_segment_id_is_clean_tail() {
        let (buf, _) = frame_for(&[1u8; 64], 5);
        assert_eq!(decode(&buf, SegmentId::new(6)), DecodeOutcome::EndOfRecords);
    }

    #[test]
    fn zeroed_block_is_clean_tail() {
        let buf = vec![0u8; BLOCK_SIZE];
        assert_eq!(decode(&buf, SegmentId::new(1)), DecodeOutcome::EndOfRecords);
    }

    #[test]
    fn damaged_size_field_caught_by_header_crc() {
        let (mut buf, _) = frame_for(&[2u8; 64], 5);
        buf[10] ^= 0xFF;
        assert_eq!(
            decode(&buf, SegmentId::new(5)),
            DecodeOutcome::Corrupt("header-crc")
        );
    }

    #[test]
    fn damaged_payload_caught_by_payload_crc() {
        let (mut buf, _) = frame_for(&[3u8; 200], 5);
        buf[PAYLOAD_OFFSET + 40] ^= 0x01;
        assert_eq!(
            decode(&buf, SegmentId::new(5)),
            DecodeOutcome::Corrupt("payload-crc")
        );
    }

    #[test]
    fn undersized_record_is_corrupt() {
        let mut buf = vec![0u8; BLOCK_SIZE];
        BigEndian::write_u64(&mut buf[0..8], 5);
        BigEndian::write_u32(&mut buf[8..12], MIN_SERIALIZED_SIZE - 1);
        assert_eq!(decode(&buf, SegmentId::new(5)), DecodeOutcome::Corrupt("size"));
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; 2 * BLOCK_SIZE];
        let mut small = vec![0u8; BLOCK_SIZE];
        match encode(SegmentId::new(1), &payload, &mut small) {
            Err(CommitLogError::RecordTooLarge { needed, capacity }) => {
                assert_eq!(needed, 3);
                assert_eq!(capacity, 1);
            }
            other => panic!("expected RecordTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn framed_block_count_matches_encode() {
        for len in [10usize, 100, BLOCK_SIZE - RECORD_OVERHEAD, BLOCK_SIZE, 3 * BLOCK_SIZE] {
            let payload = vec![1u8; len];
            let mut buf = vec![0u8; 8 * BLOCK_SIZE];
            let blocks = encode(SegmentId::new(1), &payload, &mut buf).expect("encode");
            assert_eq!(blocks as u64, framed_block_count(len));
        }
    }
}

//! Binary format of log records
//!
//! Every record is a 32-byte header followed by a payload:
//! `key_len(u16) + value_len(u32) + op(u8) + pad(u8) + key + value`.
//! The header checksum covers the whole payload, so a record is either
//! intact or rejected as a unit.

use std::path::Path;

use crate::config::DiskConfig;
use crate::error::{DiskError, DiskResult};

/// Magic bytes opening every record: "STOW"
pub const MAGIC_ARRAY: [u8; 4] = *b"STOW";

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Fixed payload prefix before the key bytes
const PAYLOAD_PREFIX: usize = 8;

/// Record operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Store the value under the key
    Put = 1,
    /// Remove the key
    Delete = 2,
    /// Everything before this record is superseded (written by compaction)
    Checkpoint = 3,
}

impl Op {
    fn from_byte(byte: u8) -> Option<Op> {
        match byte {
            1 => Some(Op::Put),
            2 => Some(Op::Delete),
            3 => Some(Op::Checkpoint),
            _ => None,
        }
    }
}

/// Fixed-size record header.
///
/// Layout:
///   [0..4]   magic:    "STOW"
///   [4..8]   length:   u32 - payload length in bytes
///   [8..12]  checksum: u32 - CRC32C of the payload
///   [12]     op:       u8
///   [13..32] zero padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub op: u8,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.op;
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            op: bytes[12],
        }
    }
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub op: Op,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Bytes this record occupies on disk.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + PAYLOAD_PREFIX + self.key.len() + self.value.len()
    }
}

/// Encode one record, enforcing the size limits of `config`.
///
/// Sizes are checked before anything is allocated.
pub fn encode_record(op: Op, key: &[u8], value: &[u8], config: &DiskConfig) -> DiskResult<Vec<u8>> {
    if key.len() > config.max_key_size {
        return Err(DiskError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: config.max_key_size as u64,
            component: "key".to_string(),
        });
    }
    if value.len() > config.max_value_size {
        return Err(DiskError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: config.max_value_size as u64,
            component: "value".to_string(),
        });
    }

    let payload_len = PAYLOAD_PREFIX + key.len() + value.len();
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_len);
    buffer.resize(HEADER_SIZE, 0);
    buffer.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buffer.push(op as u8);
    buffer.push(0);
    buffer.extend_from_slice(key);
    buffer.extend_from_slice(value);

    let header = RecordHeader {
        magic: MAGIC_ARRAY,
        length: payload_len as u32,
        checksum: crc32c::crc32c(&buffer[HEADER_SIZE..]),
        op: op as u8,
    };
    buffer[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Ok(buffer)
}

/// Decode the record starting at `data[0]`, which sits at `offset` in `path`.
///
/// Returns the record and the number of bytes it occupies.
pub fn decode_record(data: &[u8], path: &Path, offset: u64) -> DiskResult<(LogRecord, usize)> {
    let Some(header_bytes) =
        data.get(..HEADER_SIZE).and_then(|bytes| <&[u8; HEADER_SIZE]>::try_from(bytes).ok())
    else {
        return Err(DiskError::TornWrite {
            path: path.to_path_buf(),
            expected_size: HEADER_SIZE as u32,
            available_bytes: data.len() as u64,
            offset,
        });
    };
    let header = RecordHeader::from_bytes(header_bytes);
    if header.magic != MAGIC_ARRAY {
        return Err(DiskError::NoMagicFound {
            path: path.to_path_buf(),
            offset,
            found_bytes: header.magic,
        });
    }

    let total = HEADER_SIZE + header.length as usize;
    let Some(payload) = data.get(HEADER_SIZE..total) else {
        return Err(DiskError::TornWrite {
            path: path.to_path_buf(),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: offset + HEADER_SIZE as u64,
        });
    };

    let actual = crc32c::crc32c(payload);
    if actual != header.checksum {
        return Err(DiskError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum,
            actual,
            offset: offset + HEADER_SIZE as u64,
        });
    }

    let corrupted = |reason: String| DiskError::LogCorrupted {
        path: path.to_path_buf(),
        offset: offset + HEADER_SIZE as u64,
        reason,
    };
    if payload.len() < PAYLOAD_PREFIX {
        return Err(corrupted("payload too short for record fields".to_string()));
    }
    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let value_len = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;
    let op =
        Op::from_byte(payload[6]).ok_or_else(|| corrupted(format!("invalid op {}", payload[6])))?;

    let key_end = PAYLOAD_PREFIX + key_len;
    let value_end = key_end + value_len;
    if payload.len() != value_end {
        return Err(corrupted(format!(
            "payload is {} bytes, fields need {} (key {} + value {})",
            payload.len(),
            value_end,
            key_len,
            value_len
        )));
    }

    let record = LogRecord {
        op,
        key: payload[PAYLOAD_PREFIX..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
    };
    Ok((record, total))
}

/// Offset of the next magic at or after `start`, for resyncing past damage.
pub fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    buffer
        .get(start..)?
        .windows(MAGIC_ARRAY.len())
        .position(|window| window == MAGIC_ARRAY)
        .map(|found| start + found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn path() -> PathBuf {
        PathBuf::from("<test>")
    }

    #[test]
    fn test_record_roundtrip() {
        let config = DiskConfig::default();
        let encoded = encode_record(Op::Put, b"session", br#"{"a":1}"#, &config).unwrap();
        let (record, used) = decode_record(&encoded, &path(), 0).unwrap();

        assert_eq!(used, encoded.len());
        assert_eq!(record.encoded_len(), encoded.len());
        assert_eq!(record.op, Op::Put);
        assert_eq!(record.key, b"session");
        assert_eq!(record.value, br#"{"a":1}"#);
    }

    #[test]
    fn test_delete_and_checkpoint_have_no_value() {
        let config = DiskConfig::default();
        for op in [Op::Delete, Op::Checkpoint] {
            let encoded = encode_record(op, b"", b"", &config).unwrap();
            assert_eq!(encoded.len(), HEADER_SIZE + PAYLOAD_PREFIX);
            assert_eq!(decode_record(&encoded, &path(), 0).unwrap().0.op, op);
        }
    }

    #[test]
    fn test_oversized_entries_rejected() {
        let config = DiskConfig::default();
        let key = vec![b'k'; config.max_key_size + 1];
        let result = encode_record(Op::Put, &key, b"1", &config);
        assert!(matches!(
            result,
            Err(DiskError::OversizedEntry { component, .. }) if component == "key"
        ));

        let key = vec![b'k'; config.max_key_size];
        assert!(encode_record(Op::Put, &key, b"1", &config).is_ok());

        let small = DiskConfig { max_value_size: 4, ..DiskConfig::default() };
        let result = encode_record(Op::Put, b"k", b"12345", &small);
        assert!(matches!(
            result,
            Err(DiskError::OversizedEntry { component, .. }) if component == "value"
        ));
    }

    #[test]
    fn test_damage_detected() {
        let config = DiskConfig::default();
        let encoded = encode_record(Op::Put, b"key", b"value", &config).unwrap();

        let mut bad_magic = encoded.clone();
        bad_magic[0] = 0xFF;
        assert!(matches!(
            decode_record(&bad_magic, &path(), 0),
            Err(DiskError::NoMagicFound { .. })
        ));

        let mut bad_payload = encoded.clone();
        let last = bad_payload.len() - 1;
        bad_payload[last] ^= 0xFF;
        assert!(matches!(
            decode_record(&bad_payload, &path(), 0),
            Err(DiskError::ChecksumMismatch { .. })
        ));

        let torn = &encoded[..encoded.len() - 2];
        assert!(matches!(decode_record(torn, &path(), 0), Err(DiskError::TornWrite { .. })));
    }

    #[test]
    fn test_find_next_magic() {
        let config = DiskConfig::default();
        let mut buffer = vec![0u8; 5];
        buffer.extend(encode_record(Op::Put, b"k", b"v", &config).unwrap());
        assert_eq!(find_next_magic(&buffer, 0), Some(5));
        assert_eq!(find_next_magic(&buffer, 6), None);
        assert_eq!(find_next_magic(&buffer, 100), None);
    }
}

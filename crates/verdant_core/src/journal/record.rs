//! Journal record framing.
//!
//! Each record is framed as:
//!
//! ```text
//! | magic "VMQJ" (4) | version u16 LE | type u8 | len u32 LE | CBOR payload | crc32 LE |
//! ```
//!
//! The CRC covers the header and the payload.

use super::error::{JournalError, JournalResult};
use verdant_protocol::{MutationId, MutationRecord};

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"VMQJ";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 2;

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 11;

/// Size of the record checksum in bytes.
pub const CRC_SIZE: usize = 4;

const TYPE_UPSERT: u8 = 1;
const TYPE_REMOVE: u8 = 2;

/// A change to the persisted queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// Insert or replace a record.
    Upsert(MutationRecord),
    /// Drop a record.
    Remove(MutationId),
}

impl JournalRecord {
    fn type_byte(&self) -> u8 {
        match self {
            JournalRecord::Upsert(_) => TYPE_UPSERT,
            JournalRecord::Remove(_) => TYPE_REMOVE,
        }
    }

    /// Encodes the record with its frame header.
    pub fn encode(&self) -> JournalResult<Vec<u8>> {
        let mut payload = Vec::new();
        let result = match self {
            JournalRecord::Upsert(record) => ciborium::into_writer(record, &mut payload),
            JournalRecord::Remove(id) => ciborium::into_writer(id, &mut payload),
        };
        result.map_err(|e| JournalError::Encode(e.to_string()))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| JournalError::Encode(format!("record too large: {} bytes", payload.len())))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&JOURNAL_MAGIC);
        buf.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        buf.push(self.type_byte());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes one framed record at `offset`.
    ///
    /// Returns the record and the offset just past it, `Ok(None)` at a clean
    /// end of input, or an error for a torn or corrupt record.
    pub fn decode_at(bytes: &[u8], offset: usize) -> JournalResult<Option<(Self, usize)>> {
        if offset == bytes.len() {
            return Ok(None);
        }
        let at = offset as u64;
        let header = bytes
            .get(offset..offset + HEADER_SIZE)
            .ok_or_else(|| JournalError::corrupted(at, "truncated header"))?;

        if header[0..4] != JOURNAL_MAGIC {
            return Err(JournalError::corrupted(at, "bad magic"));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != JOURNAL_VERSION {
            return Err(JournalError::UnsupportedVersion {
                found: version,
                expected: JOURNAL_VERSION,
            });
        }
        let record_type = header[6];
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let start = offset + HEADER_SIZE;
        let end = start + len;
        let payload = bytes
            .get(start..end)
            .ok_or_else(|| JournalError::corrupted(at, "truncated payload"))?;
        let stored = bytes
            .get(end..end + CRC_SIZE)
            .ok_or_else(|| JournalError::corrupted(at, "truncated checksum"))?;
        let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let computed = compute_crc32(&bytes[offset..end]);
        if stored != computed {
            return Err(JournalError::corrupted(
                at,
                format!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"),
            ));
        }

        let record = match record_type {
            TYPE_UPSERT => ciborium::from_reader(payload)
                .map(JournalRecord::Upsert)
                .map_err(|e| JournalError::corrupted(at, e.to_string()))?,
            TYPE_REMOVE => ciborium::from_reader(payload)
                .map(JournalRecord::Remove)
                .map_err(|e| JournalError::corrupted(at, e.to_string()))?,
            other => {
                return Err(JournalError::corrupted(
                    at,
                    format!("unknown record type {other}"),
                ))
            }
        };
        Ok(Some((record, end + CRC_SIZE)))
    }
}

/// Computes the CRC32 (IEEE) checksum of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
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
    use verdant_protocol::{MutationKind, MutationPayload, PostId};

    fn upsert() -> JournalRecord {
        JournalRecord::Upsert(
            MutationRecord::new(3, MutationKind::Like, PostId::new("42"), MutationPayload::Like).unwrap(),
        )
    }

    #[test]
    fn header_layout() {
        let bytes = upsert().encode().unwrap();
        assert_eq!(&bytes[0..4], b"VMQJ");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), JOURNAL_VERSION);
        assert_eq!(bytes[6], TYPE_UPSERT);
        let len = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;
        assert_eq!(bytes.len(), HEADER_SIZE + len + CRC_SIZE);
    }

    #[test]
    fn crc32_matches_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut bytes = upsert().encode().unwrap();
        // Last payload byte; the frame still has a valid length.
        let at = bytes.len() - CRC_SIZE - 1;
        bytes[at] ^= 0x01;
        match JournalRecord::decode_at(&bytes, 0) {
            Err(JournalError::Corrupted { offset: 0, message }) => {
                assert!(message.contains("checksum"), "{message}");
            }
            other => panic!("expected checksum error, got {other:?}"),
        }
    }

    #[test]
    fn decode_sequence() {
        let first = upsert();
        let second = JournalRecord::Remove(MutationId::new());
        let mut bytes = first.encode().unwrap();
        bytes.extend(second.encode().unwrap());

        let (a, next) = JournalRecord::decode_at(&bytes, 0).unwrap().unwrap();
        let (b, end) = JournalRecord::decode_at(&bytes, next).unwrap().unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(JournalRecord::decode_at(&bytes, end).unwrap().is_none());
    }

    #[test]
    fn torn_record_is_reported() {
        let bytes = upsert().encode().unwrap();
        let torn = &bytes[..bytes.len() - 3];
        assert!(matches!(
            JournalRecord::decode_at(torn, 0),
            Err(JournalError::Corrupted { offset: 0, .. })
        ));
        assert!(JournalRecord::decode_at(&bytes[..5], 0).is_err());
    }

    #[test]
    fn future_version_is_rejected() {
        let mut bytes = upsert().encode().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            JournalRecord::decode_at(&bytes, 0),
            Err(JournalError::UnsupportedVersion { found: 9, .. })
        ));
    }
}

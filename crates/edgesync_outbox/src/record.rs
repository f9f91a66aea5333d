//! Outbox log record framing.
//!
//! ```text
//! | magic "EOBX" (4) | version u16 | kind u8 | payload len u32 | payload | crc32 |
//! ```
//!
//! All integers are little-endian. The CRC covers header and payload.

use crate::error::{StorageError, StorageResult};

/// Magic bytes identifying an outbox record.
pub const RECORD_MAGIC: [u8; 4] = *b"EOBX";

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// Kind of outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// One CBOR-encoded edge event.
    Event = 1,
    /// Closes an appended batch; payload is its last sequence id.
    Commit = 2,
    /// Written first by a rewrite; payload is the next sequence id.
    Base = 3,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Event),
            2 => Some(Self::Commit),
            3 => Some(Self::Base),
            _ => None,
        }
    }

    /// Converts the record kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded record borrowing from the log bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'a> {
    /// Encoded event.
    Event(&'a [u8]),
    /// Batch end marker.
    Commit {
        /// Last sequence id of the batch.
        last_seq: u64,
    },
    /// Sequence base after a rewrite.
    Base {
        /// Next sequence id to assign.
        next_seq: u64,
    },
}

/// Appends one framed record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, kind: RecordKind, payload: &[u8]) -> StorageResult<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        StorageError::corrupted(format!("record payload too large: {} bytes", payload.len()))
    })?;
    let start = buf.len();
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    buf.push(kind.as_byte());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = compute_crc32(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Appends a commit record for a batch ending at `last_seq`.
pub fn encode_commit(buf: &mut Vec<u8>, last_seq: u64) -> StorageResult<()> {
    encode_record(buf, RecordKind::Commit, &last_seq.to_le_bytes())
}

/// Appends a base record.
pub fn encode_base(buf: &mut Vec<u8>, next_seq: u64) -> StorageResult<()> {
    encode_record(buf, RecordKind::Base, &next_seq.to_le_bytes())
}

/// Sequential reader over log bytes.
///
/// `next_record` returns `Ok(None)` at the end of the log and also on an
/// incomplete trailing record (a torn write). Bad magic, unknown kinds and
/// checksum mismatches are errors.
pub struct RecordReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> RecordReader<'a> {
    /// Starts reading at offset 0.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Offset just past the last record returned.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reads the next record.
    pub fn next_record(&mut self) -> StorageResult<Option<Record<'a>>> {
        let start = self.offset;
        let rest = &self.bytes[start..];
        if rest.len() < HEADER_SIZE {
            return Ok(None);
        }

        if rest[0..4] != RECORD_MAGIC {
            return Err(StorageError::corrupted(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > RECORD_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported version {version} at offset {start}"
            )));
        }

        let kind_byte = rest[6];
        let kind = RecordKind::from_byte(kind_byte).ok_or_else(|| {
            StorageError::corrupted(format!(
                "unknown record kind {kind_byte} at offset {start}"
            ))
        })?;

        let payload_len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if rest.len() < total_len {
            return Ok(None);
        }

        let payload_end = HEADER_SIZE + payload_len;
        let stored = u32::from_le_bytes([
            rest[payload_end],
            rest[payload_end + 1],
            rest[payload_end + 2],
            rest[payload_end + 3],
        ]);
        let computed = compute_crc32(&rest[..payload_end]);
        if stored != computed {
            return Err(StorageError::ChecksumMismatch {
                offset: start as u64,
                expected: stored,
                actual: computed,
            });
        }

        let payload = &rest[HEADER_SIZE..payload_end];
        let record = match kind {
            RecordKind::Event => Record::Event(payload),
            RecordKind::Commit => Record::Commit {
                last_seq: read_u64(payload, start)?,
            },
            RecordKind::Base => Record::Base {
                next_seq: read_u64(payload, start)?,
            },
        };

        self.offset = start + total_len;
        Ok(Some(record))
    }
}

fn read_u64(payload: &[u8], offset: usize) -> StorageResult<u64> {
    let bytes: [u8; 8] = payload.try_into().map_err(|_| {
        StorageError::corrupted(format!(
            "expected 8 byte payload at offset {offset}, got {}",
            payload.len()
        ))
    })?;
    Ok(u64::from_le_bytes(bytes))
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
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

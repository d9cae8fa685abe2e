//! Data log entry types and serialization

use crate::{BucketNumber, Category, Result, SeriesId, TideError, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Data log entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// Points accepted for one bucket
    Points = 1,
}

impl TryFrom<u8> for WalEntryType {
    type Error = TideError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::Points),
            _ => Err(TideError::InvalidFormat(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// One point as it was accepted by the shard
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoggedPoint {
    pub series_id: SeriesId,
    pub timestamp: Timestamp,
    pub value: f64,
    /// Category override sent with the point
    pub category: Option<Category>,
}

/// A single data log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Entry type
    pub entry_type: WalEntryType,
    /// Bucket the entry was logged for
    pub bucket: BucketNumber,
    /// Entry payload (bincode)
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Smallest framed entry: type, bucket, payload length, checksum
    const MIN_BODY: usize = 1 + 4 + 4 + 4;

    /// Create an entry holding points of `bucket`
    pub fn points(bucket: BucketNumber, points: &[LoggedPoint]) -> Result<Self> {
        let payload =
            bincode::serialize(points).map_err(|e| TideError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            entry_type: WalEntryType::Points,
            bucket,
            payload,
        })
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - 1 byte: entry type
    /// - 4 bytes: bucket number
    /// - 4 bytes: payload length
    /// - N bytes: payload
    /// - 4 bytes: CRC32 checksum
    pub fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + Self::MIN_BODY + self.payload.len());

        buf.put_u32_le(0);
        buf.put_u8(self.entry_type as u8);
        buf.put_u32_le(self.bucket);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Deserialize entry from bytes, validating checksum
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(TideError::InvalidFormat("Entry too short".into()));
        }

        let len = (&data[..4]).get_u32_le() as usize;
        if len < Self::MIN_BODY {
            return Err(TideError::InvalidFormat("Entry too short".into()));
        }
        if data.len() < 4 + len {
            return Err(TideError::InvalidFormat("Incomplete entry".into()));
        }

        let entry_data = &data[4..4 + len];
        let (body, trailer) = entry_data.split_at(len - 4);
        let expected_checksum = (&trailer[..]).get_u32_le();
        let actual_checksum = crc32fast::hash(body);
        if expected_checksum != actual_checksum {
            return Err(TideError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let mut cursor = body;
        let entry_type = WalEntryType::try_from(cursor.get_u8())?;
        let bucket = cursor.get_u32_le();
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.remaining() != payload_len {
            return Err(TideError::Corruption(format!(
                "Payload length {} does not match entry size",
                payload_len
            )));
        }

        let entry = WalEntry {
            entry_type,
            bucket,
            payload: cursor.to_vec(),
        };
        Ok((entry, 4 + len))
    }

    /// Get the points of a points entry
    pub fn decode_points(&self) -> Result<Vec<LoggedPoint>> {
        if self.entry_type != WalEntryType::Points {
            return Err(TideError::InvalidFormat("Not a points entry".into()));
        }
        bincode::deserialize(&self.payload).map_err(|e| TideError::InvalidFormat(e.to_string()))
    }
}

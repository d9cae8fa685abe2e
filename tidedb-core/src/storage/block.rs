//! On-disk format of finalized bucket files

use crate::{BucketNumber, Result, SeriesId, TideError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Block file magic
pub const MAGIC: &[u8; 4] = b"TIDE";

/// Block file format version
pub const FORMAT_VERSION: u32 = 1;

/// Header at the start of every block file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFileHeader {
    /// Format version
    pub version: u32,
    /// Bucket stored in the file
    pub bucket: BucketNumber,
    /// Number of block records following the header
    pub record_count: u32,
}

impl BlockFileHeader {
    /// Header size in bytes
    pub const SIZE: usize = 16;

    /// Create a header for the current format version
    pub fn new(bucket: BucketNumber, record_count: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            bucket,
            record_count,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.bucket);
        buf.put_u32_le(self.record_count);
        buf.freeze()
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(TideError::InvalidFormat("Block file header too short".into()));
        }
        if &data[..4] != MAGIC {
            return Err(TideError::InvalidFormat("Invalid block file magic".into()));
        }

        let mut cursor = std::io::Cursor::new(&data[4..Self::SIZE]);
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TideError::InvalidFormat(format!(
                "Unsupported block file version: {}",
                version
            )));
        }

        Ok(Self {
            version,
            bucket: cursor.get_u32_le(),
            record_count: cursor.get_u32_le(),
        })
    }
}

/// One series' block within a bucket file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Series the block belongs to
    pub series_id: SeriesId,
    /// Number of points
    pub count: u16,
    /// Gorilla payload
    pub data: Vec<u8>,
}

impl BlockRecord {
    /// Fixed bytes around the payload: id, count, flag, length, checksum
    const OVERHEAD: usize = 4 + 2 + 1 + 4 + 4;

    /// Serialize to bytes with optional LZ4 compression
    pub fn to_bytes(&self, use_lz4: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::OVERHEAD + self.data.len());

        buf.put_u32_le(self.series_id);
        buf.put_u16_le(self.count);

        if use_lz4 {
            let compressed = lz4_flex::compress_prepend_size(&self.data);
            buf.put_u8(1);
            buf.put_u32_le(compressed.len() as u32);
            buf.put_slice(&compressed);
        } else {
            buf.put_u8(0);
            buf.put_u32_le(self.data.len() as u32);
            buf.put_slice(&self.data);
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        buf.freeze()
    }

    /// Deserialize one record, returning it and the number of bytes consumed
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < Self::OVERHEAD {
            return Err(TideError::InvalidFormat("Block record too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data);
        let series_id = cursor.get_u32_le();
        let count = cursor.get_u16_le();
        let lz4_flag = cursor.get_u8();
        let data_len = cursor.get_u32_le() as usize;

        let pos = cursor.position() as usize;
        let checksum_pos = pos + data_len;
        if checksum_pos + 4 > data.len() {
            return Err(TideError::InvalidFormat("Incomplete block record".into()));
        }

        let expected_checksum = {
            let mut c = std::io::Cursor::new(&data[checksum_pos..checksum_pos + 4]);
            c.get_u32_le()
        };
        let actual_checksum = crc32fast::hash(&data[..checksum_pos]);
        if expected_checksum != actual_checksum {
            return Err(TideError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let raw = &data[pos..checksum_pos];
        let payload = match lz4_flag {
            0 => raw.to_vec(),
            1 => lz4_flex::decompress_size_prepended(raw)
                .map_err(|e| TideError::Compression(e.to_string()))?,
            flag => {
                return Err(TideError::InvalidFormat(format!(
                    "Invalid compression flag: {}",
                    flag
                )))
            }
        };

        let record = Self {
            series_id,
            count,
            data: payload,
        };
        Ok((record, checksum_pos + 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::PointStream;

    fn sample_record(series_id: SeriesId) -> BlockRecord {
        let mut stream = PointStream::new();
        for i in 0..50 {
            stream.append(7200 + i * 60, i as f64, 0).unwrap();
        }
        BlockRecord {
            series_id,
            count: stream.len() as u16,
            data: stream.read_raw(),
        }
    }

    #[test]
    fn test_header_serialization() {
        let header = BlockFileHeader::new(42, 3);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), BlockFileHeader::SIZE);
        assert_eq!(BlockFileHeader::from_bytes(&bytes).unwrap(), header);

        let mut bad = bytes.to_vec();
        bad[0] = b'X';
        assert!(matches!(
            BlockFileHeader::from_bytes(&bad),
            Err(TideError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_record_serialization() {
        for use_lz4 in [false, true] {
            let record = sample_record(9);
            let mut bytes = record.to_bytes(use_lz4).to_vec();
            let trailing = bytes.len();
            bytes.extend_from_slice(b"next");

            let (restored, consumed) = BlockRecord::from_bytes(&bytes).unwrap();
            assert_eq!(consumed, trailing);
            assert_eq!(restored, record);
        }
    }

    #[test]
    fn test_record_checksum_validation() {
        let mut bytes = sample_record(1).to_bytes(false).to_vec();
        bytes[12] ^= 0xFF;

        let result = BlockRecord::from_bytes(&bytes);
        assert!(matches!(result, Err(TideError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_record() {
        let bytes = sample_record(1).to_bytes(false);
        let result = BlockRecord::from_bytes(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(TideError::InvalidFormat(_))));
    }
}

//! Gorilla decoder for stored and live blocks

use super::bitstream::BitReader;
use crate::{Result, TideError, TimeValuePair};

/// Gorilla decoder over the raw bytes of a [`super::PointStream`]
pub struct GorillaDecoder<'a> {
    reader: BitReader<'a>,
    count: usize,
    decoded: usize,

    // Timestamp state
    prev_timestamp: i64,
    prev_timestamp_delta: i64,

    // Value state
    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
}

impl<'a> GorillaDecoder<'a> {
    /// Create a decoder for `count` points encoded in `data`
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            count,
            decoded: 0,
            prev_timestamp: 0,
            prev_timestamp_delta: 0,
            prev_value_bits: 0,
            prev_leading_zeros: 0,
            prev_trailing_zeros: 0,
        }
    }

    /// Decode all points
    pub fn decode_all(&mut self) -> Result<Vec<TimeValuePair>> {
        let mut points = Vec::with_capacity(self.count);

        while let Some(point) = self.decode_next()? {
            points.push(point);
        }

        Ok(points)
    }

    /// Decode the next point
    pub fn decode_next(&mut self) -> Result<Option<TimeValuePair>> {
        if self.decoded >= self.count {
            return Ok(None);
        }

        if self.decoded == 0 {
            return self.decode_first().map(Some);
        }

        let timestamp = self.decode_timestamp()?;
        let value = self.decode_value()?;
        self.decoded += 1;

        Ok(Some(TimeValuePair::new(timestamp, value)))
    }

    fn bit(&mut self) -> Result<bool> {
        self.reader
            .read_bit()
            .ok_or_else(|| TideError::Compression("Unexpected end of data".into()))
    }

    fn bits(&mut self, num_bits: usize) -> Result<u64> {
        self.reader
            .read_bits(num_bits)
            .ok_or_else(|| TideError::Compression("Unexpected end of data".into()))
    }

    fn decode_first(&mut self) -> Result<TimeValuePair> {
        let timestamp = self.bits(64)? as i64;
        let value_bits = self.bits(64)?;

        self.prev_timestamp = timestamp;
        self.prev_value_bits = value_bits;
        self.decoded = 1;

        Ok(TimeValuePair::new(timestamp, f64::from_bits(value_bits)))
    }

    fn decode_timestamp(&mut self) -> Result<i64> {
        let delta_of_delta = if !self.bit()? {
            0
        } else if !self.bit()? {
            self.bits(7)? as i64 - 63
        } else if !self.bit()? {
            self.bits(9)? as i64 - 255
        } else if !self.bit()? {
            self.bits(12)? as i64 - 2047
        } else {
            self.bits(64)? as i64
        };

        let delta = self.prev_timestamp_delta.wrapping_add(delta_of_delta);
        let timestamp = self.prev_timestamp.wrapping_add(delta);

        self.prev_timestamp_delta = delta;
        self.prev_timestamp = timestamp;

        Ok(timestamp)
    }

    fn decode_value(&mut self) -> Result<f64> {
        if !self.bit()? {
            return Ok(f64::from_bits(self.prev_value_bits));
        }

        let (leading_zeros, meaningful_bits) = if !self.bit()? {
            let meaningful_bits = 64 - self.prev_leading_zeros - self.prev_trailing_zeros;
            (self.prev_leading_zeros, meaningful_bits)
        } else {
            let leading = self.bits(5)? as u32;
            let meaningful = self.bits(6)? as u32 + 1;
            if leading + meaningful > 64 {
                return Err(TideError::Compression(format!(
                    "Invalid value window: {} leading, {} meaningful",
                    leading, meaningful
                )));
            }

            self.prev_leading_zeros = leading;
            self.prev_trailing_zeros = 64 - leading - meaningful;

            (leading, meaningful)
        };

        let meaningful_value = self.bits(meaningful_bits as usize)?;

        let trailing_zeros = 64 - leading_zeros - meaningful_bits;
        let xor = meaningful_value << trailing_zeros;
        let value_bits = self.prev_value_bits ^ xor;

        self.prev_value_bits = value_bits;

        Ok(f64::from_bits(value_bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::PointStream;

    fn encode(points: &[(i64, f64)]) -> PointStream {
        let mut stream = PointStream::new();
        for (ts, val) in points {
            stream.append(*ts, *val, 0).unwrap();
        }
        stream
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let points: Vec<(i64, f64)> = (0..100)
            .map(|i| (1_600_000_000 + i * 60, 20.0 + i as f64 * 0.5))
            .collect();

        let stream = encode(&points);
        let raw = stream.read_raw();
        let decoded = GorillaDecoder::new(&raw, stream.len()).decode_all().unwrap();

        assert_eq!(decoded.len(), points.len());
        for (i, ((ts, val), dec)) in points.iter().zip(decoded.iter()).enumerate() {
            assert_eq!(*ts, dec.timestamp, "Timestamp mismatch at {}", i);
            assert_eq!(val.to_bits(), dec.value.to_bits(), "Value mismatch at {}", i);
        }
    }

    #[test]
    fn test_wide_value_windows() {
        // XORs with no leading/trailing zeros and with more than 31 leading zeros
        let points = vec![
            (0, 0.0),
            (10, f64::from_bits(u64::MAX)),
            (20, f64::from_bits(1)),
            (30, f64::from_bits(3)),
            (40, -1.5),
            (45, f64::MIN_POSITIVE),
        ];

        let stream = encode(&points);
        let raw = stream.read_raw();
        let decoded = GorillaDecoder::new(&raw, stream.len()).decode_all().unwrap();

        for ((ts, val), dec) in points.iter().zip(decoded.iter()) {
            assert_eq!(*ts, dec.timestamp);
            assert_eq!(val.to_bits(), dec.value.to_bits());
        }
    }

    #[test]
    fn test_irregular_timestamps() {
        let points = vec![(100, 1.0), (101, 1.0), (5000, 2.0), (5001, 2.0), (900_000, 3.0)];

        let stream = encode(&points);
        let raw = stream.read_raw();
        let decoded = GorillaDecoder::new(&raw, stream.len()).decode_all().unwrap();
        let timestamps: Vec<i64> = decoded.iter().map(|p| p.timestamp).collect();

        assert_eq!(timestamps, vec![100, 101, 5000, 5001, 900_000]);
    }

    #[test]
    fn test_truncated_data() {
        let stream = encode(&[(100, 1.0), (160, 2.0)]);
        let raw = stream.read_raw();

        let result = GorillaDecoder::new(&raw[..10], 2).decode_all();
        assert!(matches!(result, Err(TideError::Compression(_))));
    }

    #[test]
    fn test_decode_live_stream_between_appends() {
        let mut stream = PointStream::new();
        stream.append(100, 1.0, 0).unwrap();
        stream.append(160, 2.0, 0).unwrap();

        let first = stream.read_raw();
        stream.append(220, 3.0, 0).unwrap();
        let second = stream.read_raw();

        assert_eq!(GorillaDecoder::new(&first, 2).decode_all().unwrap().len(), 2);
        let all = GorillaDecoder::new(&second, 3).decode_all().unwrap();
        assert_eq!(all[2], TimeValuePair::new(220, 3.0));
    }
}

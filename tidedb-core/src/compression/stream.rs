//! Appendable Gorilla stream holding the points of one open bucket

use super::bitstream::BitWriter;
use crate::{Category, Result, TideError, Timestamp, DEFAULT_CATEGORY};

/// Bytes reserved for a fresh stream
const INITIAL_CAPACITY: usize = 64;

/// Leading-zero count no XOR can reach, forces a new window on the first change
const NO_WINDOW: u32 = 64;

/// Compressed point stream for a single series bucket.
///
/// Timestamps are encoded as delta-of-delta with variable-width control
/// prefixes, values as the XOR against the previous value. The stream can be
/// read at any time with [`PointStream::read_raw`] and keeps accepting points
/// afterwards; [`PointStream::reset`] empties it but keeps its category.
#[derive(Debug, Clone)]
pub struct PointStream {
    writer: BitWriter,
    count: u32,

    // Timestamp state
    prev_timestamp: Timestamp,
    prev_timestamp_delta: i64,

    // Value state
    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,

    category: Category,
}

impl PointStream {
    /// Create an empty stream tagged with the default category
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(INITIAL_CAPACITY),
            count: 0,
            prev_timestamp: 0,
            prev_timestamp_delta: 0,
            prev_value_bits: 0,
            prev_leading_zeros: NO_WINDOW,
            prev_trailing_zeros: 0,
            category: DEFAULT_CATEGORY,
        }
    }

    /// Drop all buffered points. The category is kept.
    pub fn reset(&mut self) {
        self.writer.clear();
        self.count = 0;
        self.prev_timestamp = 0;
        self.prev_timestamp_delta = 0;
        self.prev_value_bits = 0;
        self.prev_leading_zeros = NO_WINDOW;
        self.prev_trailing_zeros = 0;
    }

    /// Append a point.
    ///
    /// Fails without touching the stream when the stream already holds a
    /// point and `timestamp` is less than `min_delta` seconds after it.
    pub fn append(&mut self, timestamp: Timestamp, value: f64, min_delta: i64) -> Result<()> {
        if self.count > 0 && timestamp.saturating_sub(self.prev_timestamp) < min_delta {
            return Err(TideError::TimestampTooClose {
                timestamp,
                previous: self.prev_timestamp,
                min_delta,
            });
        }

        if self.count == 0 {
            self.append_first(timestamp, value);
        } else {
            self.append_timestamp(timestamp);
            self.append_value(value);
        }
        self.count += 1;
        Ok(())
    }

    /// Copy out the encoded bytes
    pub fn read_raw(&self) -> Vec<u8> {
        self.writer.snapshot()
    }

    /// Number of points in the stream
    pub fn len(&self) -> usize {
        self.count as usize
    }

    /// Check if the stream holds no points
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        self.writer.len()
    }

    /// Timestamp of the newest point
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        (self.count > 0).then_some(self.prev_timestamp)
    }

    /// Category tag carried with the stream
    pub fn category(&self) -> Category {
        self.category
    }

    /// Replace the category tag
    pub fn set_category(&mut self, category: Category) {
        self.category = category;
    }

    fn append_first(&mut self, timestamp: Timestamp, value: f64) {
        self.prev_timestamp = timestamp;
        self.prev_timestamp_delta = 0;

        self.writer.write_bits(timestamp as u64, 64);

        let value_bits = value.to_bits();
        self.writer.write_bits(value_bits, 64);
        self.prev_value_bits = value_bits;
    }

    fn append_timestamp(&mut self, timestamp: Timestamp) {
        let delta = timestamp.wrapping_sub(self.prev_timestamp);
        let delta_of_delta = delta.wrapping_sub(self.prev_timestamp_delta);

        if delta_of_delta == 0 {
            self.writer.write_bit(false);
        } else if (-63..=64).contains(&delta_of_delta) {
            self.writer.write_bits(0b10, 2);
            self.writer.write_bits((delta_of_delta + 63) as u64, 7);
        } else if (-255..=256).contains(&delta_of_delta) {
            self.writer.write_bits(0b110, 3);
            self.writer.write_bits((delta_of_delta + 255) as u64, 9);
        } else if (-2047..=2048).contains(&delta_of_delta) {
            self.writer.write_bits(0b1110, 4);
            self.writer.write_bits((delta_of_delta + 2047) as u64, 12);
        } else {
            self.writer.write_bits(0b1111, 4);
            self.writer.write_bits(delta_of_delta as u64, 64);
        }

        self.prev_timestamp_delta = delta;
        self.prev_timestamp = timestamp;
    }

    fn append_value(&mut self, value: f64) {
        let value_bits = value.to_bits();
        let xor = value_bits ^ self.prev_value_bits;

        if xor == 0 {
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);

            // Leading zeros must fit in 5 bits
            let leading_zeros = xor.leading_zeros().min(31);
            let trailing_zeros = xor.trailing_zeros();

            if leading_zeros >= self.prev_leading_zeros
                && trailing_zeros >= self.prev_trailing_zeros
            {
                self.writer.write_bit(false);
                let meaningful_bits = 64 - self.prev_leading_zeros - self.prev_trailing_zeros;
                let shifted = xor >> self.prev_trailing_zeros;
                self.writer.write_bits(shifted, meaningful_bits as usize);
            } else {
                self.writer.write_bit(true);
                self.writer.write_bits(leading_zeros as u64, 5);

                // 1..=64 stored as 0..=63
                let meaningful_bits = 64 - leading_zeros - trailing_zeros;
                self.writer.write_bits((meaningful_bits - 1) as u64, 6);

                let shifted = xor >> trailing_zeros;
                self.writer.write_bits(shifted, meaningful_bits as usize);

                self.prev_leading_zeros = leading_zeros;
                self.prev_trailing_zeros = trailing_zeros;
            }
        }

        self.prev_value_bits = value_bits;
    }
}

impl Default for PointStream {
    fn default() -> Self {
        Self::new()
    }
}

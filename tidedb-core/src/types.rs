//! Core types for TideDB

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in seconds since Unix epoch
pub type Timestamp = i64;

/// Numeric series identifier, unique within a shard
pub type SeriesId = u32;

/// Sequential number of a fixed-duration time window
pub type BucketNumber = u32;

/// Shard identifier
pub type ShardId = i64;

/// Small caller-supplied classification tag stored with a series
pub type Category = u16;

/// Category assigned to a stream until a caller overrides it
pub const DEFAULT_CATEGORY: Category = 0;

/// A single timestamp/value sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeValuePair {
    /// Timestamp in seconds
    pub timestamp: Timestamp,
    /// Sample value
    pub value: f64,
}

impl TimeValuePair {
    /// Create a new sample
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Compressed points of one bucket of one series
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesBlock {
    /// Gorilla-encoded payload
    pub data: Vec<u8>,
    /// Number of points encoded in `data`
    pub count: u16,
}

impl TimeSeriesBlock {
    /// Create a new block
    pub fn new(data: Vec<u8>, count: u16) -> Self {
        Self { data, count }
    }

    /// Check if the block holds no points
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(100, 200);

        assert!(range.contains(100));
        assert!(range.contains(200));
        assert!(!range.contains(99));
        assert!(!range.contains(250));
        assert_eq!(range.to_string(), "[100, 200]");
    }

    #[test]
    fn test_empty_block() {
        assert!(TimeSeriesBlock::default().is_empty());
        assert!(!TimeSeriesBlock::new(vec![0; 16], 1).is_empty());
    }
}

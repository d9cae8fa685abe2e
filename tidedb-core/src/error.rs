//! Error types for TideDB

use crate::{BucketNumber, ShardId, Timestamp};
use thiserror::Error;

/// Result type alias for TideDB operations
pub type Result<T> = std::result::Result<T, TideError>;

/// TideDB error types
#[derive(Error, Debug)]
pub enum TideError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Write addressed to a bucket that is already closed
    #[error("Invalid bucket number {bucket}: bucket {current} is already open")]
    InvalidBucket {
        bucket: BucketNumber,
        current: BucketNumber,
    },

    /// Point rejected by the minimum timestamp spacing policy
    #[error("Timestamp {timestamp} is too close to previous {previous} (min delta {min_delta})")]
    TimestampTooClose {
        timestamp: Timestamp,
        previous: Timestamp,
        min_delta: i64,
    },

    /// Active bucket cannot count any more points
    #[error("Active bucket is full")]
    BucketFull,

    /// Block storage no longer retains the bucket
    #[error("Bucket {0} has expired from block storage")]
    BucketExpired(BucketNumber),

    /// Bucket was already finalized and accepts no more blocks
    #[error("Bucket {0} is already finalized")]
    BucketFinalized(BucketNumber),

    /// Shard exists but is not owned by this process
    #[error("Shard {0} is not owned")]
    NotOwned(ShardId),

    /// Shard is unknown to this process
    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    /// Shard is still recovering and cannot serve reads
    #[error("Shard {0} is in progress")]
    ShardInProgress(ShardId),

    /// Illegal shard ownership transition
    #[error("Invalid shard state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

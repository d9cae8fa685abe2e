//! Block storage for closed buckets
//!
//! A series flushes each completed bucket into a [`BlockStore`] and keeps
//! only the returned [`BlockId`]. [`BucketStorage`] is the shard-level store:
//! it keeps the blocks of the retained buckets in memory and, when given a
//! data directory, persists every finalized bucket as one block file.

pub mod block;
mod bucket_storage;

pub use bucket_storage::BucketStorage;

use crate::{BucketNumber, Result, SeriesId, TimeSeriesBlock};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Opaque handle to a stored block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    /// Build an id from its raw representation
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw representation
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Durable storage of closed buckets, keyed by bucket and series.
///
/// `fetch` separates a lookup miss from a failure: `Ok(None)` means the
/// bucket or block is no longer (or never was) held, which readers treat as
/// a gap.
pub trait BlockStore: Send + Sync {
    /// Number of buckets retained
    fn bucket_capacity(&self) -> u8;

    /// Store the raw block of one series for `bucket`
    fn store(
        &self,
        bucket: BucketNumber,
        data: &[u8],
        count: u16,
        series_id: SeriesId,
    ) -> Result<BlockId>;

    /// Resolve a block id previously returned for `bucket`
    fn fetch(&self, bucket: BucketNumber, id: BlockId) -> Result<Option<TimeSeriesBlock>>;
}

/// Block storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Number of buckets retained
    pub buckets: u8,
    /// Directory for block files; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// LZ4-compress block payloads on disk
    pub use_lz4: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buckets: crate::config::DEFAULT_BUCKETS,
            data_dir: None,
            use_lz4: true,
        }
    }
}

/// A block found on disk while loading a storage directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredBlock {
    /// Bucket the block belongs to
    pub bucket: BucketNumber,
    /// Series the block belongs to
    pub series_id: SeriesId,
    /// Id the block is reachable under
    pub id: BlockId,
}

/// Block storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Buckets currently held
    pub buckets: usize,
    /// Blocks across all held buckets
    pub blocks: usize,
    /// Payload bytes across all held buckets
    pub bytes: usize,
    /// Newest finalized bucket
    pub last_finalized: Option<BucketNumber>,
}

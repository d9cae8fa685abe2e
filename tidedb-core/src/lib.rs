//! TideDB Core - Rolling-bucket time-series storage engine
//!
//! Every series keeps its newest points in an in-memory Gorilla stream for
//! the bucket currently open, and a fixed ring of block references for the
//! closed buckets it still retains.
//!
//! # Architecture
//!
//! - **Series**: [`BucketedTimeSeries`], one per key; bucket rotation,
//!   range reads and read-recency tracking
//! - **Storage**: [`storage::BucketStorage`] holds the closed buckets of a
//!   shard and persists them as block files once finalized
//! - **Data log**: per-bucket write-ahead segments that rebuild open buckets
//!   after a restart
//! - **Shard**: [`shard::BucketMap`] maps keys to series and drives
//!   ownership, recovery and finalization
//! - **Service**: [`service::TideService`] routes requests to shards

pub mod compression;
pub mod series;
pub mod service;
pub mod shard;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{Result, TideError};
pub use series::BucketedTimeSeries;
pub use types::*;

/// TideDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Buckets retained per series (one day of 4 hour buckets)
    pub const DEFAULT_BUCKETS: u8 = 6;

    /// Bucket duration in seconds (4 hours)
    pub const DEFAULT_BUCKET_DURATION: u64 = 4 * 3600;

    /// Points closer than this many seconds to the previous point are rejected
    pub const MIN_TIMESTAMP_DELTA: i64 = 30;

    /// Data log segment flush threshold for `SyncPolicy::EveryN`
    pub const WAL_SYNC_EVERY: usize = 100;

    /// Bucket finalization check interval in seconds
    pub const FINALIZE_INTERVAL_SECS: u64 = 60;
}

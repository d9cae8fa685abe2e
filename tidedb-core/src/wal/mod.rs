//! Per-bucket data log
//!
//! Every point accepted by a shard is logged to the segment of its bucket
//! before it reaches the in-memory series. After a restart the segments of
//! the buckets that were never finalized are replayed to rebuild the open
//! buckets. Segments are deleted once their bucket is finalized.

mod entry;
mod reader;
mod writer;

pub use entry::{LoggedPoint, WalEntry, WalEntryType};
pub use reader::WalReader;
pub use writer::WalWriter;

use crate::{config, BucketNumber, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Data log sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::EveryN(config::WAL_SYNC_EVERY)
    }
}

/// Data log configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for segment files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/log"),
            sync_policy: SyncPolicy::default(),
        }
    }
}

fn segment_path(dir: &Path, bucket: BucketNumber) -> PathBuf {
    dir.join(format!("wal_{:010}.log", bucket))
}

fn parse_segment_bucket(path: &Path) -> Option<BucketNumber> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

/// Segment files in `dir`, oldest bucket first
fn list_segments(dir: &Path) -> Result<Vec<(BucketNumber, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(bucket) = parse_segment_bucket(&path) {
            segments.push((bucket, path));
        }
    }
    segments.sort_by_key(|(bucket, _)| *bucket);
    Ok(segments)
}

//! Data log writer

use super::{list_segments, segment_path, SyncPolicy, WalConfig, WalEntry};
use crate::{BucketNumber, Result, TideError};
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::time::Instant;
use tracing::debug;

/// Appends entries to the segment of their bucket
pub struct WalWriter {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    segments: BTreeMap<BucketNumber, BufWriter<File>>,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriterInner {
    fn sync_all(&mut self) -> Result<()> {
        for file in self.segments.values_mut() {
            file.flush()?;
            file.get_ref().sync_data()?;
        }
        self.writes_since_sync = 0;
        self.last_sync = Instant::now();
        Ok(())
    }
}

impl WalWriter {
    /// Create a data log writer, creating its directory if needed
    pub fn new(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let inner = WalWriterInner {
            segments: BTreeMap::new(),
            writes_since_sync: 0,
            last_sync: Instant::now(),
        };

        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Append an entry to the segment of `bucket`
    pub fn append(&self, bucket: BucketNumber, entry: &WalEntry) -> Result<()> {
        if entry.bucket != bucket {
            return Err(TideError::Internal(format!(
                "Entry for bucket {} appended to segment {}",
                entry.bucket, bucket
            )));
        }

        let serialized = entry.serialize_with_checksum();
        let mut inner = self.inner.lock();

        let file = match inner.segments.entry(bucket) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(BufWriter::new(self.open_segment(bucket)?)),
        };
        file.write_all(&serialized)?;
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            inner.sync_all()?;
        }
        Ok(())
    }

    /// Force sync of every open segment
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().sync_all()
    }

    /// Delete the segments of every bucket older than `bucket`
    pub fn truncate_before(&self, bucket: BucketNumber) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.segments = inner.segments.split_off(&bucket);

        let mut truncated = 0;
        for (segment, path) in list_segments(&self.config.dir)? {
            if segment < bucket {
                fs::remove_file(&path)?;
                truncated += 1;
            }
        }
        if truncated > 0 {
            debug!("Removed {} data log segments before bucket {}", truncated, bucket);
        }
        Ok(truncated)
    }

    /// Buckets with a segment open for appending
    pub fn open_buckets(&self) -> Vec<BucketNumber> {
        self.inner.lock().segments.keys().copied().collect()
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= u128::from(millis)
            }
            SyncPolicy::None => false,
        }
    }

    fn open_segment(&self, bucket: BucketNumber) -> Result<File> {
        let path = segment_path(&self.config.dir, bucket);
        debug!("Opening data log segment {:?}", path);
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::LoggedPoint;
    use tempfile::TempDir;

    fn entry(bucket: BucketNumber) -> WalEntry {
        let point = LoggedPoint {
            series_id: 1,
            timestamp: 1000,
            value: 23.5,
            category: None,
        };
        WalEntry::points(bucket, &[point]).unwrap()
    }

    fn writer(dir: &TempDir) -> WalWriter {
        WalWriter::new(WalConfig {
            dir: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Immediate,
        })
        .unwrap()
    }

    #[test]
    fn test_segments_per_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let writer = writer(&temp_dir);

        writer.append(4, &entry(4)).unwrap();
        writer.append(5, &entry(5)).unwrap();
        writer.append(4, &entry(4)).unwrap();
        writer.sync().unwrap();

        assert_eq!(writer.open_buckets(), vec![4, 5]);
        let segments = list_segments(temp_dir.path()).unwrap();
        assert_eq!(
            segments.iter().map(|(b, _)| *b).collect::<Vec<_>>(),
            vec![4, 5]
        );
    }

    #[test]
    fn test_mismatched_bucket_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let writer = writer(&temp_dir);
        assert!(matches!(
            writer.append(4, &entry(5)),
            Err(TideError::Internal(_))
        ));
    }

    #[test]
    fn test_truncate_before() {
        let temp_dir = TempDir::new().unwrap();
        let writer = writer(&temp_dir);
        for bucket in 1..=4 {
            writer.append(bucket, &entry(bucket)).unwrap();
        }

        assert_eq!(writer.truncate_before(3).unwrap(), 2);
        assert_eq!(writer.open_buckets(), vec![3, 4]);

        let remaining: Vec<_> = list_segments(temp_dir.path())
            .unwrap()
            .into_iter()
            .map(|(b, _)| b)
            .collect();
        assert_eq!(remaining, vec![3, 4]);
    }
}

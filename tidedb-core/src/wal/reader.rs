//! Data log reader for recovery

use super::{list_segments, WalConfig, WalEntry};
use crate::{BucketNumber, Result, TideError};
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::{info, warn};

/// Replays data log segments after a restart
pub struct WalReader {
    config: WalConfig,
}

impl WalReader {
    /// Create a new data log reader
    pub fn new(config: WalConfig) -> Self {
        Self { config }
    }

    /// Recover the entries of every segment for `bucket` and newer, oldest
    /// bucket first.
    ///
    /// A segment ending in a torn or corrupt entry is cut back to its last
    /// valid entry so later appends stay readable.
    pub fn recover_from(&self, bucket: BucketNumber) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();

        for (segment, path) in list_segments(&self.config.dir)? {
            if segment < bucket {
                continue;
            }
            match Self::read_segment(&path) {
                Ok(segment_entries) => {
                    info!(
                        "Recovered {} entries from {:?}",
                        segment_entries.len(),
                        path
                    );
                    entries.extend(segment_entries);
                }
                Err(e) => warn!("Error reading segment {:?}: {}", path, e),
            }
        }

        Ok(entries)
    }

    fn read_segment(path: &Path) -> Result<Vec<WalEntry>> {
        let data = fs::read(path)?;

        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::deserialize_with_checksum(&data[offset..]) {
                Ok((entry, bytes_read)) => {
                    entries.push(entry);
                    offset += bytes_read;
                }
                Err(TideError::ChecksumMismatch { .. }) => {
                    warn!(
                        "Checksum mismatch at offset {} in {:?}, truncating",
                        offset, path
                    );
                    break;
                }
                Err(TideError::InvalidFormat(msg)) => {
                    warn!(
                        "Torn entry at offset {} in {:?} ({}), truncating",
                        offset, path, msg
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if offset < data.len() {
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(offset as u64)?;
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{LoggedPoint, SyncPolicy, WalWriter};
    use std::io::Write;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> WalConfig {
        WalConfig {
            dir: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Immediate,
        }
    }

    fn logged(series_id: u32, timestamp: i64) -> LoggedPoint {
        LoggedPoint {
            series_id,
            timestamp,
            value: 23.5 + timestamp as f64,
            category: None,
        }
    }

    #[test]
    fn test_wal_recovery() {
        let temp_dir = TempDir::new().unwrap();

        {
            let writer = WalWriter::new(config(&temp_dir)).unwrap();
            for i in 0..10u32 {
                let bucket = i / 4;
                let entry = WalEntry::points(bucket, &[logged(i, i as i64 * 1000)]).unwrap();
                writer.append(bucket, &entry).unwrap();
            }
            writer.sync().unwrap();
        }

        let reader = WalReader::new(config(&temp_dir));
        let entries = reader.recover_from(0).unwrap();
        assert_eq!(entries.len(), 10);

        let points: Vec<_> = entries
            .iter()
            .flat_map(|e| e.decode_points().unwrap())
            .map(|p| p.series_id)
            .collect();
        assert_eq!(points, (0..10).collect::<Vec<_>>());

        let newer = reader.recover_from(1).unwrap();
        assert_eq!(newer.len(), 6);
        assert!(newer.iter().all(|e| e.bucket >= 1));
    }

    #[test]
    fn test_torn_tail_truncated() {
        let temp_dir = TempDir::new().unwrap();
        {
            let writer = WalWriter::new(config(&temp_dir)).unwrap();
            for ts in 0..3 {
                let entry = WalEntry::points(7, &[logged(1, ts)]).unwrap();
                writer.append(7, &entry).unwrap();
            }
        }

        let path = crate::wal::segment_path(temp_dir.path(), 7);
        let valid_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42, 0, 0, 0, 1, 7]).unwrap();
        }

        let reader = WalReader::new(config(&temp_dir));
        assert_eq!(reader.recover_from(0).unwrap().len(), 3);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);

        // Appends after recovery are readable
        {
            let writer = WalWriter::new(config(&temp_dir)).unwrap();
            let entry = WalEntry::points(7, &[logged(1, 99)]).unwrap();
            writer.append(7, &entry).unwrap();
        }
        assert_eq!(reader.recover_from(0).unwrap().len(), 4);
    }

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let reader = WalReader::new(WalConfig {
            dir: temp_dir.path().join("missing"),
            sync_policy: SyncPolicy::None,
        });
        assert!(reader.recover_from(0).unwrap().is_empty());
    }
}

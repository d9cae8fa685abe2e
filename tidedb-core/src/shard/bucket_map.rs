//! Key to series mapping for one shard

use super::key_list::{KeyEntry, KeyList};
use super::ShardState;
use crate::series::BucketedTimeSeries;
use crate::storage::{BucketStorage, StorageConfig, StorageStats};
use crate::wal::{LoggedPoint, SyncPolicy, WalConfig, WalEntry, WalReader, WalWriter};
use crate::{
    config, BucketNumber, Category, Result, SeriesId, ShardId, TideError, TimeSeriesBlock,
    TimeValuePair, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shard configuration
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Closed buckets retained per series
    pub buckets: u8,
    /// Bucket duration in seconds
    pub bucket_duration: u64,
    /// Minimum spacing between consecutive points of a series
    pub min_timestamp_delta: i64,
    /// Directory for block files, data log and key list; `None` keeps the
    /// shard in memory only
    pub data_dir: Option<PathBuf>,
    /// Data log sync policy
    pub sync_policy: SyncPolicy,
    /// LZ4-compress block files
    pub use_lz4: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            buckets: config::DEFAULT_BUCKETS,
            bucket_duration: config::DEFAULT_BUCKET_DURATION,
            min_timestamp_delta: config::MIN_TIMESTAMP_DELTA,
            data_dir: None,
            sync_policy: SyncPolicy::default(),
            use_lz4: true,
        }
    }
}

/// What happened to a point handed to [`BucketMap::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Held until recovery reaches the queued points
    Queued,
    /// Added to its series
    Stored { new_series: bool },
}

/// Shard statistics
#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub shard_id: ShardId,
    pub state: ShardState,
    pub series: usize,
    /// Points in the open buckets of all series
    pub active_points: usize,
    /// Series not read within the retained window
    pub cold_series: usize,
    pub queued_points: usize,
    pub storage: StorageStats,
}

struct SeriesRow {
    id: SeriesId,
    key: String,
    series: BucketedTimeSeries,
}

#[derive(Default)]
struct SeriesIndex {
    by_key: HashMap<String, Arc<SeriesRow>>,
    by_id: HashMap<SeriesId, Arc<SeriesRow>>,
    next_id: SeriesId,
}

impl SeriesIndex {
    fn insert(&mut self, row: Arc<SeriesRow>) {
        self.next_id = self.next_id.max(row.id.wrapping_add(1));
        self.by_id.insert(row.id, Arc::clone(&row));
        self.by_key.insert(row.key.clone(), row);
    }

    fn clear(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
        self.next_id = 0;
    }
}

struct QueuedPoint {
    key: String,
    point: TimeValuePair,
    category: Option<Category>,
}

/// All series of one shard, plus the storage they flush into
pub struct BucketMap {
    shard_id: ShardId,
    config: ShardConfig,
    state: Mutex<ShardState>,
    index: RwLock<SeriesIndex>,
    queue: Mutex<Vec<QueuedPoint>>,
    storage: BucketStorage,
    wal: Option<WalWriter>,
    key_list: Option<KeyList>,
    last_finalized: Mutex<Option<BucketNumber>>,
    // Writers hold it shared; finalizing a bucket holds it exclusively
    finalize_gate: RwLock<()>,
}

impl BucketMap {
    /// Create an unowned shard, opening its files when a data directory is
    /// configured
    pub fn new(shard_id: ShardId, config: ShardConfig) -> Result<Self> {
        if config.buckets == 0 {
            return Err(TideError::Config("Shard needs at least one bucket".into()));
        }
        if config.bucket_duration == 0 {
            return Err(TideError::Config("Bucket duration must be non-zero".into()));
        }

        let storage = BucketStorage::new(StorageConfig {
            buckets: config.buckets,
            data_dir: config.data_dir.as_ref().map(|dir| dir.join("blocks")),
            use_lz4: config.use_lz4,
        })?;

        let (wal, key_list) = match &config.data_dir {
            Some(dir) => {
                let wal = WalWriter::new(WalConfig {
                    dir: dir.join("log"),
                    sync_policy: config.sync_policy,
                })?;
                (Some(wal), Some(KeyList::open(dir)?))
            }
            None => (None, None),
        };

        Ok(Self {
            shard_id,
            config,
            state: Mutex::new(ShardState::Unowned),
            index: RwLock::new(SeriesIndex::default()),
            queue: Mutex::new(Vec::new()),
            storage,
            wal,
            key_list,
            last_finalized: Mutex::new(None),
            finalize_gate: RwLock::new(()),
        })
    }

    /// Shard identifier
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Shard configuration
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// Current ownership state
    pub fn state(&self) -> ShardState {
        *self.state.lock()
    }

    /// Block storage of the shard
    pub fn storage(&self) -> &BucketStorage {
        &self.storage
    }

    /// Newest finalized bucket
    pub fn last_finalized(&self) -> Option<BucketNumber> {
        *self.last_finalized.lock()
    }

    /// Move to `next`. Dropping to `Unowned` forgets every series and
    /// queued point.
    pub fn set_state(&self, next: ShardState) -> Result<()> {
        let mut state = self.state.lock();
        let from = *state;
        *state = from.transition(next)?;

        if next == ShardState::Unowned {
            self.index.write().clear();
            self.queue.lock().clear();
        }
        debug!("Shard {} moved from {} to {}", self.shard_id, from, next);
        Ok(())
    }

    /// Bucket holding `timestamp`. Negative timestamps map to bucket 0.
    pub fn bucket(&self, timestamp: Timestamp) -> BucketNumber {
        let bucket = timestamp.max(0) as u64 / self.config.bucket_duration;
        bucket.min(u64::from(BucketNumber::MAX)) as BucketNumber
    }

    /// First timestamp of `bucket`
    pub fn timestamp(&self, bucket: BucketNumber) -> Timestamp {
        (u64::from(bucket) * self.config.bucket_duration) as Timestamp
    }

    /// Oldest timestamp whose bucket is still retained at `now`. Reads
    /// starting earlier can miss data that already expired.
    pub fn reliable_start(&self, now: Timestamp) -> Timestamp {
        let oldest = self
            .bucket(now)
            .saturating_sub(u32::from(self.config.buckets));
        self.timestamp(oldest)
    }

    /// Add a point to the series of `key`, creating the series if needed
    pub fn put(
        &self,
        key: &str,
        point: TimeValuePair,
        category: Option<Category>,
    ) -> Result<PutOutcome> {
        {
            let state = self.state.lock();
            if *state == ShardState::Unowned {
                return Err(TideError::NotOwned(self.shard_id));
            }
            if state.queues_writes() {
                self.queue.lock().push(QueuedPoint {
                    key: key.to_string(),
                    point,
                    category,
                });
                return Ok(PutOutcome::Queued);
            }
        }

        self.put_owned(key, point, category)
    }

    /// Blocks of `key` overlapping `[begin, end]`, `None` for an unknown key
    pub fn get(
        &self,
        key: &str,
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Option<Vec<TimeSeriesBlock>>> {
        if self.state() == ShardState::Unowned {
            return Err(TideError::NotOwned(self.shard_id));
        }

        let Some(row) = self.find(key) else {
            return Ok(None);
        };
        let blocks = row
            .series
            .get(self.bucket(begin), self.bucket(end), &self.storage);
        row.series.set_queried();
        Ok(Some(blocks))
    }

    /// Finalize every bucket that ended before `now`.
    ///
    /// Each bucket is closed on all series, persisted, and its data log
    /// segment dropped. A shard that never finalized starts at the oldest
    /// retained bucket, so no logged bucket is dropped unpersisted. Returns
    /// how many buckets were finalized.
    pub fn finalize_buckets(&self, now: Timestamp) -> Result<usize> {
        if self.state() != ShardState::Owned {
            return Ok(0);
        }

        let current = self.bucket(now);
        let Some(newest) = current.checked_sub(1) else {
            return Ok(0);
        };
        let oldest_retained = newest.saturating_sub(u32::from(self.config.buckets) - 1);
        let first = match self.last_finalized() {
            Some(last) if last >= newest => return Ok(0),
            Some(last) => (last + 1).max(oldest_retained),
            None => oldest_retained,
        };

        let mut finalized = 0;
        for bucket in first..=newest {
            let _gate = self.finalize_gate.write();
            self.finalize_bucket(bucket)?;
            finalized += 1;
        }
        Ok(finalized)
    }

    /// Remove series without any retained data and rewrite the key list.
    /// Returns the number of series removed.
    pub fn evict_cold_series(&self) -> Result<usize> {
        let buckets = self.config.buckets;
        // A put between creating a row and adding its point must not see
        // the row evicted
        let _gate = self.finalize_gate.write();
        let mut index = self.index.write();

        let cold: Vec<SeriesId> = index
            .by_id
            .values()
            .filter(|row| !row.series.has_data_points(buckets))
            .map(|row| row.id)
            .collect();
        if cold.is_empty() {
            return Ok(0);
        }

        for id in &cold {
            if let Some(row) = index.by_id.remove(id) {
                index.by_key.remove(&row.key);
            }
        }

        if let Some(key_list) = &self.key_list {
            let mut entries: Vec<KeyEntry> = index
                .by_id
                .values()
                .map(|row| KeyEntry {
                    id: row.id,
                    key: row.key.clone(),
                    category: row.series.category(),
                })
                .collect();
            entries.sort_by_key(|e| e.id);
            key_list.rewrite(&entries)?;
        }

        info!("Evicted {} cold series from shard {}", cold.len(), self.shard_id);
        Ok(cold.len())
    }

    /// Read the key list and create an empty series for every key.
    /// Moves the shard from `PreOwned` to `ReadingKeysDone`.
    pub fn read_key_list(&self) -> Result<usize> {
        self.set_state(ShardState::ReadingKeys)?;

        let entries = match &self.key_list {
            Some(key_list) => key_list.read_all()?,
            None => Vec::new(),
        };

        let count = entries.len();
        {
            let mut index = self.index.write();
            for entry in entries {
                let row = self.new_row(entry.id, entry.key, Some(entry.category));
                index.insert(Arc::new(row));
            }
        }

        self.set_state(ShardState::ReadingKeysDone)?;
        info!("Shard {} read {} keys", self.shard_id, count);
        Ok(count)
    }

    /// Replay the data log of every bucket newer than the newest block
    /// file. Returns the number of points replayed.
    pub fn read_data_log(&self) -> Result<usize> {
        self.set_state(ShardState::ReadingLogs)?;

        let newest_file = self.storage.newest_block_file()?;
        if let Some(bucket) = newest_file {
            let mut last = self.last_finalized.lock();
            *last = (*last).max(Some(bucket));
        }

        let Some(wal) = &self.wal else {
            return Ok(0);
        };
        wal.sync()?;

        let reader = WalReader::new(WalConfig {
            dir: self.log_dir(),
            sync_policy: self.config.sync_policy,
        });
        let from = newest_file.map_or(0, |bucket| bucket.saturating_add(1));

        let mut logged_points: Vec<(BucketNumber, LoggedPoint)> = Vec::new();
        for entry in reader.recover_from(from)? {
            logged_points.extend(entry.decode_points()?.into_iter().map(|p| (entry.bucket, p)));
        }
        // Concurrent writers may log the points of one series out of order
        logged_points.sort_by_key(|(bucket, p)| (*bucket, p.series_id, p.timestamp));

        let mut replayed = 0;
        let mut skipped = 0;
        for (bucket, logged) in logged_points {
            let Some(row) = self.find_by_id(logged.series_id) else {
                skipped += 1;
                continue;
            };
            let point = TimeValuePair::new(logged.timestamp, logged.value);
            match row
                .series
                .put(bucket, row.id, point, &self.storage, logged.category)
            {
                Ok(()) => replayed += 1,
                Err(e) => {
                    debug!("Skipping logged point of series {}: {}", row.id, e);
                    skipped += 1;
                }
            }
        }

        info!(
            "Shard {} replayed {} logged points, skipped {}",
            self.shard_id, replayed, skipped
        );
        Ok(replayed)
    }

    /// Apply the points queued while keys and logs were read. Returns the
    /// number of points stored.
    pub fn process_queued_data_points(&self) -> Result<usize> {
        let queued = {
            let mut state = self.state.lock();
            *state = state.transition(ShardState::ProcessingQueuedDataPoints)?;
            std::mem::take(&mut *self.queue.lock())
        };

        let total = queued.len();
        let mut stored = 0;
        for QueuedPoint {
            key,
            point,
            category,
        } in queued
        {
            match self.put_owned(&key, point, category) {
                Ok(_) => stored += 1,
                Err(e) => warn!("Dropping queued point for {}: {}", key, e),
            }
        }

        info!(
            "Shard {} applied {} of {} queued points",
            self.shard_id, stored, total
        );
        Ok(stored)
    }

    /// Load the retained block files and attach their blocks to the series.
    /// Moves the shard to `Owned`. Returns the number of blocks attached.
    pub fn read_block_files(&self) -> Result<usize> {
        self.set_state(ShardState::ReadingBlockData)?;

        let mut attached = 0;
        for block in self.storage.load()? {
            match self.find_by_id(block.series_id) {
                Some(row) => {
                    row.series
                        .set_data_block(block.bucket, self.config.buckets, block.id);
                    attached += 1;
                }
                None => debug!(
                    "Block of unknown series {} in bucket {}",
                    block.series_id, block.bucket
                ),
            }
        }

        if let Some(bucket) = self.storage.last_finalized() {
            let mut last = self.last_finalized.lock();
            *last = (*last).max(Some(bucket));
        }

        self.set_state(ShardState::Owned)?;
        info!("Shard {} attached {} blocks", self.shard_id, attached);
        Ok(attached)
    }

    /// Shard statistics
    pub fn stats(&self) -> ShardStats {
        let state = self.state();
        let queued_points = self.queue.lock().len();

        let index = self.index.read();
        let mut active_points = 0;
        let mut cold_series = 0;
        for row in index.by_id.values() {
            active_points += row.series.active_count() as usize;
            if row.series.queried_buckets_ago() >= self.config.buckets {
                cold_series += 1;
            }
        }

        ShardStats {
            shard_id: self.shard_id,
            state,
            series: index.by_id.len(),
            active_points,
            cold_series,
            queued_points,
            storage: self.storage.stats(),
        }
    }

    fn put_owned(
        &self,
        key: &str,
        point: TimeValuePair,
        category: Option<Category>,
    ) -> Result<PutOutcome> {
        let _gate = self.finalize_gate.read();

        let bucket = self.bucket(point.timestamp);
        if let Some(last) = self.last_finalized() {
            if bucket <= last {
                return Err(TideError::InvalidBucket {
                    bucket,
                    current: last.saturating_add(1),
                });
            }
        }

        let (row, new_series) = self.find_or_create(key, category)?;
        row.series
            .put(bucket, row.id, point, &self.storage, category)?;

        // Only accepted points are logged, so a rejected point never
        // reappears on replay
        if let Some(wal) = &self.wal {
            let logged = LoggedPoint {
                series_id: row.id,
                timestamp: point.timestamp,
                value: point.value,
                category,
            };
            wal.append(bucket, &WalEntry::points(bucket, &[logged])?)?;
        }
        Ok(PutOutcome::Stored { new_series })
    }

    fn finalize_bucket(&self, bucket: BucketNumber) -> Result<()> {
        let rows: Vec<Arc<SeriesRow>> = self.index.read().by_id.values().cloned().collect();

        let mut failed = 0;
        for row in &rows {
            if let Err(e) = row
                .series
                .set_current_bucket(bucket + 1, row.id, &self.storage)
            {
                warn!(
                    "Series {} could not close bucket {}: {}",
                    row.id, bucket, e
                );
                failed += 1;
            }
        }

        match self.storage.finalize_bucket(bucket) {
            Ok(_) => {}
            Err(TideError::BucketExpired(_)) => {
                warn!("Bucket {} was overwritten before it was finalized", bucket);
            }
            Err(e) => return Err(e),
        }

        if let Some(wal) = &self.wal {
            wal.truncate_before(bucket + 1)?;
        }

        let mut last = self.last_finalized.lock();
        *last = (*last).max(Some(bucket));

        if failed > 0 {
            warn!(
                "Shard {} finalized bucket {} with {} series failing to flush",
                self.shard_id, bucket, failed
            );
        }
        Ok(())
    }

    fn find(&self, key: &str) -> Option<Arc<SeriesRow>> {
        self.index.read().by_key.get(key).cloned()
    }

    fn find_by_id(&self, id: SeriesId) -> Option<Arc<SeriesRow>> {
        self.index.read().by_id.get(&id).cloned()
    }

    fn find_or_create(
        &self,
        key: &str,
        category: Option<Category>,
    ) -> Result<(Arc<SeriesRow>, bool)> {
        if let Some(row) = self.find(key) {
            return Ok((row, false));
        }

        let mut index = self.index.write();
        if let Some(row) = index.by_key.get(key) {
            return Ok((Arc::clone(row), false));
        }

        let id = index.next_id;
        let row = self.new_row(id, key.to_string(), category);
        if let Some(key_list) = &self.key_list {
            key_list.append(&KeyEntry {
                id,
                key: row.key.clone(),
                category: row.series.category(),
            })?;
        }

        let row = Arc::new(row);
        index.insert(Arc::clone(&row));
        debug!("Shard {} created series {} for {}", self.shard_id, id, key);
        Ok((row, true))
    }

    fn new_row(&self, id: SeriesId, key: String, category: Option<Category>) -> SeriesRow {
        let series = BucketedTimeSeries::new(self.config.buckets)
            .with_min_timestamp_delta(self.config.min_timestamp_delta);
        if let Some(category) = category {
            series.set_category(category);
        }
        SeriesRow { id, key, series }
    }

    fn log_dir(&self) -> PathBuf {
        self.config
            .data_dir
            .as_ref()
            .map(|dir| dir.join("log"))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::decode_block;
    use tempfile::TempDir;

    const HOUR: i64 = 3600;

    fn test_config(data_dir: Option<PathBuf>) -> ShardConfig {
        ShardConfig {
            buckets: 3,
            bucket_duration: HOUR as u64,
            min_timestamp_delta: 0,
            data_dir,
            sync_policy: SyncPolicy::Immediate,
            use_lz4: true,
        }
    }

    fn recover(map: &BucketMap) {
        map.set_state(ShardState::PreOwned).unwrap();
        map.read_key_list().unwrap();
        map.read_data_log().unwrap();
        map.process_queued_data_points().unwrap();
        map.read_block_files().unwrap();
    }

    fn owned(data_dir: Option<PathBuf>) -> BucketMap {
        let map = BucketMap::new(1, test_config(data_dir)).unwrap();
        recover(&map);
        map
    }

    fn points(map: &BucketMap, key: &str, begin: Timestamp, end: Timestamp) -> Vec<(i64, f64)> {
        map.get(key, begin, end)
            .unwrap()
            .unwrap_or_default()
            .iter()
            .flat_map(|b| decode_block(b).unwrap())
            .map(|p| (p.timestamp, p.value))
            .collect()
    }

    #[test]
    fn test_unowned_rejects() {
        let map = BucketMap::new(7, test_config(None)).unwrap();
        assert!(matches!(
            map.put("a", TimeValuePair::new(1, 1.0), None),
            Err(TideError::NotOwned(7))
        ));
        assert!(matches!(map.get("a", 0, 10), Err(TideError::NotOwned(7))));
    }

    #[test]
    fn test_put_and_get() {
        let map = owned(None);

        let outcome = map.put("cpu", TimeValuePair::new(100, 1.0), None).unwrap();
        assert_eq!(outcome, PutOutcome::Stored { new_series: true });
        let outcome = map.put("cpu", TimeValuePair::new(HOUR + 5, 2.0), None).unwrap();
        assert_eq!(outcome, PutOutcome::Stored { new_series: false });

        assert_eq!(
            points(&map, "cpu", 0, 2 * HOUR),
            vec![(100, 1.0), (HOUR + 5, 2.0)]
        );
        assert!(map.get("missing", 0, HOUR).unwrap().is_none());

        let stats = map.stats();
        assert_eq!(stats.series, 1);
        assert_eq!(stats.active_points, 1);
        assert_eq!(stats.cold_series, 0);
    }

    #[test]
    fn test_points_queued_during_recovery() {
        let map = BucketMap::new(1, test_config(None)).unwrap();
        map.set_state(ShardState::PreOwned).unwrap();

        let outcome = map.put("mem", TimeValuePair::new(10, 5.0), None).unwrap();
        assert_eq!(outcome, PutOutcome::Queued);
        assert_eq!(map.stats().queued_points, 1);

        map.read_key_list().unwrap();
        map.read_data_log().unwrap();
        assert_eq!(map.process_queued_data_points().unwrap(), 1);
        map.read_block_files().unwrap();

        assert_eq!(map.state(), ShardState::Owned);
        assert_eq!(points(&map, "mem", 0, HOUR), vec![(10, 5.0)]);
    }

    #[test]
    fn test_finalize_buckets() {
        let map = owned(None);
        map.put("a", TimeValuePair::new(10, 1.0), None).unwrap();
        map.put("b", TimeValuePair::new(20, 2.0), None).unwrap();

        assert_eq!(map.finalize_buckets(HOUR + 1).unwrap(), 1);
        assert_eq!(map.last_finalized(), Some(0));
        assert_eq!(map.finalize_buckets(HOUR + 2).unwrap(), 0);

        // Late write into a finalized bucket
        assert!(matches!(
            map.put("a", TimeValuePair::new(30, 3.0), None),
            Err(TideError::InvalidBucket { bucket: 0, current: 1 })
        ));

        assert_eq!(points(&map, "a", 0, HOUR), vec![(10, 1.0)]);
        assert_eq!(map.storage().stats().blocks, 2);

        assert_eq!(map.finalize_buckets(4 * HOUR).unwrap(), 3);
        assert_eq!(map.last_finalized(), Some(3));
    }

    #[test]
    fn test_finalize_requires_ownership() {
        let map = BucketMap::new(1, test_config(None)).unwrap();
        assert_eq!(map.finalize_buckets(10 * HOUR).unwrap(), 0);
    }

    #[test]
    fn test_evict_cold_series() {
        let map = owned(None);
        map.put("old", TimeValuePair::new(10, 1.0), None).unwrap();
        map.put("new", TimeValuePair::new(10, 1.0), None).unwrap();
        map.finalize_buckets(HOUR + 1).unwrap();

        map.put("new", TimeValuePair::new(5 * HOUR, 1.0), None).unwrap();
        map.finalize_buckets(5 * HOUR).unwrap();

        assert_eq!(map.evict_cold_series().unwrap(), 1);
        assert!(map.get("old", 0, 6 * HOUR).unwrap().is_none());
        assert!(map.get("new", 0, 6 * HOUR).unwrap().is_some());
    }

    #[test]
    fn test_unowned_clears_series() {
        let map = owned(None);
        map.put("a", TimeValuePair::new(10, 1.0), None).unwrap();
        map.set_state(ShardState::Unowned).unwrap();
        assert_eq!(map.stats().series, 0);
        assert!(map.set_state(ShardState::Owned).is_err());
    }

    #[test]
    fn test_restart_recovers_keys_logs_and_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();

        {
            let map = owned(Some(dir.clone()));
            map.put("a", TimeValuePair::new(10, 1.0), Some(4)).unwrap();
            map.put("b", TimeValuePair::new(20, 2.0), None).unwrap();
            map.put("a", TimeValuePair::new(HOUR + 10, 3.0), None).unwrap();
            assert_eq!(map.finalize_buckets(HOUR + 30).unwrap(), 1);
            map.put("a", TimeValuePair::new(HOUR + 40, 4.0), None).unwrap();
        }

        let map = BucketMap::new(1, test_config(Some(dir))).unwrap();
        recover(&map);

        assert_eq!(map.stats().series, 2);
        assert_eq!(map.last_finalized(), Some(0));
        assert_eq!(
            points(&map, "a", 0, 2 * HOUR),
            vec![(10, 1.0), (HOUR + 10, 3.0), (HOUR + 40, 4.0)]
        );
        assert_eq!(points(&map, "b", 0, 2 * HOUR), vec![(20, 2.0)]);
    }

    #[test]
    fn test_rejected_write_stays_rejected_after_restart() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();

        {
            let map = owned(Some(dir.clone()));
            map.put("a", TimeValuePair::new(5 * HOUR, 5.0), None).unwrap();
            assert!(matches!(
                map.put("a", TimeValuePair::new(4 * HOUR + 1, 4.0), None),
                Err(TideError::InvalidBucket { bucket: 4, current: 5 })
            ));
        }

        let map = BucketMap::new(1, test_config(Some(dir))).unwrap();
        recover(&map);
        assert_eq!(points(&map, "a", 0, 6 * HOUR), vec![(5 * HOUR, 5.0)]);
    }

    #[test]
    fn test_first_finalize_persists_older_buckets() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();

        {
            let map = owned(Some(dir.clone()));
            map.put("a", TimeValuePair::new(10, 1.0), None).unwrap();
        }
        {
            let map = BucketMap::new(1, test_config(Some(dir.clone()))).unwrap();
            recover(&map);
            assert_eq!(map.finalize_buckets(3 * HOUR + 1).unwrap(), 3);
            assert_eq!(map.last_finalized(), Some(2));
        }

        let map = BucketMap::new(1, test_config(Some(dir))).unwrap();
        recover(&map);
        assert_eq!(points(&map, "a", 0, 4 * HOUR), vec![(10, 1.0)]);
    }

    #[test]
    fn test_eviction_waits_for_writers() {
        let map = owned(None);

        // Hold the gate like a put that created its row but has not added
        // the point yet
        let gate = map.finalize_gate.read();
        let (row, new_series) = map.find_or_create("late", None).unwrap();
        assert!(new_series);

        let shard = &map;
        std::thread::scope(|s| {
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            let evictor = s.spawn(move || {
                let evicted = shard.evict_cold_series().unwrap();
                done_tx.send(()).unwrap();
                evicted
            });

            assert!(done_rx
                .recv_timeout(std::time::Duration::from_millis(100))
                .is_err());
            row.series
                .put(0, row.id, TimeValuePair::new(10, 1.0), &map.storage, None)
                .unwrap();
            drop(gate);

            assert_eq!(evictor.join().unwrap(), 0);
        });

        assert_eq!(points(&map, "late", 0, HOUR), vec![(10, 1.0)]);
    }

    #[test]
    fn test_reliable_start() {
        let map = BucketMap::new(1, test_config(None)).unwrap();
        assert_eq!(map.reliable_start(HOUR), 0);
        assert_eq!(map.reliable_start(10 * HOUR + 5), 7 * HOUR);
    }

    #[test]
    fn test_bucket_mapping() {
        let map = BucketMap::new(1, test_config(None)).unwrap();
        assert_eq!(map.bucket(0), 0);
        assert_eq!(map.bucket(HOUR - 1), 0);
        assert_eq!(map.bucket(HOUR), 1);
        assert_eq!(map.bucket(-5), 0);
        assert_eq!(map.timestamp(3), 3 * HOUR);
    }

    #[test]
    fn test_invalid_config() {
        let config = ShardConfig {
            buckets: 0,
            ..ShardConfig::default()
        };
        assert!(matches!(BucketMap::new(1, config), Err(TideError::Config(_))));
    }
}

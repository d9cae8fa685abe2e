//! Service - routes requests to the shards owned by this process

use crate::compression::decode_block;
use crate::shard::{BucketMap, PutOutcome, ShardConfig, ShardState, ShardStats};
use crate::{Category, Result, ShardId, TideError, TimeRange, TimeValuePair, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Shards served by this process
    pub shards: Vec<ShardId>,
    /// Settings shared by every shard
    pub shard: ShardConfig,
    /// Root directory; each shard keeps its files in `<data_dir>/<shard_id>`
    pub data_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shards: vec![1],
            shard: ShardConfig::default(),
            data_dir: None,
        }
    }
}

/// One point to write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutPoint {
    pub key: String,
    pub shard_id: ShardId,
    pub timestamp: Timestamp,
    pub value: f64,
    #[serde(default)]
    pub category: Option<Category>,
}

/// Batch of points to write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutRequest {
    pub points: Vec<PutPoint>,
}

/// Result of a write batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    /// Points accepted, queued ones included
    pub stored: usize,
    /// Points held until their shard finishes recovery
    pub queued: usize,
}

/// Range read of one series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
    pub shard_id: ShardId,
    pub begin: Timestamp,
    pub end: Timestamp,
}

/// Points of one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    pub key: String,
    pub shard_id: ShardId,
    pub points: Vec<TimeValuePair>,
    /// Set while the shard is still loading block files
    pub partial: bool,
    /// Oldest timestamp still retained; points before it may have expired
    pub reliable_start: Timestamp,
}

/// Service statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub series: usize,
    pub shards: Vec<ShardStats>,
}

/// TideDB service
pub struct TideService {
    shards: BTreeMap<ShardId, Arc<BucketMap>>,
}

impl TideService {
    /// Create the shards of `config`. They stay unowned until [`start`].
    ///
    /// [`start`]: TideService::start
    pub fn new(config: ServiceConfig) -> Result<Self> {
        if config.shards.is_empty() {
            return Err(TideError::Config("No shards configured".into()));
        }

        let mut shards = BTreeMap::new();
        for &shard_id in &config.shards {
            let shard_config = ShardConfig {
                data_dir: config
                    .data_dir
                    .as_ref()
                    .map(|dir| dir.join(shard_id.to_string())),
                ..config.shard.clone()
            };
            let map = BucketMap::new(shard_id, shard_config)?;
            if shards.insert(shard_id, Arc::new(map)).is_some() {
                return Err(TideError::Config(format!("Shard {} listed twice", shard_id)));
            }
        }

        Ok(Self { shards })
    }

    /// Take ownership of every shard and recover it.
    ///
    /// Keys, logs and queued points are processed for all shards before any
    /// block file is read, so every shard accepts writes as early as
    /// possible.
    pub fn start(&self) -> Result<()> {
        for map in self.shards.values() {
            map.set_state(ShardState::PreOwned)?;
        }
        for map in self.shards.values() {
            map.read_key_list()?;
            map.read_data_log()?;
            map.process_queued_data_points()?;
        }
        for map in self.shards.values() {
            map.read_block_files()?;
        }

        info!("Started {} shards", self.shards.len());
        Ok(())
    }

    /// Shard by id
    pub fn shard(&self, shard_id: ShardId) -> Option<&Arc<BucketMap>> {
        self.shards.get(&shard_id)
    }

    /// Write a batch of points. Stops at the first failing point.
    pub fn put(&self, request: &PutRequest) -> Result<PutResponse> {
        let mut response = PutResponse::default();

        for point in &request.points {
            let map = self.require_shard(point.shard_id)?;
            let outcome = map.put(
                &point.key,
                TimeValuePair::new(point.timestamp, point.value),
                point.category,
            )?;

            response.stored += 1;
            if outcome == PutOutcome::Queued {
                response.queued += 1;
            }
        }

        Ok(response)
    }

    /// Read the points of one series within `[begin, end]`
    pub fn get(&self, request: &GetRequest) -> Result<GetResponse> {
        self.get_at(request, chrono::Utc::now().timestamp())
    }

    /// Read as of `now`, which only affects the reported reliable start
    pub fn get_at(&self, request: &GetRequest, now: Timestamp) -> Result<GetResponse> {
        let map = self.require_shard(request.shard_id)?;

        let state = map.state();
        if state == ShardState::Unowned {
            return Err(TideError::NotOwned(request.shard_id));
        }
        if !state.serves_reads() {
            return Err(TideError::ShardInProgress(request.shard_id));
        }

        let range = TimeRange::new(request.begin, request.end);
        let mut points = Vec::new();
        if request.begin <= request.end {
            let blocks = map
                .get(&request.key, request.begin, request.end)?
                .unwrap_or_default();
            for block in &blocks {
                match decode_block(block) {
                    Ok(decoded) => {
                        points.extend(decoded.into_iter().filter(|p| range.contains(p.timestamp)))
                    }
                    Err(e) => warn!("Skipping undecodable block of {}: {}", request.key, e),
                }
            }
        }

        Ok(GetResponse {
            key: request.key.clone(),
            shard_id: request.shard_id,
            points,
            partial: state == ShardState::ReadingBlockData,
            reliable_start: map.reliable_start(now),
        })
    }

    /// Finalize the buckets that ended before `now` on every shard
    pub fn finalize_buckets(&self, now: Timestamp) -> Result<usize> {
        let mut finalized = 0;
        for map in self.shards.values() {
            finalized += map.finalize_buckets(now)?;
        }
        Ok(finalized)
    }

    /// Finalize against the wall clock
    pub fn finalize_now(&self) -> Result<usize> {
        self.finalize_buckets(chrono::Utc::now().timestamp())
    }

    /// Drop series without retained data on every owned shard
    pub fn evict_cold_series(&self) -> Result<usize> {
        let mut evicted = 0;
        for map in self.shards.values() {
            if map.state() == ShardState::Owned {
                evicted += map.evict_cold_series()?;
            }
        }
        Ok(evicted)
    }

    /// Service statistics
    pub fn stats(&self) -> ServiceStats {
        let shards: Vec<ShardStats> = self.shards.values().map(|map| map.stats()).collect();
        ServiceStats {
            series: shards.iter().map(|s| s.series).sum(),
            shards,
        }
    }

    fn require_shard(&self, shard_id: ShardId) -> Result<&Arc<BucketMap>> {
        self.shards
            .get(&shard_id)
            .ok_or(TideError::ShardNotFound(shard_id))
    }
}

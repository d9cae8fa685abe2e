//! Shard-level block storage with bucket retention and block files

use super::block::{BlockFileHeader, BlockRecord};
use super::{BlockId, BlockStore, RecoveredBlock, StorageConfig, StorageStats};
use crate::{BucketNumber, Result, SeriesId, TideError, TimeSeriesBlock};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Blocks of the retained buckets, one slot per `bucket mod buckets`
pub struct BucketStorage {
    config: StorageConfig,
    slots: Vec<RwLock<BucketSlot>>,
    last_finalized: Mutex<Option<BucketNumber>>,
}

#[derive(Debug, Default)]
struct BucketSlot {
    bucket: Option<BucketNumber>,
    blocks: Vec<StoredBlock>,
    bytes: usize,
    finalized: bool,
}

#[derive(Debug)]
struct StoredBlock {
    series_id: SeriesId,
    count: u16,
    data: Vec<u8>,
}

impl BucketSlot {
    fn claim(&mut self, bucket: BucketNumber) {
        self.bucket = Some(bucket);
        self.blocks.clear();
        self.bytes = 0;
        self.finalized = false;
    }

    fn push(&mut self, series_id: SeriesId, count: u16, data: Vec<u8>) -> u32 {
        let index = self.blocks.len() as u32;
        self.bytes += data.len();
        self.blocks.push(StoredBlock {
            series_id,
            count,
            data,
        });
        index
    }
}

fn block_id(bucket: BucketNumber, index: u32) -> BlockId {
    BlockId::from_raw((u64::from(bucket) << 32) | u64::from(index))
}

fn split_block_id(id: BlockId) -> (BucketNumber, u32) {
    let raw = id.as_u64();
    ((raw >> 32) as BucketNumber, raw as u32)
}

fn block_file_name(bucket: BucketNumber) -> String {
    format!("blocks_{:010}.tdb", bucket)
}

fn parse_block_file_name(path: &Path) -> Option<BucketNumber> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("blocks_"))
        .and_then(|s| s.strip_suffix(".tdb"))
        .and_then(|s| s.parse().ok())
}

impl BucketStorage {
    /// Create block storage, creating the data directory if configured
    pub fn new(config: StorageConfig) -> Result<Self> {
        if config.buckets == 0 {
            return Err(TideError::Config("Block storage needs at least one bucket".into()));
        }
        if let Some(dir) = &config.data_dir {
            fs::create_dir_all(dir)?;
        }

        let slots = (0..config.buckets)
            .map(|_| RwLock::new(BucketSlot::default()))
            .collect();

        Ok(Self {
            config,
            slots,
            last_finalized: Mutex::new(None),
        })
    }

    /// Create memory-only block storage
    pub fn in_memory(buckets: u8) -> Result<Self> {
        Self::new(StorageConfig {
            buckets,
            data_dir: None,
            ..Default::default()
        })
    }

    /// Storage configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Newest bucket finalized by this storage, or loaded from disk
    pub fn last_finalized(&self) -> Option<BucketNumber> {
        *self.last_finalized.lock()
    }

    /// Close `bucket` for new blocks and persist it when a data directory is
    /// configured. Block files that fell out of retention are deleted.
    ///
    /// Returns the number of blocks in the bucket.
    pub fn finalize_bucket(&self, bucket: BucketNumber) -> Result<usize> {
        let mut slot = self.slots[self.slot_index(bucket)].write();
        match slot.bucket {
            Some(held) if held > bucket => return Err(TideError::BucketExpired(bucket)),
            Some(held) if held == bucket => {}
            _ => slot.claim(bucket),
        }

        if let Some(dir) = &self.config.data_dir {
            self.write_bucket_file(dir, bucket, &slot.blocks)?;
            self.expire_block_files(dir, bucket)?;
        }
        slot.finalized = true;
        let blocks = slot.blocks.len();
        drop(slot);

        let mut last = self.last_finalized.lock();
        *last = (*last).max(Some(bucket));

        info!("Finalized bucket {} with {} blocks", bucket, blocks);
        Ok(blocks)
    }

    /// Newest bucket that has a block file on disk, without reading it
    pub fn newest_block_file(&self) -> Result<Option<BucketNumber>> {
        match &self.config.data_dir {
            Some(dir) => Ok(Self::list_block_files(dir)?.into_iter().map(|(b, _)| b).max()),
            None => Ok(None),
        }
    }

    /// Read the retained block files back into memory.
    ///
    /// Files that fail validation are skipped. A file never replaces a
    /// newer bucket already held in its slot.
    pub fn load(&self) -> Result<Vec<RecoveredBlock>> {
        let Some(dir) = &self.config.data_dir else {
            return Ok(Vec::new());
        };

        let mut files = Self::list_block_files(dir)?;
        files.sort_by_key(|(bucket, _)| *bucket);
        let Some(&(newest, _)) = files.last() else {
            return Ok(Vec::new());
        };
        let oldest_retained = newest.saturating_sub(u32::from(self.config.buckets) - 1);

        let mut recovered = Vec::new();
        let mut loaded_files = 0;

        for (bucket, path) in files.into_iter().filter(|(b, _)| *b >= oldest_retained) {
            let records = match Self::read_bucket_file(&path) {
                Ok((header, records)) if header.bucket == bucket => records,
                Ok((header, _)) => {
                    warn!(
                        "Block file {:?} holds bucket {}, expected {}",
                        path, header.bucket, bucket
                    );
                    continue;
                }
                Err(e) => {
                    warn!("Skipping block file {:?}: {}", path, e);
                    continue;
                }
            };

            let mut slot = self.slots[self.slot_index(bucket)].write();
            if slot.bucket.is_some_and(|held| held >= bucket) {
                debug!("Bucket {} already held, not loading {:?}", bucket, path);
                continue;
            }

            slot.claim(bucket);
            slot.finalized = true;
            for record in records {
                let series_id = record.series_id;
                let index = slot.push(series_id, record.count, record.data);
                recovered.push(RecoveredBlock {
                    bucket,
                    series_id,
                    id: block_id(bucket, index),
                });
            }
            loaded_files += 1;

            let mut last = self.last_finalized.lock();
            *last = (*last).max(Some(bucket));
        }

        info!(
            "Loaded {} blocks from {} block files in {:?}",
            recovered.len(),
            loaded_files,
            dir
        );
        Ok(recovered)
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        let mut stats = StorageStats {
            last_finalized: self.last_finalized(),
            ..Default::default()
        };
        for slot in &self.slots {
            let slot = slot.read();
            if slot.bucket.is_some() {
                stats.buckets += 1;
                stats.blocks += slot.blocks.len();
                stats.bytes += slot.bytes;
            }
        }
        stats
    }

    fn slot_index(&self, bucket: BucketNumber) -> usize {
        bucket as usize % self.slots.len()
    }

    fn write_bucket_file(&self, dir: &Path, bucket: BucketNumber, blocks: &[StoredBlock]) -> Result<()> {
        let path = dir.join(block_file_name(bucket));
        let tmp_path = path.with_extension("tdb.tmp");

        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(&BlockFileHeader::new(bucket, blocks.len() as u32).to_bytes())?;
            for block in blocks {
                let record = BlockRecord {
                    series_id: block.series_id,
                    count: block.count,
                    data: block.data.clone(),
                };
                writer.write_all(&record.to_bytes(self.config.use_lz4))?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &path)?;
        debug!("Wrote block file {:?}", path);
        Ok(())
    }

    fn expire_block_files(&self, dir: &Path, newest: BucketNumber) -> Result<usize> {
        let retained = u32::from(self.config.buckets);
        if newest < retained {
            return Ok(0);
        }
        let expired_up_to = newest - retained;

        let mut removed = 0;
        for (bucket, path) in Self::list_block_files(dir)? {
            if bucket <= expired_up_to {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Removed {} expired block files", removed);
        }
        Ok(removed)
    }

    fn list_block_files(dir: &Path) -> Result<Vec<(BucketNumber, PathBuf)>> {
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(bucket) = parse_block_file_name(&path) {
                files.push((bucket, path));
            }
        }
        Ok(files)
    }

    fn read_bucket_file(path: &Path) -> Result<(BlockFileHeader, Vec<BlockRecord>)> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let header = BlockFileHeader::from_bytes(&data)?;
        let mut records = Vec::with_capacity(header.record_count as usize);
        let mut offset = BlockFileHeader::SIZE;

        for _ in 0..header.record_count {
            let (record, consumed) = BlockRecord::from_bytes(&data[offset..])?;
            records.push(record);
            offset += consumed;
        }

        if offset != data.len() {
            return Err(TideError::Corruption(format!(
                "{} trailing bytes in block file",
                data.len() - offset
            )));
        }

        Ok((header, records))
    }
}

impl BlockStore for BucketStorage {
    fn bucket_capacity(&self) -> u8 {
        self.config.buckets
    }

    fn store(
        &self,
        bucket: BucketNumber,
        data: &[u8],
        count: u16,
        series_id: SeriesId,
    ) -> Result<BlockId> {
        let mut slot = self.slots[self.slot_index(bucket)].write();
        match slot.bucket {
            Some(held) if held > bucket => return Err(TideError::BucketExpired(bucket)),
            Some(held) if held == bucket => {
                if slot.finalized {
                    return Err(TideError::BucketFinalized(bucket));
                }
            }
            Some(held) => {
                debug!("Evicting bucket {} for bucket {}", held, bucket);
                slot.claim(bucket);
            }
            None => slot.claim(bucket),
        }

        let index = slot.push(series_id, count, data.to_vec());
        trace!("Stored block {} for series {} in bucket {}", index, series_id, bucket);
        Ok(block_id(bucket, index))
    }

    fn fetch(&self, bucket: BucketNumber, id: BlockId) -> Result<Option<TimeSeriesBlock>> {
        let (id_bucket, index) = split_block_id(id);
        if id_bucket != bucket {
            return Ok(None);
        }

        let slot = self.slots[self.slot_index(bucket)].read();
        if slot.bucket != Some(bucket) {
            return Ok(None);
        }

        Ok(slot
            .blocks
            .get(index as usize)
            .map(|block| TimeSeriesBlock::new(block.data.clone(), block.count)))
    }
}

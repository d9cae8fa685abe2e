//! Rolling window of bucketed data for one series

use super::ring::BlockRing;
use crate::compression::PointStream;
use crate::storage::{BlockId, BlockStore};
use crate::{
    config, BucketNumber, Category, Result, SeriesId, TideError, TimeSeriesBlock, TimeValuePair,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{trace, warn};

/// Recency value of a series that has not been read since it was reset
pub const NEVER_QUERIED: u8 = u8::MAX;

/// Mutable part of a series, guarded by one lock
#[derive(Debug)]
struct SeriesState {
    stream: PointStream,
    count: u16,
    current: Option<BucketNumber>,
    blocks: BlockRing,
}

impl SeriesState {
    fn new(capacity: u8) -> Self {
        Self {
            stream: PointStream::new(),
            count: 0,
            current: None,
            blocks: BlockRing::new(capacity),
        }
    }

    fn clear_active(&mut self) {
        self.stream.reset();
        self.count = 0;
    }
}

/// One series: an open bucket accepting writes plus references to the
/// closed buckets still retained.
///
/// Writes to a newer bucket first rotate the series, flushing each bucket in
/// between to the [`BlockStore`]. Every operation holds the series lock for
/// its whole body, so readers never observe a half-rotated series.
#[derive(Debug)]
pub struct BucketedTimeSeries {
    state: RwLock<SeriesState>,
    queried_buckets_ago: AtomicU8,
    min_timestamp_delta: i64,
}

impl BucketedTimeSeries {
    /// Create an empty series retaining `capacity` closed buckets.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: u8) -> Self {
        Self {
            state: RwLock::new(SeriesState::new(capacity)),
            queried_buckets_ago: AtomicU8::new(NEVER_QUERIED),
            min_timestamp_delta: config::MIN_TIMESTAMP_DELTA,
        }
    }

    /// Override the minimum spacing between consecutive points
    pub fn with_min_timestamp_delta(mut self, min_delta: i64) -> Self {
        self.min_timestamp_delta = min_delta;
        self
    }

    /// Reinitialize with `capacity` closed buckets and no data.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn reset(&mut self, capacity: u8) {
        *self.state.get_mut() = SeriesState::new(capacity);
        *self.queried_buckets_ago.get_mut() = NEVER_QUERIED;
    }

    /// Add a point to `bucket`, rotating first if `bucket` is newer than the
    /// open one. A `category` overrides the series category.
    pub fn put<S: BlockStore + ?Sized>(
        &self,
        bucket: BucketNumber,
        series_id: SeriesId,
        point: TimeValuePair,
        store: &S,
        category: Option<Category>,
    ) -> Result<()> {
        let mut state = self.state.write();

        match state.current {
            Some(current) if bucket < current => {
                return Err(TideError::InvalidBucket { bucket, current });
            }
            Some(current) if bucket == current => {}
            _ => self.open(&mut state, bucket, series_id, store)?,
        }

        if state.count == u16::MAX {
            return Err(TideError::BucketFull);
        }

        state
            .stream
            .append(point.timestamp, point.value, self.min_timestamp_delta)?;
        if let Some(category) = category {
            state.stream.set_category(category);
        }
        state.count += 1;
        Ok(())
    }

    /// Read the blocks of buckets `begin..=end`, oldest first, with the open
    /// bucket last when it falls inside the range.
    ///
    /// Buckets without data, no longer retained, or failing to load are
    /// skipped.
    pub fn get<S: BlockStore + ?Sized>(
        &self,
        begin: BucketNumber,
        end: BucketNumber,
        store: &S,
    ) -> Vec<TimeSeriesBlock> {
        let state = self.state.read();
        let Some(current) = state.current else {
            return Vec::new();
        };

        let live = begin <= current && end >= current;
        let mut out = Vec::new();

        if current > 0 {
            let capacity = u32::from(state.blocks.capacity());
            let end = end.min(current - 1);
            let begin = begin.max(current.saturating_sub(capacity));

            for bucket in begin..=end {
                let Some(id) = state.blocks.get(bucket) else {
                    continue;
                };
                match store.fetch(bucket, id) {
                    Ok(Some(block)) => out.push(block),
                    Ok(None) => trace!(bucket, %id, "block no longer held"),
                    Err(e) => warn!(bucket, %id, error = %e, "failed to fetch block"),
                }
            }
        }

        if live {
            out.push(TimeSeriesBlock::new(state.stream.read_raw(), state.count));
        }
        out
    }

    /// Rotate up to `bucket` without adding a point. No-op unless `bucket`
    /// is newer than the open bucket.
    pub fn set_current_bucket<S: BlockStore + ?Sized>(
        &self,
        bucket: BucketNumber,
        series_id: SeriesId,
        store: &S,
    ) -> Result<()> {
        let mut state = self.state.write();
        if state.current.map_or(true, |current| current < bucket) {
            self.open(&mut state, bucket, series_id, store)?;
        }
        Ok(())
    }

    /// Mark the series as read just now
    pub fn set_queried(&self) {
        self.queried_buckets_ago.store(0, Ordering::Relaxed);
    }

    /// Attach a recovered block for bucket `position`.
    ///
    /// A block at or past the open bucket moves the series forward to
    /// `position + 1` and discards the open bucket's points.
    pub fn set_data_block(&self, position: BucketNumber, capacity: u8, id: BlockId) {
        let mut state = self.state.write();
        debug_assert_eq!(capacity, state.blocks.capacity());

        if state.current.map_or(true, |current| position >= current) {
            state.current = Some(position.saturating_add(1));
            state.clear_active();
        }
        state.blocks.set(position, Some(id));
    }

    /// Check if the open bucket or any retained slot holds data
    pub fn has_data_points(&self, capacity: u8) -> bool {
        let state = self.state.read();
        debug_assert_eq!(capacity, state.blocks.capacity());
        state.count > 0 || state.blocks.has_blocks()
    }

    /// Rotations since the last read, [`NEVER_QUERIED`] if never read
    pub fn queried_buckets_ago(&self) -> u8 {
        self.queried_buckets_ago.load(Ordering::Relaxed)
    }

    /// Category tag of the series
    pub fn category(&self) -> Category {
        self.state.read().stream.category()
    }

    /// Replace the category tag
    pub fn set_category(&self, category: Category) {
        self.state.write().stream.set_category(category);
    }

    /// Bucket currently accepting writes, `None` before the first write
    pub fn current_bucket(&self) -> Option<BucketNumber> {
        self.state.read().current
    }

    /// Points in the open bucket
    pub fn active_count(&self) -> u16 {
        self.state.read().count
    }

    /// Number of closed buckets retained
    pub fn capacity(&self) -> u8 {
        self.state.read().blocks.capacity()
    }

    /// Advance the open bucket to `next`, flushing every bucket in between.
    ///
    /// A store failure stops the rotation at the bucket that failed; its
    /// points stay in the stream and buckets already rotated stay rotated.
    fn open<S: BlockStore + ?Sized>(
        &self,
        state: &mut SeriesState,
        next: BucketNumber,
        series_id: SeriesId,
        store: &S,
    ) -> Result<()> {
        let Some(mut current) = state.current else {
            state.current = Some(next);
            return Ok(());
        };

        while current < next {
            let id = if state.count > 0 {
                let data = state.stream.read_raw();
                Some(store.store(current, &data, state.count, series_id)?)
            } else {
                None
            };
            state.blocks.set(current, id);
            state.clear_active();
            current += 1;
            state.current = Some(current);
            self.age(1);

            // Past one full ring of empty buckets every slot is a gap
            let remaining = next - current;
            if remaining >= u32::from(state.blocks.capacity()) {
                state.blocks.clear();
                state.current = Some(next);
                self.age(remaining);
                trace!(series_id, from = current, to = next, "skipped empty buckets");
                break;
            }
        }
        Ok(())
    }

    fn age(&self, rotations: u32) {
        let _ = self
            .queried_buckets_ago
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |ago| {
                (ago < NEVER_QUERIED).then(|| {
                    u8::try_from(u32::from(ago).saturating_add(rotations)).unwrap_or(NEVER_QUERIED)
                })
            });
    }
}

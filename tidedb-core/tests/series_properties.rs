//! Property-based tests for the rolling-bucket series.
//!
//! A plain list of written points serves as the model: a range read must
//! return exactly the points whose bucket is both inside the requested range
//! and inside the retained window ending at the open bucket.

use parking_lot::Mutex;
use proptest::prelude::*;
use tidedb_core::compression::decode_block;
use tidedb_core::series::NEVER_QUERIED;
use tidedb_core::storage::{BlockId, BlockStore, BucketStorage};
use tidedb_core::{
    BucketNumber, BucketedTimeSeries, SeriesId, TideError, TimeSeriesBlock, TimeValuePair,
};

const DURATION: i64 = 1000;

fn bucket_of(timestamp: i64) -> BucketNumber {
    (timestamp / DURATION) as BucketNumber
}

/// Strictly increasing timestamps with occasional multi-bucket gaps, paired
/// with integral values
fn points_strategy() -> impl Strategy<Value = Vec<TimeValuePair>> {
    prop::collection::vec(
        (
            prop_oneof![4 => 1i64..400, 1 => 400i64..12 * DURATION],
            -10_000i32..10_000,
        ),
        1..120,
    )
    .prop_map(|steps| {
        let mut timestamp = 0;
        steps
            .into_iter()
            .map(|(delta, value)| {
                timestamp += delta;
                TimeValuePair::new(timestamp, f64::from(value))
            })
            .collect()
    })
}

fn read(
    series: &BucketedTimeSeries,
    begin: BucketNumber,
    end: BucketNumber,
    store: &BucketStorage,
) -> Vec<TimeValuePair> {
    series
        .get(begin, end, store)
        .iter()
        .flat_map(|block| decode_block(block).unwrap())
        .collect()
}

/// Store that fails every write to the listed buckets
struct FailingStore {
    inner: BucketStorage,
    failing: Mutex<Vec<BucketNumber>>,
}

impl BlockStore for FailingStore {
    fn bucket_capacity(&self) -> u8 {
        self.inner.bucket_capacity()
    }

    fn store(
        &self,
        bucket: BucketNumber,
        data: &[u8],
        count: u16,
        series_id: SeriesId,
    ) -> tidedb_core::Result<BlockId> {
        if self.failing.lock().contains(&bucket) {
            return Err(TideError::Internal(format!("bucket {} unavailable", bucket)));
        }
        self.inner.store(bucket, data, count, series_id)
    }

    fn fetch(
        &self,
        bucket: BucketNumber,
        id: BlockId,
    ) -> tidedb_core::Result<Option<TimeSeriesBlock>> {
        self.inner.fetch(bucket, id)
    }
}

proptest! {
    /// Reads return exactly the retained points of the requested buckets,
    /// oldest first.
    #[test]
    fn test_reads_match_model(
        points in points_strategy(),
        capacity in 1u8..6,
        begin in 0u32..60,
        span in 0u32..60,
    ) {
        let store = BucketStorage::in_memory(capacity).unwrap();
        let series = BucketedTimeSeries::new(capacity).with_min_timestamp_delta(0);

        for point in &points {
            series.put(bucket_of(point.timestamp), 7, *point, &store, None).unwrap();
        }

        let current = series.current_bucket().unwrap();
        prop_assert_eq!(current, bucket_of(points[points.len() - 1].timestamp));

        let end = begin + span;
        let oldest = current.saturating_sub(u32::from(capacity)).max(begin);
        let newest = current.min(end);
        let expected: Vec<TimeValuePair> = points
            .iter()
            .copied()
            .filter(|p| (oldest..=newest).contains(&bucket_of(p.timestamp)))
            .collect();

        prop_assert_eq!(read(&series, begin, end, &store), expected);
    }

    /// A read never yields more than the retained buckets plus the open one
    #[test]
    fn test_read_is_bounded_by_capacity(points in points_strategy(), capacity in 1u8..6) {
        let store = BucketStorage::in_memory(capacity).unwrap();
        let series = BucketedTimeSeries::new(capacity).with_min_timestamp_delta(0);
        for point in &points {
            series.put(bucket_of(point.timestamp), 1, *point, &store, None).unwrap();
        }

        let blocks = series.get(0, BucketNumber::MAX, &store);
        prop_assert!(blocks.len() <= usize::from(capacity) + 1);
        prop_assert!(blocks.iter().all(|block| !block.is_empty()));
    }

    /// Writes behind the open bucket fail without touching the series
    #[test]
    fn test_stale_bucket_rejected(open in 1u32..500, back in 1u32..500) {
        let store = BucketStorage::in_memory(4).unwrap();
        let series = BucketedTimeSeries::new(4).with_min_timestamp_delta(0);
        let start = i64::from(open) * DURATION;
        series.put(open, 1, TimeValuePair::new(start, 1.0), &store, None).unwrap();

        let stale = open.saturating_sub(back);
        let err = series
            .put(stale, 1, TimeValuePair::new(start + 1, 2.0), &store, None)
            .unwrap_err();

        prop_assert!(
            matches!(err, TideError::InvalidBucket { bucket, current } if bucket == stale && current == open),
            "unexpected error: {}",
            err
        );
        prop_assert_eq!(series.current_bucket(), Some(open));
        prop_assert_eq!(series.active_count(), 1);
    }

    /// Recency counts rotations since the last read and saturates
    #[test]
    fn test_recency_tracks_rotations(start in 0u32..1000, rotations in 0u32..700) {
        let store = BucketStorage::in_memory(6).unwrap();
        let series = BucketedTimeSeries::new(6);
        series
            .put(start, 1, TimeValuePair::new(i64::from(start) * DURATION, 1.0), &store, None)
            .unwrap();
        prop_assert_eq!(series.queried_buckets_ago(), NEVER_QUERIED);

        series.set_queried();
        series.set_current_bucket(start + rotations, 1, &store).unwrap();

        let expected = u8::try_from(rotations).unwrap_or(NEVER_QUERIED);
        prop_assert_eq!(series.queried_buckets_ago(), expected);
        prop_assert_eq!(series.current_bucket(), Some(start + rotations));
    }

    /// A rotation that fails to flush the open bucket can be retried
    /// without losing points
    #[test]
    fn test_rotation_retry_keeps_points(filled in 1u32..6, gap in 1u32..3) {
        let store = FailingStore {
            inner: BucketStorage::in_memory(8).unwrap(),
            failing: Mutex::new(Vec::new()),
        };
        let series = BucketedTimeSeries::new(8).with_min_timestamp_delta(0);

        let mut written = Vec::new();
        for bucket in 0..filled {
            let point = TimeValuePair::new(i64::from(bucket) * DURATION, f64::from(bucket));
            series.put(bucket, 3, point, &store, None).unwrap();
            written.push(point);
        }

        let open = filled - 1;
        let target = open + gap;
        store.failing.lock().push(open);
        let late = TimeValuePair::new(i64::from(target) * DURATION, -1.0);
        prop_assert!(series.put(target, 3, late, &store, None).is_err());
        prop_assert_eq!(series.current_bucket(), Some(open));
        prop_assert_eq!(series.active_count(), 1);

        store.failing.lock().clear();
        series.put(target, 3, late, &store, None).unwrap();
        written.push(late);

        let read: Vec<TimeValuePair> = series
            .get(0, target, &store)
            .iter()
            .flat_map(|block| decode_block(block).unwrap())
            .collect();
        prop_assert_eq!(read, written);
    }
}

#[test]
fn test_three_bucket_window() {
    let store = BucketStorage::in_memory(3).unwrap();
    let series = BucketedTimeSeries::new(3).with_min_timestamp_delta(0);

    series.put(5, 1, TimeValuePair::new(5 * DURATION, 500.0), &store, None).unwrap();
    series.put(7, 1, TimeValuePair::new(7 * DURATION, 700.0), &store, None).unwrap();

    assert_eq!(
        read(&series, 4, 7, &store),
        vec![
            TimeValuePair::new(5 * DURATION, 500.0),
            TimeValuePair::new(7 * DURATION, 700.0)
        ]
    );
    assert!(read(&series, 0, 3, &store).is_empty());
}

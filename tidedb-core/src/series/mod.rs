//! Per-series rolling bucket state
//!
//! [`BucketedTimeSeries`] is the unit every shard holds one of per key. It
//! owns the open bucket's point stream and a [`BlockRing`] of references to
//! the closed buckets it retains.

mod bucketed;
mod ring;

pub use bucketed::{BucketedTimeSeries, NEVER_QUERIED};
pub use ring::{BlockRing, HistoricalBlock};

//! Gorilla compression for time-series data
//!
//! Implements the compression algorithm from Facebook's paper:
//! "Gorilla: A Fast, Scalable, In-Memory Time Series Database"
//!
//! A [`PointStream`] is the open, appendable form used for the active bucket
//! of a series; its raw bytes become a stored block once the bucket rotates.

mod bitstream;
mod decoder;
mod stream;

pub use bitstream::{BitReader, BitWriter};
pub use decoder::GorillaDecoder;
pub use stream::PointStream;

use crate::{Result, TimeSeriesBlock, TimeValuePair};

/// Decode every point of a block
pub fn decode_block(block: &TimeSeriesBlock) -> Result<Vec<TimeValuePair>> {
    GorillaDecoder::new(&block.data, block.count as usize).decode_all()
}

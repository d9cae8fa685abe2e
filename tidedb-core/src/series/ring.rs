//! Fixed-capacity ring of historical block references

use crate::storage::BlockId;
use crate::BucketNumber;

/// Block reference held for one closed bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoricalBlock {
    /// Bucket the block was stored for
    pub bucket: BucketNumber,
    /// Id returned by the block store
    pub id: BlockId,
}

/// One slot per retained bucket, addressed by `bucket mod capacity`.
///
/// The capacity is fixed when the ring is built. A slot holds `None` when
/// the bucket it last represented had no data.
#[derive(Debug, Clone)]
pub struct BlockRing {
    slots: Box<[Option<HistoricalBlock>]>,
}

impl BlockRing {
    /// Create a ring of `capacity` empty slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: u8) -> Self {
        assert!(capacity > 0, "block ring capacity must be non-zero");
        Self {
            slots: vec![None; capacity as usize].into_boxed_slice(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> u8 {
        self.slots.len() as u8
    }

    /// Record the flush result for `bucket`, replacing whatever older
    /// bucket shared the slot
    pub fn set(&mut self, bucket: BucketNumber, id: Option<BlockId>) {
        let index = self.index(bucket);
        self.slots[index] = id.map(|id| HistoricalBlock { bucket, id });
    }

    /// Block id for `bucket`, if its slot still represents that bucket
    pub fn get(&self, bucket: BucketNumber) -> Option<BlockId> {
        self.slot(bucket)
            .filter(|block| block.bucket == bucket)
            .map(|block| block.id)
    }

    /// Raw content of the slot `bucket` maps to
    pub fn slot(&self, bucket: BucketNumber) -> Option<HistoricalBlock> {
        self.slots[self.index(bucket)]
    }

    /// Check if any slot references a block
    pub fn has_blocks(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// Empty every slot
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    fn index(&self, bucket: BucketNumber) -> usize {
        bucket as usize % self.slots.len()
    }
}

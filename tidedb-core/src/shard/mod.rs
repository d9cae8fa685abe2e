//! Shards: key to series mapping, ownership and recovery
//!
//! A [`BucketMap`] owns every series of one shard together with the shard's
//! block storage, data log and key list. Ownership is taken in steps (keys,
//! then logs, then queued points, then block files) so writes can be
//! accepted early and reads served before all history is back.

mod bucket_map;
mod key_list;

pub use bucket_map::{BucketMap, PutOutcome, ShardConfig, ShardStats};
pub use key_list::{KeyEntry, KeyList};

use crate::{Result, TideError};
use serde::Serialize;
use std::fmt;

/// Ownership state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    /// Shard is not served by this process
    Unowned,
    /// Ownership granted, recovery not started
    PreOwned,
    /// Key list being read
    ReadingKeys,
    /// Key list read
    ReadingKeysDone,
    /// Data log being replayed
    ReadingLogs,
    /// Points queued during recovery being applied
    ProcessingQueuedDataPoints,
    /// Block files being loaded; reads may be incomplete
    ReadingBlockData,
    /// Fully recovered
    Owned,
}

impl ShardState {
    /// Check if `next` may follow this state
    pub fn can_transition_to(self, next: ShardState) -> bool {
        use ShardState::*;
        matches!(
            (self, next),
            (_, Unowned)
                | (Unowned, PreOwned)
                | (PreOwned, ReadingKeys)
                | (ReadingKeys, ReadingKeysDone)
                | (ReadingKeysDone, ReadingLogs)
                | (ReadingLogs, ProcessingQueuedDataPoints)
                | (ProcessingQueuedDataPoints, ReadingBlockData)
                | (ReadingBlockData, Owned)
        )
    }

    /// Validate a transition to `next`
    pub fn transition(self, next: ShardState) -> Result<ShardState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TideError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Check if incoming points must be queued instead of applied
    pub fn queues_writes(self) -> bool {
        matches!(
            self,
            ShardState::PreOwned
                | ShardState::ReadingKeys
                | ShardState::ReadingKeysDone
                | ShardState::ReadingLogs
        )
    }

    /// Check if reads can be served, possibly incomplete
    pub fn serves_reads(self) -> bool {
        matches!(self, ShardState::ReadingBlockData | ShardState::Owned)
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardState::Unowned => "unowned",
            ShardState::PreOwned => "pre_owned",
            ShardState::ReadingKeys => "reading_keys",
            ShardState::ReadingKeysDone => "reading_keys_done",
            ShardState::ReadingLogs => "reading_logs",
            ShardState::ProcessingQueuedDataPoints => "processing_queued_data_points",
            ShardState::ReadingBlockData => "reading_block_data",
            ShardState::Owned => "owned",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECOVERY: [ShardState; 8] = [
        ShardState::Unowned,
        ShardState::PreOwned,
        ShardState::ReadingKeys,
        ShardState::ReadingKeysDone,
        ShardState::ReadingLogs,
        ShardState::ProcessingQueuedDataPoints,
        ShardState::ReadingBlockData,
        ShardState::Owned,
    ];

    #[test]
    fn test_recovery_sequence() {
        let mut state = ShardState::Unowned;
        for next in &RECOVERY[1..] {
            state = state.transition(*next).unwrap();
        }
        assert_eq!(state, ShardState::Owned);
    }

    #[test]
    fn test_any_state_can_drop_ownership() {
        for state in RECOVERY {
            assert!(state.can_transition_to(ShardState::Unowned));
        }
    }

    #[test]
    fn test_skipping_steps_rejected() {
        let err = ShardState::PreOwned
            .transition(ShardState::ReadingLogs)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid shard state transition from pre_owned to reading_logs"
        );
        assert!(ShardState::Owned.transition(ShardState::PreOwned).is_err());
        assert!(ShardState::Unowned.transition(ShardState::Owned).is_err());
    }

    #[test]
    fn test_state_predicates() {
        assert!(ShardState::ReadingLogs.queues_writes());
        assert!(!ShardState::ProcessingQueuedDataPoints.queues_writes());
        assert!(!ShardState::Unowned.queues_writes());
        assert!(ShardState::ReadingBlockData.serves_reads());
        assert!(!ShardState::ProcessingQueuedDataPoints.serves_reads());
    }
}

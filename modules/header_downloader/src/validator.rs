//! Consensus checks applied to a header before it is persisted.

use std::time::{SystemTime, UNIX_EPOCH};

use meridian_common::{BlockHash, BlockHeader, BlockNum};

/// Reasons a header fails validation against its parent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("block number {got} does not follow parent number {parent}")]
    WrongNumber { parent: BlockNum, got: BlockNum },

    #[error("wrong parent: expected {expected}, got {got}")]
    WrongParent { expected: BlockHash, got: BlockHash },

    #[error("timestamp {timestamp} not after parent timestamp {parent}")]
    TimestampNotAfterParent { timestamp: u64, parent: u64 },

    #[error("zero difficulty")]
    ZeroDifficulty,

    /// Not invalid, just early: the header may become acceptable later.
    #[error("timestamp {timestamp} too far ahead of local time {now}")]
    FutureBlock { timestamp: u64, now: u64 },
}

/// Consensus rules for a single header, given its parent.
pub trait HeaderValidator: Send + Sync {
    fn validate(&self, header: &BlockHeader, parent: &BlockHeader) -> Result<(), ValidationError>;
}

/// Structural checks that hold for any chain: linkage, monotonic time and a
/// bound on clock drift.
pub struct BasicHeaderValidator {
    max_future_drift: u64,
    clock: fn() -> u64,
}

impl BasicHeaderValidator {
    pub fn new(max_future_drift: u64) -> Self {
        Self {
            max_future_drift,
            clock: unix_now,
        }
    }

    /// Use `clock` instead of the system time.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }
}

impl HeaderValidator for BasicHeaderValidator {
    fn validate(&self, header: &BlockHeader, parent: &BlockHeader) -> Result<(), ValidationError> {
        if parent.number().checked_add(1) != Some(header.number()) {
            return Err(ValidationError::WrongNumber {
                parent: parent.number(),
                got: header.number(),
            });
        }
        if header.parent_hash() != parent.hash() {
            return Err(ValidationError::WrongParent {
                expected: parent.hash(),
                got: header.parent_hash(),
            });
        }
        if header.timestamp() <= parent.timestamp() {
            return Err(ValidationError::TimestampNotAfterParent {
                timestamp: header.timestamp(),
                parent: parent.timestamp(),
            });
        }
        if header.difficulty() == 0 {
            return Err(ValidationError::ZeroDifficulty);
        }

        let now = (self.clock)();
        if header.timestamp() > now.saturating_add(self.max_future_drift) {
            return Err(ValidationError::FutureBlock {
                timestamp: header.timestamp(),
                now,
            });
        }
        Ok(())
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

//! Index growth settings and results.

use std::time::Duration;

use crate::address::Address;
use crate::index::KeyHash;

/// Buckets migrated per chunk while doubling the table.
pub const HASH_TABLE_CHUNK_SIZE: u64 = 16384;

/// When and how the index grows.
#[derive(Debug, Clone)]
pub struct GrowConfig {
    /// Grow automatically once overflow buckets exceed `overflow_threshold` times the
    /// table size.
    pub auto_grow: bool,
    /// Ratio of overflow buckets to table size that triggers growth.
    pub overflow_threshold: f64,
    /// Upper bound on the table size reached by automatic growth.
    pub max_table_size: u64,
}

impl Default for GrowConfig {
    fn default() -> Self {
        Self {
            auto_grow: true,
            overflow_threshold: 0.25,
            max_table_size: 1 << 30,
        }
    }
}

impl GrowConfig {
    pub fn with_auto_grow(mut self, auto_grow: bool) -> Self {
        self.auto_grow = auto_grow;
        self
    }

    pub fn with_overflow_threshold(mut self, threshold: f64) -> Self {
        self.overflow_threshold = threshold.max(0.0);
        self
    }

    /// True when a table of `table_size` buckets with `overflow_buckets` should grow.
    pub fn should_grow(&self, table_size: u64, overflow_buckets: u64) -> bool {
        self.auto_grow
            && table_size < self.max_table_size
            && overflow_buckets as f64 > table_size as f64 * self.overflow_threshold
    }
}

/// One record as seen while splitting a chain during growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    /// Hash of the record's key.
    pub hash: KeyHash,
    /// Next older record of the chain.
    pub previous: Address,
}

/// Outcome of a completed growth.
#[derive(Debug, Clone, PartialEq)]
pub struct GrowResult {
    pub old_size: u64,
    pub new_size: u64,
    pub entries_migrated: u64,
    /// Entries whose whole chain lay below the begin address.
    pub entries_dropped: u64,
    pub duration: Duration,
}

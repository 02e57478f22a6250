//! Hash index mapping key hashes to the newest log address of each chain.

mod grow;
mod hash_bucket;
mod hash_table;
mod mem_index;
mod overflow;

pub use grow::{ChainLink, GrowConfig, GrowResult, HASH_TABLE_CHUNK_SIZE};
pub use hash_bucket::{AtomicHashBucketEntry, AtomicOverflowLink, HashBucket, HashBucketEntry};
pub use hash_table::InternalHashTable;
pub use mem_index::{FindResult, IndexStats, MemHashIndex};

/// 64-bit hash of an encoded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct KeyHash {
    hash: u64,
}

impl KeyHash {
    /// Wrap a hash produced by [`hash64`](crate::codec::hash64).
    #[inline]
    pub const fn new(hash: u64) -> Self {
        Self { hash }
    }

    /// The raw 64-bit hash.
    #[inline]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Bucket index in a table of `size` buckets (a power of two).
    #[inline]
    pub const fn hash_table_index(&self, size: u64) -> usize {
        (self.hash & (size - 1)) as usize
    }

    /// Tag stored in the bucket entry. Taken from the high bits so it stays stable when
    /// the table doubles.
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.hash >> 48) & ((1 << HashBucketEntry::TAG_BITS) - 1)) as u16
    }
}

impl From<u64> for KeyHash {
    #[inline]
    fn from(hash: u64) -> Self {
        Self::new(hash)
    }
}

/// Hash index settings.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Number of buckets; a power of two.
    pub table_size: u64,
    /// Growth policy.
    pub grow: GrowConfig,
}

impl IndexConfig {
    /// `table_size` buckets with the default growth policy.
    pub fn new(table_size: u64) -> Self {
        Self {
            table_size,
            grow: GrowConfig::default(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::new(1 << 16)
    }
}

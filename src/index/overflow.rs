//! Pool of overflow buckets for one hash table.
//!
//! Buckets are individually boxed so a pointer stays valid after the pool vector
//! reallocates. Bucket numbers are 1-based; zero means "no overflow bucket".

use parking_lot::{Mutex, RwLock};

use crate::index::HashBucket;

pub(crate) struct OverflowBucketPool {
    buckets: RwLock<Vec<Box<HashBucket>>>,
    free_list: Mutex<Vec<u64>>,
}

impl OverflowBucketPool {
    pub(crate) fn new() -> Self {
        Self {
            buckets: RwLock::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
        }
    }

    /// Number of buckets ever allocated (linked or on the free list).
    pub(crate) fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Hand out an empty bucket, reusing one returned by [`Self::release`] if possible.
    pub(crate) fn allocate(&self) -> (u64, *const HashBucket) {
        if let Some(number) = self.free_list.lock().pop() {
            if let Some(bucket) = self.get(number) {
                // SAFETY: pool buckets live as long as the pool; a freed bucket is unlinked.
                unsafe { (*bucket).reset() };
                return (number, bucket);
            }
        }
        let mut buckets = self.buckets.write();
        buckets.push(Box::default());
        let number = buckets.len() as u64;
        let ptr: *const HashBucket = &*buckets[buckets.len() - 1];
        (number, ptr)
    }

    /// Return a bucket that lost the race to be linked.
    pub(crate) fn release(&self, number: u64) {
        if self.get(number).is_some() {
            self.free_list.lock().push(number);
        }
    }

    /// Bucket by number.
    pub(crate) fn get(&self, number: u64) -> Option<*const HashBucket> {
        let index = usize::try_from(number).ok()?.checked_sub(1)?;
        let buckets = self.buckets.read();
        buckets.get(index).map(|b| &**b as *const HashBucket)
    }

    /// Append `count` empty buckets, numbered after the existing ones. Used when loading a
    /// checkpointed table.
    pub(crate) fn extend_empty(&self, count: u64) {
        let mut buckets = self.buckets.write();
        for _ in 0..count {
            buckets.push(Box::default());
        }
    }
}

//! A fixed-size array of cache-aligned hash buckets with its overflow pool.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::constants::CACHE_LINE_BYTES;
use crate::index::overflow::OverflowBucketPool;
use crate::index::{HashBucket, KeyHash};
use crate::status::Status;
use crate::utility::is_power_of_two;

pub struct InternalHashTable {
    buckets: NonNull<HashBucket>,
    size: u64,
    overflow: OverflowBucketPool,
}

// SAFETY: buckets are only touched through atomics.
unsafe impl Send for InternalHashTable {}
unsafe impl Sync for InternalHashTable {}

impl InternalHashTable {
    /// Allocate `size` zeroed buckets. `size` must be a power of two.
    pub fn new(size: u64) -> Result<Self, Status> {
        if size == 0 || !is_power_of_two(size) || size > i32::MAX as u64 {
            return Err(Status::InvalidArgument);
        }
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) } as *mut HashBucket;
        let buckets = NonNull::new(ptr).ok_or(Status::OutOfMemory)?;
        Ok(Self {
            buckets,
            size,
            overflow: OverflowBucketPool::new(),
        })
    }

    fn layout(size: u64) -> Result<Layout, Status> {
        Layout::from_size_align(size as usize * std::mem::size_of::<HashBucket>(), CACHE_LINE_BYTES)
            .map_err(|_| Status::InvalidArgument)
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Home bucket of `hash`.
    #[inline]
    pub fn bucket(&self, hash: KeyHash) -> &HashBucket {
        self.bucket_at(hash.hash_table_index(self.size) as u64)
    }

    #[inline]
    pub fn bucket_at(&self, index: u64) -> &HashBucket {
        debug_assert!(index < self.size);
        // SAFETY: index < size and the allocation lives as long as `self`.
        unsafe { &*self.buckets.as_ptr().add(index as usize) }
    }

    /// Overflow bucket linked from `bucket`, if any.
    #[inline]
    pub fn next_bucket(&self, bucket: &HashBucket) -> Option<&HashBucket> {
        let number = bucket.overflow.load(std::sync::atomic::Ordering::Acquire)?;
        // SAFETY: overflow buckets live as long as the pool, which lives as long as `self`.
        self.overflow.get(number).map(|ptr| unsafe { &*ptr })
    }

    /// Link a fresh overflow bucket after `bucket`, or return the one another thread
    /// linked first.
    pub fn append_overflow<'a>(&'a self, bucket: &'a HashBucket) -> &'a HashBucket {
        let (number, ptr) = self.overflow.allocate();
        match bucket.overflow.try_link(number) {
            // SAFETY: see `next_bucket`.
            Ok(()) => unsafe { &*ptr },
            Err(winner) => {
                self.overflow.release(number);
                match self.overflow.get(winner) {
                    Some(ptr) => unsafe { &*ptr },
                    None => bucket,
                }
            }
        }
    }

    /// Overflow buckets allocated so far.
    pub fn overflow_buckets(&self) -> u64 {
        self.overflow.len() as u64
    }

    /// Overflow bucket by 1-based number.
    pub(crate) fn overflow_bucket(&self, number: u64) -> Option<&HashBucket> {
        self.overflow.get(number).map(|ptr| unsafe { &*ptr })
    }

    pub(crate) fn extend_overflow(&self, count: u64) {
        self.overflow.extend_empty(count);
    }
}

impl Drop for InternalHashTable {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.size) {
            // SAFETY: allocated in `new` with the same layout.
            unsafe { dealloc(self.buckets.as_ptr() as *mut u8, layout) };
        }
    }
}

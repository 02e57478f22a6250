//! Hash bucket layout.
//!
//! A bucket is one cache line: seven entries and a link to an overflow bucket.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::constants::CACHE_LINE_BYTES;

/// Index entry: the head of one hash chain.
///
/// - address: bits 0..48
/// - tag: bits 48..62
/// - tentative: bit 63
///
/// The all-zero entry is an empty slot.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct HashBucketEntry(u64);

impl HashBucketEntry {
    /// Empty slot.
    pub const EMPTY: Self = Self(0);

    /// Number of tag bits.
    pub const TAG_BITS: u32 = 14;

    const ADDRESS_MASK: u64 = (1 << 48) - 1;
    const TAG_SHIFT: u32 = 48;
    const TAG_MASK: u64 = (1 << Self::TAG_BITS) - 1;
    const TENTATIVE_BIT: u64 = 1 << 63;

    #[inline]
    pub const fn new(address: Address, tag: u16, tentative: bool) -> Self {
        let mut control = address.control() & Self::ADDRESS_MASK;
        control |= ((tag as u64) & Self::TAG_MASK) << Self::TAG_SHIFT;
        if tentative {
            control |= Self::TENTATIVE_BIT;
        }
        Self(control)
    }

    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn address(&self) -> Address {
        Address::from_control(self.0 & Self::ADDRESS_MASK)
    }

    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.0 >> Self::TAG_SHIFT) & Self::TAG_MASK) as u16
    }

    #[inline]
    pub const fn is_tentative(&self) -> bool {
        self.0 & Self::TENTATIVE_BIT != 0
    }
}

impl fmt::Debug for HashBucketEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "HashBucketEntry(empty)");
        }
        f.debug_struct("HashBucketEntry")
            .field("address", &self.address())
            .field("tag", &self.tag())
            .field("tentative", &self.is_tentative())
            .finish()
    }
}

/// Atomic slot holding a [`HashBucketEntry`].
#[repr(transparent)]
#[derive(Default)]
pub struct AtomicHashBucketEntry {
    control: AtomicU64,
}

impl AtomicHashBucketEntry {
    #[inline]
    pub const fn empty() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> HashBucketEntry {
        HashBucketEntry(self.control.load(ordering))
    }

    #[inline]
    pub fn store(&self, entry: HashBucketEntry, ordering: Ordering) {
        self.control.store(entry.0, ordering);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: HashBucketEntry,
        new: HashBucketEntry,
    ) -> Result<HashBucketEntry, HashBucketEntry> {
        self.control
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(HashBucketEntry)
            .map_err(HashBucketEntry)
    }
}

impl fmt::Debug for AtomicHashBucketEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

/// Link to an overflow bucket: a 1-based slot in the overflow pool, zero when absent.
#[repr(transparent)]
#[derive(Default)]
pub struct AtomicOverflowLink {
    control: AtomicU64,
}

impl AtomicOverflowLink {
    #[inline]
    pub const fn empty() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }

    /// Linked overflow bucket number, if any.
    #[inline]
    pub fn load(&self, ordering: Ordering) -> Option<u64> {
        match self.control.load(ordering) {
            0 => None,
            n => Some(n),
        }
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.control.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_raw(&self, control: u64) {
        self.control.store(control, Ordering::Release);
    }

    /// Link `bucket` if no overflow bucket is linked yet. On failure returns the winner.
    #[inline]
    pub fn try_link(&self, bucket: u64) -> Result<(), u64> {
        self.control
            .compare_exchange(0, bucket, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }
}

/// Cache-line bucket of seven entries plus an overflow link.
#[repr(C, align(64))]
#[derive(Default)]
pub struct HashBucket {
    pub entries: [AtomicHashBucketEntry; Self::NUM_ENTRIES],
    pub overflow: AtomicOverflowLink,
}

impl HashBucket {
    /// Entries per bucket, not counting the overflow link.
    pub const NUM_ENTRIES: usize = 7;

    /// Zero every slot and the overflow link.
    pub fn reset(&self) {
        for entry in &self.entries {
            entry.store(HashBucketEntry::EMPTY, Ordering::Release);
        }
        self.overflow.store_raw(0);
    }

    /// The bucket as eight raw words, as written to `index.dat`.
    pub fn to_words(&self) -> [u64; 8] {
        let mut words = [0u64; 8];
        for (word, entry) in words.iter_mut().zip(&self.entries) {
            *word = entry.load(Ordering::Acquire).control();
        }
        words[7] = self.overflow.raw();
        words
    }

    /// Overwrite the bucket from raw words.
    pub fn load_words(&self, words: &[u64; 8]) {
        for (entry, word) in self.entries.iter().zip(words) {
            entry.store(HashBucketEntry::from_control(*word), Ordering::Release);
        }
        self.overflow.store_raw(words[7]);
    }
}

impl fmt::Debug for HashBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashBucket")
            .field("entries", &self.entries)
            .field("overflow", &self.overflow.load(Ordering::Relaxed))
            .finish()
    }
}

const _: () = assert!(mem::size_of::<HashBucket>() == CACHE_LINE_BYTES);

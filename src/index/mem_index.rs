//! In-memory hash index.
//!
//! Each bucket slot holds `(tag, address)` for one hash chain. New tags are inserted
//! with a tentative protocol so two threads cannot both create a slot for the same tag
//! in one bucket chain.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::address::Address;
use crate::index::{
    AtomicHashBucketEntry, GrowConfig, HashBucket, HashBucketEntry, IndexConfig,
    InternalHashTable, KeyHash,
};
use crate::status::Status;

mod checkpoint;
mod grow;

/// Result of an index lookup: the entry seen and the slot it was read from.
///
/// The slot pointer is only valid while the caller stays inside the epoch guard it
/// performed the lookup under.
#[derive(Debug, Clone, Copy)]
pub struct FindResult {
    pub entry: HashBucketEntry,
    slot: Option<NonNull<AtomicHashBucketEntry>>,
}

impl FindResult {
    fn not_found() -> Self {
        Self {
            entry: HashBucketEntry::EMPTY,
            slot: None,
        }
    }

    fn at(slot: &AtomicHashBucketEntry, entry: HashBucketEntry) -> Self {
        Self {
            entry,
            slot: Some(NonNull::from(slot)),
        }
    }

    /// True when a slot for the tag exists.
    #[inline]
    pub fn found(&self) -> bool {
        self.slot.is_some()
    }

    /// Head of the chain, or `Address::INVALID` when there is none.
    #[inline]
    pub fn address(&self) -> Address {
        if self.found() {
            self.entry.address()
        } else {
            Address::INVALID
        }
    }

    fn slot(&self) -> Option<&AtomicHashBucketEntry> {
        // SAFETY: slots live as long as their table, which is kept alive by the epoch
        // guard the lookup ran under.
        self.slot.map(|p| unsafe { p.as_ref() })
    }
}

/// Index occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IndexStats {
    pub table_size: u64,
    pub used_entries: u64,
    pub overflow_buckets: u64,
    /// Used entries over slots in the main table.
    pub load_factor: f64,
}

pub struct MemHashIndex {
    table: AtomicPtr<InternalHashTable>,
    growing: AtomicBool,
    grow_config: GrowConfig,
}

// SAFETY: the table is shared through atomics; replacement happens only while every
// operation is fenced out by `growing` plus an epoch barrier.
unsafe impl Send for MemHashIndex {}
unsafe impl Sync for MemHashIndex {}

impl MemHashIndex {
    pub fn new(config: &IndexConfig) -> Result<Self, Status> {
        let table = InternalHashTable::new(config.table_size)?;
        Ok(Self::from_table(table, config.grow.clone()))
    }

    fn from_table(table: InternalHashTable, grow_config: GrowConfig) -> Self {
        Self {
            table: AtomicPtr::new(Box::into_raw(Box::new(table))),
            growing: AtomicBool::new(false),
            grow_config,
        }
    }

    #[inline]
    fn table(&self) -> &InternalHashTable {
        // SAFETY: always points at a live table; see `grow`.
        unsafe { &*self.table.load(Ordering::Acquire) }
    }

    /// Number of buckets in the main table.
    pub fn size(&self) -> u64 {
        self.table().size()
    }

    /// True while a growth has fenced out operations. Operations must check this after
    /// entering their epoch and before touching the index.
    #[inline]
    pub fn is_growing(&self) -> bool {
        self.growing.load(Ordering::SeqCst)
    }

    pub fn grow_config(&self) -> &GrowConfig {
        &self.grow_config
    }

    /// True when overflow buckets have piled up enough to double the table.
    pub fn should_grow(&self) -> bool {
        let table = self.table();
        !self.is_growing()
            && self
                .grow_config
                .should_grow(table.size(), table.overflow_buckets())
    }

    /// Look up the slot for `hash`'s tag.
    pub fn find_entry(&self, hash: KeyHash) -> FindResult {
        let table = self.table();
        let tag = hash.tag();
        let mut bucket = table.bucket(hash);
        loop {
            for slot in &bucket.entries {
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_empty() && !entry.is_tentative() && entry.tag() == tag {
                    return FindResult::at(slot, entry);
                }
            }
            match table.next_bucket(bucket) {
                Some(next) => bucket = next,
                None => return FindResult::not_found(),
            }
        }
    }

    /// Look up the slot for `hash`'s tag, creating an empty one if none exists.
    pub fn find_or_create_entry(&self, hash: KeyHash) -> FindResult {
        let table = self.table();
        let tag = hash.tag();
        let home = table.bucket(hash);

        loop {
            let mut free: Option<&AtomicHashBucketEntry> = None;
            let mut bucket = home;
            loop {
                for slot in &bucket.entries {
                    let entry = slot.load(Ordering::Acquire);
                    if entry.is_empty() {
                        free.get_or_insert(slot);
                    } else if !entry.is_tentative() && entry.tag() == tag {
                        return FindResult::at(slot, entry);
                    }
                }
                match table.next_bucket(bucket) {
                    Some(next) => bucket = next,
                    None => break,
                }
            }

            let slot = match free {
                Some(slot) => slot,
                None => {
                    table.append_overflow(bucket);
                    continue;
                }
            };

            let tentative = HashBucketEntry::new(Address::INVALID, tag, true);
            if slot.compare_exchange(HashBucketEntry::EMPTY, tentative).is_err() {
                continue;
            }
            if Self::has_other_tag(table, home, tag, slot) {
                slot.store(HashBucketEntry::EMPTY, Ordering::Release);
                std::thread::yield_now();
                continue;
            }
            let entry = HashBucketEntry::new(Address::INVALID, tag, false);
            slot.store(entry, Ordering::Release);
            return FindResult::at(slot, entry);
        }
    }

    fn has_other_tag(
        table: &InternalHashTable,
        home: &HashBucket,
        tag: u16,
        ours: &AtomicHashBucketEntry,
    ) -> bool {
        let mut bucket = home;
        loop {
            for slot in &bucket.entries {
                if std::ptr::eq(slot, ours) {
                    continue;
                }
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_empty() && entry.tag() == tag {
                    return true;
                }
            }
            match table.next_bucket(bucket) {
                Some(next) => bucket = next,
                None => return false,
            }
        }
    }

    /// Swing the slot from the entry seen at lookup time to `new_address`.
    ///
    /// Returns `Aborted` when another thread changed the slot first.
    pub fn try_update_entry(&self, found: &FindResult, new_address: Address) -> Status {
        let Some(slot) = found.slot() else {
            return Status::InvalidArgument;
        };
        let new_entry = HashBucketEntry::new(new_address, found.entry.tag(), false);
        match slot.compare_exchange(found.entry, new_entry) {
            Ok(_) => Status::Ok,
            Err(_) => Status::Aborted,
        }
    }

    /// Unconditionally point the slot at `new_address`. Recovery only.
    pub fn update_entry(&self, found: &FindResult, new_address: Address) -> Status {
        let Some(slot) = found.slot() else {
            return Status::InvalidArgument;
        };
        slot.store(
            HashBucketEntry::new(new_address, found.entry.tag(), false),
            Ordering::Release,
        );
        Status::Ok
    }

    /// Empty every slot whose chain starts below `begin`. Returns the number cleared.
    pub fn garbage_collect(&self, begin: Address) -> u64 {
        let mut cleared = 0;
        self.for_each_slot(|slot| {
            let entry = slot.load(Ordering::Acquire);
            if !entry.is_empty()
                && !entry.is_tentative()
                && entry.address() < begin
                && slot.compare_exchange(entry, HashBucketEntry::EMPTY).is_ok()
            {
                cleared += 1;
            }
        });
        cleared
    }

    /// Drop tentative entries left behind by a crash.
    pub fn clear_tentative_entries(&self) {
        self.for_each_slot(|slot| {
            if slot.load(Ordering::Acquire).is_tentative() {
                slot.store(HashBucketEntry::EMPTY, Ordering::Release);
            }
        });
    }

    fn for_each_slot(&self, mut f: impl FnMut(&AtomicHashBucketEntry)) {
        let table = self.table();
        for index in 0..table.size() {
            let mut bucket = table.bucket_at(index);
            loop {
                bucket.entries.iter().for_each(&mut f);
                match table.next_bucket(bucket) {
                    Some(next) => bucket = next,
                    None => break,
                }
            }
        }
    }

    pub fn stats(&self) -> IndexStats {
        let table = self.table();
        let mut used_entries = 0u64;
        self.for_each_slot(|slot| {
            if !slot.load(Ordering::Relaxed).is_empty() {
                used_entries += 1;
            }
        });
        let slots = table.size() * HashBucket::NUM_ENTRIES as u64;
        IndexStats {
            table_size: table.size(),
            used_entries,
            overflow_buckets: table.overflow_buckets(),
            load_factor: used_entries as f64 / slots as f64,
        }
    }
}

impl Drop for MemHashIndex {
    fn drop(&mut self) {
        let ptr = *self.table.get_mut();
        // SAFETY: created by `Box::into_raw` and never freed elsewhere while installed.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

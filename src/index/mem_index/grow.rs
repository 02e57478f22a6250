use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::address::Address;
use crate::epoch::LightEpoch;
use crate::index::{
    ChainLink, GrowResult, HashBucket, HashBucketEntry, InternalHashTable, HASH_TABLE_CHUNK_SIZE,
};
use crate::status::Status;

use super::MemHashIndex;

impl MemHashIndex {
    /// Double the table.
    ///
    /// Operations are fenced out first: `growing` is raised and the epoch is bumped, then
    /// the caller waits until every thread protected in an older epoch has left. Each old
    /// chain is split into the two buckets it maps to in the new table by walking its
    /// records through `walk`, which returns the key hash and predecessor of the record at
    /// an address. Chains that lie entirely below `begin` are dropped.
    ///
    /// The caller must not hold epoch protection.
    pub fn grow<F>(&self, epoch: &LightEpoch, begin: Address, mut walk: F) -> Result<GrowResult, Status>
    where
        F: FnMut(Address) -> Result<ChainLink, Status>,
    {
        if self
            .growing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Status::Aborted);
        }

        let started = Instant::now();
        let barrier = epoch.bump_current_epoch();
        epoch.spin_wait_for_safe(barrier - 1);

        let old = self.table();
        let result = Self::migrate(old, begin, &mut walk);
        let outcome = match result {
            Ok((table, migrated, dropped)) => {
                let grown = GrowResult {
                    old_size: old.size(),
                    new_size: table.size(),
                    entries_migrated: migrated,
                    entries_dropped: dropped,
                    duration: started.elapsed(),
                };
                let previous = self
                    .table
                    .swap(Box::into_raw(Box::new(table)), Ordering::AcqRel);
                // SAFETY: no operation can reach the old table: those that started before
                // the barrier have finished and later ones wait on `growing`.
                drop(unsafe { Box::from_raw(previous) });
                tracing::info!(
                    old_size = grown.old_size,
                    new_size = grown.new_size,
                    migrated = grown.entries_migrated,
                    dropped = grown.entries_dropped,
                    "hash index grown"
                );
                Ok(grown)
            }
            Err(status) => {
                tracing::warn!(%status, "hash index growth abandoned");
                Err(status)
            }
        };

        self.growing.store(false, Ordering::SeqCst);
        outcome
    }

    fn migrate<F>(
        old: &InternalHashTable,
        begin: Address,
        walk: &mut F,
    ) -> Result<(InternalHashTable, u64, u64), Status>
    where
        F: FnMut(Address) -> Result<ChainLink, Status>,
    {
        let old_size = old.size();
        let new_table = InternalHashTable::new(old_size * 2)?;
        let mut migrated = 0u64;
        let mut dropped = 0u64;

        let mut chunk_start = 0;
        while chunk_start < old_size {
            let chunk_end = (chunk_start + HASH_TABLE_CHUNK_SIZE).min(old_size);
            for index in chunk_start..chunk_end {
                let mut bucket = old.bucket_at(index);
                loop {
                    for slot in &bucket.entries {
                        let entry = slot.load(Ordering::Acquire);
                        if entry.is_empty() || entry.is_tentative() {
                            continue;
                        }
                        let heads = Self::split_chain(entry.address(), index, old_size, begin, walk)?;
                        if heads.iter().all(Option::is_none) {
                            dropped += 1;
                            continue;
                        }
                        for (half, head) in heads.into_iter().enumerate() {
                            if let Some(address) = head {
                                let target = index + half as u64 * old_size;
                                Self::place(&new_table, target, HashBucketEntry::new(address, entry.tag(), false));
                                migrated += 1;
                            }
                        }
                    }
                    match old.next_bucket(bucket) {
                        Some(next) => bucket = next,
                        None => break,
                    }
                }
            }
            tracing::debug!(chunk_start, chunk_end, "index chunk migrated");
            chunk_start = chunk_end;
        }

        Ok((new_table, migrated, dropped))
    }

    /// Newest record of the chain landing in each half of the doubled table.
    fn split_chain<F>(
        head: Address,
        index: u64,
        old_size: u64,
        begin: Address,
        walk: &mut F,
    ) -> Result<[Option<Address>; 2], Status>
    where
        F: FnMut(Address) -> Result<ChainLink, Status>,
    {
        let mut heads = [None, None];
        let mut address = head;
        while address.is_valid() && address >= begin && heads.iter().any(Option::is_none) {
            let link = walk(address)?;
            let half = usize::from(link.hash.hash_table_index(old_size * 2) as u64 != index);
            heads[half].get_or_insert(address);
            if link.previous >= address {
                return Err(Status::Corruption);
            }
            address = link.previous;
        }
        Ok(heads)
    }

    /// Single-threaded insert into a table nobody else can see yet.
    fn place(table: &InternalHashTable, index: u64, entry: HashBucketEntry) {
        let mut bucket: &HashBucket = table.bucket_at(index);
        loop {
            for slot in &bucket.entries {
                if slot.load(Ordering::Relaxed).is_empty() {
                    slot.store(entry, Ordering::Release);
                    return;
                }
            }
            bucket = match table.next_bucket(bucket) {
                Some(next) => next,
                None => table.append_overflow(bucket),
            };
        }
    }
}

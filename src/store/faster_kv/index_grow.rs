use crate::device::StorageDevice;
use crate::codec::{PersistKey, PersistValue};
use crate::index::GrowResult;
use crate::status::Status;

use super::{FasterKv, InternalSlot};

impl<K, V, D> FasterKv<K, V, D>
where
    K: PersistKey,
    V: PersistValue,
    D: StorageDevice,
{
    // ============ Index Growth API ============

    /// Get the current hash table size (number of buckets)
    pub fn index_size(&self) -> u64 {
        let _maintenance = self.maintenance.lock();
        self.index.size()
    }

    /// Check if index growth is in progress
    pub fn is_grow_in_progress(&self) -> bool {
        self.index.is_growing()
    }

    /// Double the table. The maintenance lock must be held and the caller unprotected.
    pub(super) fn grow_index_locked(&self) -> Result<GrowResult, Status> {
        let slot = InternalSlot::acquire(&self.epoch)?;
        let begin = self.hlog.get_begin_address();
        let result = self
            .index
            .grow(&self.epoch, begin, |address| self.chain_link(slot.id(), address));
        match &result {
            Ok(grown) => tracing::info!(
                old_size = grown.old_size,
                new_size = grown.new_size,
                migrated = grown.entries_migrated,
                dropped = grown.entries_dropped,
                elapsed_ms = grown.duration.as_millis() as u64,
                "hash index grown"
            ),
            Err(status) => tracing::warn!(status = %status, "hash index growth failed"),
        }
        result
    }

    /// Grow after an operation noticed overflow pressure, unless other maintenance is
    /// already running.
    pub(super) fn try_auto_grow(&self) {
        let Some(_maintenance) = self.maintenance.try_lock() else {
            return;
        };
        if self.index.should_grow() {
            let _ = self.grow_index_locked();
        }
    }
}

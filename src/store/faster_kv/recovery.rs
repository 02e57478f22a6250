use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::address::Address;
use crate::checkpoint::{
    index_data_path, log_snapshot_path, CheckpointError, CheckpointInfo, CheckpointToken,
    CheckpointType,
};
use crate::codec::{hash64, PersistKey, PersistValue};
use crate::device::StorageDevice;
use crate::index::{KeyHash, MemHashIndex};
use crate::record::record_version;
use crate::status::Status;

use super::{FasterKv, FasterKvConfig};

impl<K, V, D> FasterKv<K, V, D>
where
    K: PersistKey,
    V: PersistValue,
    D: StorageDevice,
{
    /// Rebuild a store from checkpoint `token` under `config.checkpoint_dir`.
    ///
    /// `device` must hold the log the checkpoint was taken from, and `object_device` the
    /// object log when values are variable-size. The recovered store contains exactly the
    /// operations of the checkpointed version; records of later versions are invalidated.
    /// Sessions recorded in the checkpoint can be resumed with
    /// [`continue_session`](Self::continue_session).
    pub fn recover(
        config: FasterKvConfig,
        device: D,
        object_device: Option<Arc<dyn StorageDevice>>,
        token: CheckpointToken,
    ) -> Result<Self, CheckpointError> {
        let started = Instant::now();
        config.validate()?;
        let info = CheckpointInfo::load(&config.checkpoint_dir, token)?;

        if Self::VALUE_IS_FIXED == info.log.object_log_tail.is_some() {
            return Err(CheckpointError::Incompatible(
                "checkpoint and value type disagree on the object log".to_string(),
            ));
        }

        let image = File::open(index_data_path(&info.directory))?;
        let index = MemHashIndex::recover(BufReader::new(image), config.grow.clone())?;
        let mut store = Self::build(config, device, object_device, index)?;

        if let (Some(object_log), Some(tail)) = (&store.object_log, info.log.object_log_tail) {
            object_log.recover_to(tail);
        }
        let snapshot = match info.log.checkpoint_type {
            CheckpointType::Snapshot => Some(log_snapshot_path(&info.directory)),
            CheckpointType::FoldOver => None,
        };
        store.hlog.restore(&info.log, snapshot.as_deref())?;
        store.index.clear_tentative_entries();

        let version = info.version();
        let replay_from = info
            .index
            .checkpoint_start_address
            .max(store.hlog.get_begin_address());
        let discarded = store.replay(replay_from, info.log.final_address, version)?;
        store.index.garbage_collect(store.hlog.get_begin_address());

        store.version.store(version + 1, Ordering::SeqCst);
        store.recovered_sessions = info
            .log
            .session_states
            .iter()
            .map(|state| (state.guid, state.serial_num))
            .collect::<HashMap<_, _>>();
        *store.last_checkpoint.lock() = Some(token);

        if discarded > 0 {
            tracing::warn!(discarded, "records past the checkpoint version were invalidated");
        }
        tracing::info!(
            token = %token,
            kind = %info.log.checkpoint_type,
            version,
            final_address = %info.log.final_address,
            sessions = store.recovered_sessions.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recovered from checkpoint"
        );
        Ok(store)
    }

    /// Point the index at the newest record of each chain appended in `[start, until)`
    /// during `version`, and invalidate records of the next version. Returns the number
    /// of invalidated records.
    fn replay(&self, start: Address, until: Address, version: u32) -> Result<u64, Status> {
        let next = record_version(version + 1);
        let mut discard = Vec::new();
        let mut linked = 0u64;

        self.hlog.scan_records(start, until, |address, view| {
            if view.info.is_invalid() {
                return Ok(());
            }
            if view.info.version() == next {
                discard.push(address);
                return Ok(());
            }
            let found = self.index.find_or_create_entry(KeyHash::new(hash64(view.key)));
            if !found.found() || found.address() < address {
                match self.index.update_entry(&found, address) {
                    Status::Ok => linked += 1,
                    status => return Err(status),
                }
            }
            Ok(())
        })?;

        for &address in &discard {
            self.hlog.mark_invalid(address)?;
        }
        tracing::debug!(start = %start, until = %until, linked, "log replayed");
        Ok(discard.len() as u64)
    }
}

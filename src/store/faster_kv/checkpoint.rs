use std::sync::atomic::Ordering;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::{
    create_checkpoint_directory, index_data_path, index_metadata_path, log_metadata_path,
    log_snapshot_path, sidecar, write_atomic, write_json, CheckpointError, CheckpointToken,
    CheckpointType, IndexMetadata, LogMetadata, SessionState,
};
use crate::codec::{PersistKey, PersistValue};
use crate::device::StorageDevice;
use crate::epoch::EpochGuard;

use super::{FasterKv, InternalSlot};

impl<K, V, D> FasterKv<K, V, D>
where
    K: PersistKey,
    V: PersistValue,
    D: StorageDevice,
{
    /// Take a full checkpoint of the configured type.
    pub fn checkpoint(&self) -> Result<CheckpointToken, CheckpointError> {
        self.take_full_checkpoint(self.config.checkpoint_type)
    }

    /// Take a full checkpoint (index and log) under `config.checkpoint_dir/<token>/`.
    ///
    /// Operations keep running. The checkpoint captures every operation that completed
    /// in the current version; operations that start afterwards belong to the next one.
    /// Returns once every artifact is durable.
    pub fn take_full_checkpoint(&self, kind: CheckpointType) -> Result<CheckpointToken, CheckpointError> {
        let _maintenance = self.maintenance.lock();
        let started = Instant::now();
        let token = Uuid::new_v4();
        let directory = create_checkpoint_directory(&self.config.checkpoint_dir, token)?;

        // Index image: fuzzy, repaired on recovery by replaying from `checkpoint_start`.
        let checkpoint_start = self.hlog.get_tail_address();
        self.epoch_barrier();
        let begin = self.hlog.get_begin_address();
        self.index.garbage_collect(begin);
        let index_path = index_data_path(&directory);
        let mut image = None;
        write_atomic(&index_path, |writer| {
            image = Some(self.index.checkpoint(&mut *writer)?);
            Ok(())
        })?;
        sidecar::write_file_checksum(&index_path)?;
        let image = image.ok_or(CheckpointError::InvalidState("index image not written"))?;

        let used_entries = self.index.stats().used_entries;
        let version = self.version.fetch_add(1, Ordering::SeqCst);
        let index_meta = IndexMetadata {
            version,
            table_size: image.table_size,
            overflow_buckets: image.overflow_buckets,
            num_entries: used_entries,
            num_bytes: image.bytes_written,
            log_begin_address: begin,
            checkpoint_start_address: checkpoint_start,
            ..IndexMetadata::with_token(token)
        };
        write_json(&index_metadata_path(&directory), &index_meta)?;

        // Version cut: once every thread has seen the new version, no record of the old
        // one is appended past `final_address`.
        self.epoch_barrier();
        let final_address = self.hlog.get_tail_address();

        let head_address = match kind {
            CheckpointType::Snapshot => self.write_snapshot(&directory, final_address)?,
            CheckpointType::FoldOver => self.fold_over(final_address)?,
        };

        let object_log_tail = match &self.object_log {
            Some(object_log) => {
                let tail = object_log.get_tail_address();
                self.epoch_barrier();
                object_log.flush_until(tail)?;
                Some(tail)
            }
            None => None,
        };

        let log_meta = LogMetadata {
            version,
            page_size_bits: self.hlog.page_bits(),
            begin_address: begin,
            head_address,
            final_address,
            flushed_until_address: self.hlog.get_flushed_until_address(),
            object_log_tail,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            session_states: self.checkpoint_sessions(version),
            ..LogMetadata::with_token(token, kind)
        };
        write_json(&log_metadata_path(&directory), &log_meta)?;
        *self.last_checkpoint.lock() = Some(token);

        tracing::info!(
            token = %token,
            kind = %kind,
            version,
            start = %checkpoint_start,
            final_address = %final_address,
            sessions = log_meta.session_states.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint complete"
        );
        Ok(token)
    }

    /// Wait for the checkpoint in progress, if any.
    ///
    /// Checkpoints are durable when `take_full_checkpoint` returns, so this only waits for
    /// one running on another thread. Returns `Ok(false)` when one is still running and
    /// `wait` is false.
    pub fn complete_checkpoint(&self, wait: bool) -> Result<bool, CheckpointError> {
        let _maintenance = if wait {
            self.maintenance.lock()
        } else {
            match self.maintenance.try_lock() {
                Some(guard) => guard,
                None => return Ok(false),
            }
        };
        Ok(true)
    }

    /// Token of the last checkpoint taken or recovered from.
    pub fn last_checkpoint(&self) -> Option<CheckpointToken> {
        *self.last_checkpoint.lock()
    }

    /// Wait until every thread protected now has left its epoch.
    fn epoch_barrier(&self) {
        let epoch = self.epoch.bump_current_epoch();
        self.epoch.spin_wait_for_safe(epoch - 1);
    }

    /// Copy the resident part of the log up to the cut. Returns the head it starts at.
    fn write_snapshot(&self, directory: &std::path::Path, final_address: Address) -> Result<Address, CheckpointError> {
        let slot = InternalSlot::acquire(&self.epoch)?;
        let guard = EpochGuard::new(&self.epoch, slot.id());
        let head = self.hlog.get_head_address();
        let pages = self
            .hlog
            .write_log_snapshot(&log_snapshot_path(directory), head, final_address, &guard)?;
        tracing::debug!(head = %head, final_address = %final_address, pages, "log snapshot written");
        Ok(head)
    }

    /// Make the log durable up to the cut. Returns the head afterwards.
    fn fold_over(&self, final_address: Address) -> Result<Address, CheckpointError> {
        self.hlog.shift_read_only_address(final_address);
        self.hlog
            .wait_until(|| self.hlog.get_safe_read_only_address() >= final_address);
        self.hlog.flush_until(final_address)?;
        if self.hlog.get_flushed_until_address() < final_address {
            return Err(CheckpointError::InvalidState("log not flushed to the checkpoint cut"));
        }
        Ok(self.hlog.get_head_address())
    }

    /// Serial numbers to record for `version`: live sessions, plus recovered sessions
    /// that have not been continued.
    fn checkpoint_sessions(&self, version: u32) -> Vec<SessionState> {
        let sessions = self.sessions.read();
        let mut states: Vec<SessionState> = sessions
            .iter()
            .map(|(guid, progress)| SessionState::new(*guid, progress.lock().serial_at(version)))
            .collect();
        states.extend(
            self.recovered_sessions
                .iter()
                .filter(|(guid, _)| !sessions.contains_key(guid))
                .map(|(guid, serial)| SessionState::new(*guid, *serial)),
        );
        states.sort_by_key(|state| state.guid);
        states
    }
}

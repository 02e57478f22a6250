//! Session management
//!
//! Each thread talks to a store through its own [`Session`]. A session owns one epoch
//! slot, a GUID and a serial number that counts its completed mutating operations, and
//! the reads it left pending.
//!
//! ## Session Persistence
//!
//! Checkpoints record, for every session, the serial number of its last operation that
//! belongs to the checkpoint. After recovery the session is resumed with
//! [`FasterKv::continue_session`] and continues from that serial number.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::SessionState;
use crate::codec::{encode_key, hash64, PersistKey, PersistValue};
use crate::device::StorageDevice;
use crate::index::KeyHash;
use crate::record::RecordView;
use crate::status::{OperationType, Status};
use crate::store::contexts::{CompletedRead, RmwContext};
use crate::store::faster_kv::{ReadResult, SessionProgress};
use crate::store::pending_io::IoCompletion;
use crate::store::FasterKv;

/// Upper bound on how long `complete_pending(true)` waits for the I/O worker.
const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved reads kept for re-issued reads of the same key.
const RESOLVED_CACHE_LIMIT: usize = 1 << 14;

#[derive(Debug)]
struct PendingRead<K> {
    key: K,
    key_bytes: Vec<u8>,
    /// First on-disk address of the chain when the read was issued
    origin: Address,
}

/// Outcome of a device read, remembered for re-issued reads of the same key.
#[derive(Debug)]
struct ResolvedRead<V> {
    /// Address of the record that produced `result`; invalid when the chain ran out
    found: Address,
    result: Result<Option<V>, Status>,
}

/// Session for store operations
///
/// Sessions are not thread-safe and should not be shared between threads. Dropping a
/// session abandons its pending reads.
pub struct Session<K, V, D>
where
    K: PersistKey,
    V: PersistValue,
    D: StorageDevice,
{
    /// Reference to the store
    store: Arc<FasterKv<K, V, D>>,
    /// Epoch slot
    thread_id: usize,
    /// Unique session identifier (GUID)
    guid: Uuid,
    /// Serial of the last completed mutating operation
    serial_num: u64,
    /// Shared with the store for checkpoints
    progress: Arc<Mutex<SessionProgress>>,
    io_tx: Sender<IoCompletion>,
    io_rx: Receiver<IoCompletion>,
    next_io_id: u64,
    pending: HashMap<u64, PendingRead<K>>,
    completed: Vec<CompletedRead<K, V>>,
    /// Results of completed reads by (origin address, encoded key)
    resolved: HashMap<(u64, Vec<u8>), ResolvedRead<V>>,
}

impl<K, V, D> Session<K, V, D>
where
    K: PersistKey,
    V: PersistValue,
    D: StorageDevice,
{
    pub(crate) fn new(
        store: Arc<FasterKv<K, V, D>>,
        thread_id: usize,
        guid: Uuid,
        serial_num: u64,
        progress: Arc<Mutex<SessionProgress>>,
    ) -> Self {
        let (io_tx, io_rx) = unbounded();
        Self {
            store,
            thread_id,
            guid,
            serial_num,
            progress,
            io_tx,
            io_rx,
            next_io_id: 0,
            pending: HashMap::new(),
            completed: Vec::new(),
            resolved: HashMap::new(),
        }
    }

    /// Get the session GUID
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Epoch slot held by this session
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Serial number of the last completed mutating operation
    pub fn serial_num(&self) -> u64 {
        self.serial_num
    }

    /// Get the session state for checkpointing
    pub fn to_session_state(&self) -> SessionState {
        SessionState::new(self.guid, self.serial_num)
    }

    /// Number of reads still waiting for the device.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn store(&self) -> &Arc<FasterKv<K, V, D>> {
        &self.store
    }

    fn encode(key: &K) -> Result<(Vec<u8>, KeyHash), Status> {
        let bytes = encode_key::<K, K::Codec>(key)?;
        let hash = KeyHash::new(hash64(&bytes));
        Ok((bytes, hash))
    }

    fn finish(&mut self, op: OperationType, status: Status, serial: u64) -> Status {
        self.store.stats_collector().record(op, status);
        if status.is_ok() || status.is_not_found() || status == Status::Aborted {
            self.serial_num = serial;
        }
        status
    }

    /// Read a value from the store
    ///
    /// Returns `Err(Status::Pending)` when the chain continues on the device. The read is
    /// then resolved by [`complete_pending`](Self::complete_pending); its result is
    /// available from [`take_completed_reads`](Self::take_completed_reads) and from a
    /// repeated `read` of the same key.
    ///
    /// Reads do not consume a serial number.
    pub fn read(&mut self, key: &K) -> Result<Option<V>, Status> {
        let result = self.read_inner(key);
        let status = match &result {
            Ok(Some(_)) => Status::Ok,
            Ok(None) => Status::NotFound,
            Err(status) => *status,
        };
        self.store.stats_collector().record(OperationType::Read, status);
        result
    }

    fn read_inner(&mut self, key: &K) -> Result<Option<V>, Status> {
        let (key_bytes, hash) = Self::encode(key)?;
        match self.store.read_internal(self.thread_id, &key_bytes, hash)? {
            ReadResult::Done(value) => Ok(value),
            ReadResult::OnDisk(origin) => {
                let cache_key = (origin.control(), key_bytes);
                if let Some(entry) = self.resolved.get(&cache_key) {
                    if entry.found.is_invalid() || entry.found >= self.store.begin_address() {
                        return entry.result.clone();
                    }
                    // The record it came from has been truncated away.
                    self.resolved.remove(&cache_key);
                }
                let (_, key_bytes) = cache_key;
                let read = PendingRead { key: key.clone(), key_bytes, origin };
                if self.submit(read, origin).is_err() {
                    tracing::warn!(address = %origin, "pending io worker is gone");
                    return Err(Status::IoError);
                }
                Err(Status::Pending)
            }
        }
    }

    /// Queue a device read of `address` for `read`, handing it back if the worker is gone.
    fn submit(&mut self, read: PendingRead<K>, address: Address) -> Result<(), PendingRead<K>> {
        let id = self.next_io_id;
        self.next_io_id += 1;
        if !self
            .store
            .pending_io()
            .submit_read(id, address, self.io_tx.clone())
        {
            return Err(read);
        }
        self.pending.insert(id, read);
        Ok(())
    }

    /// Upsert a key-value pair
    pub fn upsert(&mut self, key: &K, value: &V) -> Status {
        let serial = self.serial_num + 1;
        let status = match Self::encode(key) {
            Ok((key_bytes, hash)) => self.store.upsert_internal(
                self.thread_id,
                &key_bytes,
                hash,
                value,
                (&self.progress, serial),
            ),
            Err(status) => status,
        };
        self.finish(OperationType::Upsert, status, serial)
    }

    /// Perform a read-modify-write operation
    ///
    /// If the newest record is on the device its value is fetched synchronously, so RMW
    /// never returns `Pending`.
    pub fn rmw<C>(&mut self, key: &K, ctx: &mut C) -> Status
    where
        C: RmwContext<V>,
    {
        let serial = self.serial_num + 1;
        let status = match Self::encode(key) {
            Ok((key_bytes, hash)) => self.store.rmw_internal(
                self.thread_id,
                &key_bytes,
                hash,
                ctx,
                (&self.progress, serial),
            ),
            Err(status) => status,
        };
        self.finish(OperationType::Rmw, status, serial)
    }

    /// Delete a key
    ///
    /// Returns `NotFound` if the key is absent or already deleted.
    pub fn delete(&mut self, key: &K) -> Status {
        let serial = self.serial_num + 1;
        let status = match Self::encode(key) {
            Ok((key_bytes, hash)) => {
                self.store
                    .delete_internal(self.thread_id, &key_bytes, hash, (&self.progress, serial))
            }
            Err(status) => status,
        };
        self.finish(OperationType::Delete, status, serial)
    }

    /// Conditionally insert a key-value pair
    ///
    /// Inserts only if the key is absent; a deleted key counts as absent. Returns
    /// `Status::Aborted` if the key already exists.
    pub fn conditional_insert(&mut self, key: &K, value: &V) -> Status {
        let serial = self.serial_num + 1;
        let status = match Self::encode(key) {
            Ok((key_bytes, hash)) => self.store.conditional_insert_internal(
                self.thread_id,
                &key_bytes,
                hash,
                value,
                (&self.progress, serial),
            ),
            Err(status) => status,
        };
        self.finish(OperationType::ConditionalInsert, status, serial)
    }

    /// Complete pending reads
    ///
    /// With `wait`, blocks until every pending read is resolved (or a 30 second timeout
    /// passes). Returns `true` when no read is left pending.
    pub fn complete_pending(&mut self, wait: bool) -> bool {
        self.complete_pending_with_timeout(wait, PENDING_TIMEOUT)
    }

    /// Complete pending reads, waiting at most `timeout` when `wait` is set.
    pub fn complete_pending_with_timeout(&mut self, wait: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            while let Ok(completion) = self.io_rx.try_recv() {
                self.on_completion(completion);
            }
            if self.pending.is_empty() {
                return true;
            }
            if !wait {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(pending = self.pending.len(), "timed out waiting for pending reads");
                return false;
            }
            match self.io_rx.recv_timeout(remaining.min(Duration::from_millis(10))) {
                Ok(completion) => self.on_completion(completion),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return self.pending.is_empty(),
            }
        }
    }

    /// Drain the reads resolved so far.
    pub fn take_completed_reads(&mut self) -> Vec<CompletedRead<K, V>> {
        std::mem::take(&mut self.completed)
    }

    fn on_completion(&mut self, completion: IoCompletion) {
        let Some(read) = self.pending.remove(&completion.id) else {
            return;
        };
        let found = completion.address;
        if found < self.store.begin_address() {
            return self.resolve(read, Address::INVALID, Ok(None));
        }
        let bytes = match completion.result {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!(address = %completion.address, "no record on device");
                return self.resolve(read, found, Err(Status::Corruption));
            }
            Err(e) => {
                tracing::warn!(address = %completion.address, error = %e, "pending read failed");
                return self.resolve(read, found, Err(Status::IoError));
            }
        };

        let view = match RecordView::parse(&bytes) {
            Ok(Some(view)) => view,
            Ok(None) => return self.resolve(read, found, Err(Status::Corruption)),
            Err(status) => return self.resolve(read, found, Err(status)),
        };
        if view.info.is_invalid() || view.key != read.key_bytes.as_slice() {
            // Another key on the same chain; keep walking.
            let previous = view.info.previous_address();
            if !previous.is_valid() || previous < self.store.begin_address() {
                return self.resolve(read, Address::INVALID, Ok(None));
            }
            if let Err(read) = self.submit(read, previous) {
                tracing::warn!(address = %previous, "could not follow chain");
                self.resolve(read, found, Err(Status::IoError));
            }
            return;
        }

        let result = if view.info.is_tombstone() {
            Ok(None)
        } else {
            self.store.decode_inline(view.value).map(Some)
        };
        self.resolve(read, found, result);
    }

    fn resolve(&mut self, read: PendingRead<K>, found: Address, result: Result<Option<V>, Status>) {
        let status = match &result {
            Ok(Some(_)) => Status::Ok,
            Ok(None) => Status::NotFound,
            Err(status) => *status,
        };
        self.store.stats_collector().record_completed_read(status);
        if status != Status::IoError {
            if self.resolved.len() >= RESOLVED_CACHE_LIMIT {
                self.resolved.clear();
            }
            self.resolved.insert(
                (read.origin.control(), read.key_bytes),
                ResolvedRead { found, result: result.clone() },
            );
        }
        self.completed.push(CompletedRead { key: read.key, result });
    }
}

impl<K, V, D> Drop for Session<K, V, D>
where
    K: PersistKey,
    V: PersistValue,
    D: StorageDevice,
{
    fn drop(&mut self) {
        self.store.end_session(self.guid, self.thread_id);
    }
}

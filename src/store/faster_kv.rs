//! FasterKV - Core key-value store implementation
//!
//! Every operation runs inside an epoch guard: it looks up the chain head in the hash
//! index, walks the version chain through the hybrid log, and either updates a mutable
//! record in place or appends a new record and swings the index entry with a CAS.
//! Chains that continue below the head address are followed on the device, either
//! synchronously (RMW, delete, conditional insert) or through the pending-read queue of
//! the calling session (read).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::address::Address;
use crate::allocator::{HybridLog, HybridLogConfig, LogStats};
use crate::checkpoint::{CheckpointToken, CheckpointType, SessionState};
use crate::codec::{encode_value, hash64, PersistKey, PersistValue, ValueCodec};
use crate::device::StorageDevice;
use crate::epoch::{EpochGuard, LightEpoch};
use crate::index::{ChainLink, FindResult, GrowConfig, GrowResult, IndexConfig, IndexStats, KeyHash, MemHashIndex};
use crate::object_log::{ObjectLog, ObjectLogConfig, ObjectLogStats};
use crate::record::{record_size, record_version, ObjectRef, Record, RecordInfo, RecordView};
use crate::stats::{StoreStats, StoreStatsSnapshot};
use crate::status::Status;
use crate::store::contexts::RmwContext;
use crate::store::pending_io::PendingIoManager;
use crate::store::Session;

mod checkpoint;
mod index_grow;
mod recovery;

/// How long an append waits for the log to free a page frame before giving up.
const LOG_FULL_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for FasterKV
#[derive(Debug, Clone)]
pub struct FasterKvConfig {
    /// Initial hash table size (must be power of 2)
    pub table_size: u64,
    /// Log memory size in bytes
    pub log_memory_size: u64,
    /// Log page size bits (page size = 1 << page_size_bits)
    pub page_size_bits: u32,
    /// Mutable fraction of log memory
    pub mutable_fraction: f64,
    /// Directory that receives one sub-directory per checkpoint
    pub checkpoint_dir: PathBuf,
    /// Checkpoint kind used by [`FasterKv::checkpoint`]
    pub checkpoint_type: CheckpointType,
    /// Object log settings, used when values are variable-size
    pub object_log: ObjectLogConfig,
    /// Index growth settings
    pub grow: GrowConfig,
}

impl FasterKvConfig {
    /// Create a new configuration
    pub fn new(table_size: u64, log_memory_size: u64) -> Self {
        Self {
            table_size,
            log_memory_size,
            ..Self::default()
        }
    }

    pub fn with_page_size_bits(mut self, page_size_bits: u32) -> Self {
        self.page_size_bits = page_size_bits;
        self
    }

    /// Size the log memory as `1 << bits` bytes.
    pub fn with_memory_size_bits(mut self, bits: u32) -> Self {
        self.log_memory_size = 1u64.checked_shl(bits).unwrap_or(0);
        self
    }

    pub fn with_mutable_fraction(mut self, mutable_fraction: f64) -> Self {
        self.mutable_fraction = mutable_fraction;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn with_checkpoint_type(mut self, checkpoint_type: CheckpointType) -> Self {
        self.checkpoint_type = checkpoint_type;
        self
    }

    pub fn with_grow(mut self, grow: GrowConfig) -> Self {
        self.grow = grow;
        self
    }

    /// Check the settings without building anything.
    pub fn validate(&self) -> Result<(), Status> {
        if !crate::utility::is_power_of_two(self.table_size) {
            return Err(Status::InvalidArgument);
        }
        HybridLogConfig::new(self.log_memory_size, self.page_size_bits, self.mutable_fraction)?;
        Ok(())
    }

    fn log_config(&self) -> Result<HybridLogConfig, Status> {
        HybridLogConfig::new(self.log_memory_size, self.page_size_bits, self.mutable_fraction)
    }
}

impl Default for FasterKvConfig {
    fn default() -> Self {
        Self {
            table_size: 1 << 20,      // 1M buckets
            log_memory_size: 1 << 29, // 512 MB
            page_size_bits: 22,       // 4 MB pages
            mutable_fraction: 0.9,
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_type: CheckpointType::Snapshot,
            object_log: ObjectLogConfig::default(),
            grow: GrowConfig::default(),
        }
    }
}

/// Progress of one session, as needed to report its checkpointed serial number.
#[derive(Debug, Default)]
pub(crate) struct SessionProgress {
    /// Version of the last completed operation
    version: u32,
    /// Serial of the last completed operation
    serial: u64,
    /// Serial of the last operation completed in an earlier version
    prior_serial: u64,
}

impl SessionProgress {
    pub(crate) fn new(version: u32, serial: u64) -> Self {
        Self {
            version,
            serial,
            prior_serial: serial,
        }
    }

    fn complete(&mut self, version: u32, serial: u64) {
        if version > self.version {
            self.prior_serial = self.serial;
            self.version = version;
        }
        self.serial = self.serial.max(serial);
    }

    /// Last serial whose operation belongs to a version no later than `cut`.
    pub(crate) fn serial_at(&self, cut: u32) -> u64 {
        if self.version > cut {
            self.prior_serial
        } else {
            self.serial
        }
    }
}

/// Newest record of a key found by a chain walk through memory.
enum Trace<'g> {
    Resident(Address, &'g Record),
    Absent,
    OnDisk(Address),
}

/// Newest record of a key on the device, read while no guard was held.
#[derive(Debug, Clone)]
pub(crate) struct StableRecord {
    pub(crate) tombstone: bool,
    /// Inline value bytes
    pub(crate) value: Vec<u8>,
}

/// Result of following a chain on the device from `address`.
#[derive(Debug, Clone)]
struct StableLookup {
    address: Address,
    record: Option<StableRecord>,
}

/// Newest live-or-dead state of a key, from memory or the device.
enum Latest<'g> {
    Absent,
    Resident(Address, &'g Record),
    Stable(&'g StableRecord),
}

/// Outcome of one attempt at an operation.
enum Step {
    Done(Status),
    /// Lost a race; start over from the index.
    Retry,
    /// No page frame is free at the tail.
    LogFull,
    /// The newest record may be at this stable address.
    NeedsDisk(Address),
}

/// Result of a read that did not need the device, or the address it must wait for.
pub(crate) enum ReadResult<V> {
    Done(Option<V>),
    OnDisk(Address),
}

enum Appended {
    Linked,
    Lost,
    LogFull,
}

/// Epoch slot held by store-internal work that has no session.
pub(crate) struct InternalSlot<'a> {
    epoch: &'a LightEpoch,
    id: usize,
}

impl<'a> InternalSlot<'a> {
    pub(crate) fn acquire(epoch: &'a LightEpoch) -> Result<Self, Status> {
        let id = epoch.acquire_thread_slot().ok_or(Status::InvalidOperation)?;
        Ok(Self { epoch, id })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }
}

impl Drop for InternalSlot<'_> {
    fn drop(&mut self) {
        self.epoch.release_thread_slot(self.id);
    }
}

/// FasterKV - High-performance concurrent key-value store
///
/// This is the main store implementation that coordinates:
/// - Epoch protection for safe memory reclamation
/// - Hash index for key lookups
/// - Hybrid log for record storage
/// - Object log for variable-size values
/// - Index growth for dynamic resizing
/// - Checkpoints with per-session serial numbers
pub struct FasterKv<K, V, D>
where
    K: PersistKey,
    V: PersistValue,
    D: StorageDevice,
{
    config: FasterKvConfig,
    /// Epoch protection
    epoch: Arc<LightEpoch>,
    /// Hash index
    index: MemHashIndex,
    /// Hybrid log
    hlog: Arc<HybridLog<D>>,
    /// Heap for variable-size values
    object_log: Option<Arc<ObjectLog>>,
    /// Background reader for the pending-read path
    pending_io: PendingIoManager,
    /// Checkpoint version; records carry its low bits
    version: AtomicU32,
    /// Serializes index growth, checkpoints, truncation and index scans
    maintenance: Mutex<()>,
    /// Live sessions by GUID
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<SessionProgress>>>>,
    /// Serial numbers of the sessions in the checkpoint this store was recovered from
    recovered_sessions: HashMap<Uuid, u64>,
    last_checkpoint: Mutex<Option<CheckpointToken>>,
    stats: StoreStats,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, D> FasterKv<K, V, D>
where
    K: PersistKey,
    V: PersistValue,
    D: StorageDevice,
{
    const VALUE_IS_FIXED: bool = <V::Codec as ValueCodec<V>>::IS_FIXED;

    /// Create a new store whose values are fixed-size.
    ///
    /// Returns `InvalidArgument` for a variable-size value type; use
    /// [`with_object_log`](Self::with_object_log) for those.
    pub fn new(config: FasterKvConfig, device: D) -> Result<Self, Status> {
        Self::open(config, device, None)
    }

    /// Create a new store that keeps variable-size values on `object_device`.
    pub fn with_object_log(
        config: FasterKvConfig,
        device: D,
        object_device: Arc<dyn StorageDevice>,
    ) -> Result<Self, Status> {
        Self::open(config, device, Some(object_device))
    }

    fn open(
        config: FasterKvConfig,
        device: D,
        object_device: Option<Arc<dyn StorageDevice>>,
    ) -> Result<Self, Status> {
        config.validate()?;
        let index = MemHashIndex::new(&IndexConfig {
            table_size: config.table_size,
            grow: config.grow.clone(),
        })?;
        Self::build(config, device, object_device, index)
    }

    pub(crate) fn build(
        config: FasterKvConfig,
        device: D,
        object_device: Option<Arc<dyn StorageDevice>>,
        index: MemHashIndex,
    ) -> Result<Self, Status> {
        let object_log = match (Self::VALUE_IS_FIXED, object_device) {
            (true, Some(_)) => {
                tracing::debug!("values are fixed-size; object log device unused");
                None
            }
            (true, None) => None,
            (false, Some(object_device)) => Some(Arc::new(ObjectLog::new(
                config.object_log.clone(),
                object_device,
            )?)),
            (false, None) => {
                tracing::warn!("variable-size values need an object log device");
                return Err(Status::InvalidArgument);
            }
        };

        let device = Arc::new(device);
        let epoch = Arc::new(LightEpoch::new());
        let hlog = Arc::new(HybridLog::new(
            config.log_config()?,
            Arc::clone(&device),
            Arc::clone(&epoch),
            object_log.clone(),
        )?);
        // Dedicated thread; does not depend on an external Tokio runtime.
        let pending_io = PendingIoManager::new(device, hlog.page_size())?;

        Ok(Self {
            config,
            epoch,
            index,
            hlog,
            object_log,
            pending_io,
            version: AtomicU32::new(1),
            maintenance: Mutex::new(()),
            sessions: RwLock::new(HashMap::new()),
            recovered_sessions: HashMap::new(),
            last_checkpoint: Mutex::new(None),
            stats: StoreStats::new(),
            _marker: PhantomData,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &FasterKvConfig {
        &self.config
    }

    /// Get a reference to the epoch
    pub fn epoch(&self) -> &LightEpoch {
        &self.epoch
    }

    /// Current checkpoint version.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Get the storage device
    pub fn device(&self) -> &Arc<D> {
        self.hlog.device()
    }

    pub(crate) fn pending_io(&self) -> &PendingIoManager {
        &self.pending_io
    }

    pub(crate) fn begin_address(&self) -> Address {
        self.hlog.get_begin_address()
    }

    // ============ Session Management API ============

    /// Start a new session.
    ///
    /// Each session owns one epoch slot until it is dropped; `InvalidOperation` means
    /// every slot is taken.
    pub fn start_session(self: &Arc<Self>) -> Result<Session<K, V, D>, Status> {
        self.open_session(Uuid::new_v4(), 0)
    }

    /// Resume a session recorded in the checkpoint this store was recovered from.
    ///
    /// The session continues from its checkpointed serial number; operations after it
    /// were lost and must be reissued by the caller.
    pub fn continue_session(self: &Arc<Self>, guid: Uuid) -> Result<Session<K, V, D>, Status> {
        let serial = *self.recovered_sessions.get(&guid).ok_or(Status::NotFound)?;
        if self.sessions.read().contains_key(&guid) {
            return Err(Status::InvalidOperation);
        }
        self.open_session(guid, serial)
    }

    fn open_session(self: &Arc<Self>, guid: Uuid, serial: u64) -> Result<Session<K, V, D>, Status> {
        let thread_id = self
            .epoch
            .acquire_thread_slot()
            .ok_or(Status::InvalidOperation)?;
        let progress = Arc::new(Mutex::new(SessionProgress::new(self.version(), serial)));
        self.sessions.write().insert(guid, Arc::clone(&progress));
        tracing::debug!(guid = %guid, serial, slot = thread_id, "session started");
        Ok(Session::new(Arc::clone(self), thread_id, guid, serial, progress))
    }

    pub(crate) fn end_session(&self, guid: Uuid, thread_id: usize) {
        self.sessions.write().remove(&guid);
        self.epoch.release_thread_slot(thread_id);
        tracing::debug!(guid = %guid, "session ended");
    }

    /// Number of live sessions.
    pub fn active_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Serial numbers of live sessions as a checkpoint taken now would record them.
    pub fn session_states(&self) -> Vec<SessionState> {
        let version = self.version();
        self.sessions
            .read()
            .iter()
            .map(|(guid, progress)| SessionState::new(*guid, progress.lock().serial_at(version)))
            .collect()
    }

    /// Checkpointed serial of session `guid`, if the store was recovered with it.
    pub fn recovered_serial(&self, guid: Uuid) -> Option<u64> {
        self.recovered_sessions.get(&guid).copied()
    }

    // ============ Log maintenance ============

    /// Truncate the log below `address`. Keys whose chain lies entirely below it read as
    /// absent; their index entries are cleared.
    ///
    /// Must not be called from inside an operation. A range still in memory is flushed
    /// and evicted first, so the begin address never passes the head. The device prefix
    /// and the objects referenced only from the truncated range are released once no
    /// thread can still be reading them.
    pub fn shift_begin_address(&self, address: Address) -> bool {
        let _maintenance = self.maintenance.lock();
        let target = address.min(self.hlog.get_tail_address());
        if target <= self.hlog.get_begin_address() {
            return false;
        }
        if target > self.hlog.get_head_address() {
            if let Err(e) = self.hlog.flush_and_evict_until(target, true) {
                tracing::warn!(begin = %target, error = %e, "could not evict log before truncation");
                return false;
            }
        }
        if !self.hlog.shift_begin_address(target) {
            return false;
        }
        let begin = self.hlog.get_begin_address();
        let cleared = self.index.garbage_collect(begin);
        self.epoch.drain_pending();
        tracing::info!(begin = %begin, cleared, "log truncated");
        true
    }

    /// Flush the whole log and move the head to the tail.
    ///
    /// Must not be called from inside an operation. With `wait` every page below the tail
    /// has left memory on return, so later reads of older records go pending.
    pub fn flush_and_evict(&self, wait: bool) -> Status {
        match self.hlog.flush_and_evict(wait) {
            Ok(()) => Status::Ok,
            Err(e) => {
                tracing::warn!(error = %e, "flush and evict failed");
                Status::IoError
            }
        }
    }

    // ============ Statistics ============

    /// Get log statistics
    pub fn log_stats(&self) -> LogStats {
        self.hlog.get_stats()
    }

    /// Get hash index statistics
    pub fn index_stats(&self) -> IndexStats {
        let _maintenance = self.maintenance.lock();
        self.index.stats()
    }

    /// Object log watermarks, when values are variable-size.
    pub fn object_log_stats(&self) -> Option<ObjectLogStats> {
        self.object_log.as_ref().map(|log| log.stats())
    }

    /// Operation counters.
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub(crate) fn stats_collector(&self) -> &StoreStats {
        &self.stats
    }

    /// Grow the hash index to twice its size.
    pub fn grow_index(&self) -> Result<GrowResult, Status> {
        let _maintenance = self.maintenance.lock();
        self.grow_index_locked()
    }

    // ============ Operation executor ============

    /// Enter the epoch, waiting out an index growth.
    fn protect(&self, thread_id: usize) -> EpochGuard<'_> {
        loop {
            let guard = EpochGuard::new(&self.epoch, thread_id);
            if !self.index.is_growing() {
                return guard;
            }
            drop(guard);
            thread::yield_now();
        }
    }

    /// Run `step` until it completes. Device lookups and waits for log space happen
    /// between attempts with no guard held. A completed mutating operation publishes its
    /// serial to `progress` while still protected, so a checkpoint cut sees it.
    fn drive<F>(
        &self,
        thread_id: usize,
        key: &[u8],
        progress: Option<(&Mutex<SessionProgress>, u64)>,
        mut step: F,
    ) -> Status
    where
        F: FnMut(&EpochGuard<'_>, u32, Option<&StableLookup>) -> Result<Step, Status>,
    {
        let mut stable: Option<StableLookup> = None;
        let mut waiting_since: Option<Instant> = None;
        loop {
            let mut wants_growth = false;
            let outcome = {
                let guard = self.protect(thread_id);
                let version = self.version.load(Ordering::SeqCst);
                let outcome = step(&guard, version, stable.as_ref());
                if let (Ok(Step::Done(_)), Some((progress, serial))) = (&outcome, progress) {
                    progress.lock().complete(version, serial);
                    wants_growth = self.index.should_grow();
                }
                outcome
            };

            match outcome {
                Ok(Step::Done(status)) => {
                    if wants_growth {
                        self.try_auto_grow();
                    }
                    return status;
                }
                Ok(Step::Retry) => {
                    self.stats.record_retry();
                    std::hint::spin_loop();
                }
                Ok(Step::LogFull) => {
                    let since = *waiting_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > LOG_FULL_TIMEOUT {
                        tracing::warn!(
                            tail = %self.hlog.get_tail_address(),
                            flush_error = ?self.hlog.last_flush_error(),
                            "log full; giving up on allocation"
                        );
                        return Status::OutOfMemory;
                    }
                    self.stats.record_retry();
                    self.epoch.drain_pending();
                    thread::yield_now();
                }
                Ok(Step::NeedsDisk(address)) => match self.trace_on_device(key, address) {
                    Ok(record) => stable = Some(StableLookup { address, record }),
                    Err(status) => return status,
                },
                Err(status) => return status,
            }
        }
    }

    /// Walk the chain from `address` through memory to the newest record for `key`.
    fn trace_in_memory<'g>(&self, key: &[u8], mut address: Address, guard: &'g EpochGuard<'_>) -> Trace<'g> {
        let begin = self.hlog.get_begin_address();
        loop {
            if !address.is_valid() || address < begin {
                return Trace::Absent;
            }
            let Some(record) = self.hlog.get(address, guard) else {
                return Trace::OnDisk(address);
            };
            let info = record.info();
            if !info.is_invalid() && record.key() == key {
                return Trace::Resident(address, record);
            }
            address = info.previous_address();
        }
    }

    /// Walk the chain from a stable `address` on the device. No guard is needed: stable
    /// bytes never change.
    fn trace_on_device(&self, key: &[u8], mut address: Address) -> Result<Option<StableRecord>, Status> {
        let begin = self.hlog.get_begin_address();
        while address.is_valid() && address >= begin {
            let bytes = self
                .hlog
                .read_record_from_device(address)?
                .ok_or(Status::Corruption)?;
            let view = RecordView::parse(&bytes)?.ok_or(Status::Corruption)?;
            if !view.info.is_invalid() && view.key == key {
                return Ok(Some(StableRecord {
                    tombstone: view.info.is_tombstone(),
                    value: view.value.to_vec(),
                }));
            }
            address = view.info.previous_address();
        }
        Ok(None)
    }

    /// Resolve the newest state of `key` from `head`, or ask the driver for a device
    /// lookup.
    fn latest<'g>(
        &self,
        key: &[u8],
        head: Address,
        guard: &'g EpochGuard<'_>,
        stable: Option<&'g StableLookup>,
    ) -> Result<Latest<'g>, Address> {
        match self.trace_in_memory(key, head, guard) {
            Trace::Resident(address, record) => Ok(Latest::Resident(address, record)),
            Trace::Absent => Ok(Latest::Absent),
            Trace::OnDisk(address) => match stable {
                Some(lookup) if lookup.address == address => Ok(match &lookup.record {
                    Some(record) => Latest::Stable(record),
                    None => Latest::Absent,
                }),
                _ => Err(address),
            },
        }
    }

    /// Append a record linked to the chain `found` was read from and publish it.
    fn append(
        &self,
        found: &FindResult,
        key: &[u8],
        value: &[u8],
        version: u32,
        tombstone: bool,
    ) -> Result<Appended, Status> {
        let size = record_size(key.len(), value.len());
        let address = match self.hlog.allocate(size) {
            Ok(address) => address,
            Err(Status::OutOfMemory) => return Ok(Appended::LogFull),
            Err(status) => return Err(status),
        };
        let ptr = self.hlog.get_mut_ptr(address).ok_or(Status::Corruption)?;
        let info = RecordInfo::new(found.address(), version, tombstone);
        // SAFETY: the allocation is ours, resident, and unreachable until the CAS below.
        unsafe { Record::write(ptr, info, key, value) };
        if !Self::VALUE_IS_FIXED && !tombstone {
            if let Ok(object) = ObjectRef::from_bytes(value) {
                self.hlog.note_object(address, object.address);
            }
        }

        match self.index.try_update_entry(found, address) {
            Status::Ok => Ok(Appended::Linked),
            status => {
                // Unreachable from any chain; recovery and scans must skip it.
                // SAFETY: written above.
                unsafe { Record::from_ptr(ptr) }.set_invalid();
                if status == Status::Aborted {
                    Ok(Appended::Lost)
                } else {
                    Err(status)
                }
            }
        }
    }

    fn appended(outcome: Appended) -> Step {
        match outcome {
            Appended::Linked => Step::Done(Status::Ok),
            Appended::Lost => Step::Retry,
            Appended::LogFull => Step::LogFull,
        }
    }

    /// Inline bytes for `value`: the encoding itself, or a reference to it in the object
    /// log. The caller must be epoch protected so that a flush of the object log cannot
    /// overtake the store, and must append the referencing record under the same guard:
    /// object-log truncation only waits for records of guards it has seen.
    fn encode_inline(&self, value: &V, _guard: &EpochGuard<'_>) -> Result<Vec<u8>, Status> {
        let bytes = encode_value::<V, V::Codec>(value)?;
        if Self::VALUE_IS_FIXED {
            return Ok(bytes);
        }
        let object_log = self.object_log.as_ref().ok_or(Status::InvalidOperation)?;
        Ok(object_log.store(&bytes)?.to_bytes().to_vec())
    }

    pub(crate) fn decode_inline(&self, inline: &[u8]) -> Result<V, Status> {
        if Self::VALUE_IS_FIXED {
            return <V::Codec as ValueCodec<V>>::decode(inline);
        }
        let object_log = self.object_log.as_ref().ok_or(Status::InvalidOperation)?;
        let bytes = object_log.load(ObjectRef::from_bytes(inline)?)?;
        <V::Codec as ValueCodec<V>>::decode(&bytes)
    }

    /// Copy the value out of a resident record, under its lock while it may still be
    /// updated in place.
    fn copy_resident_value(&self, address: Address, record: &Record) -> Option<Vec<u8>> {
        if address < self.hlog.get_safe_read_only_address() {
            return Some(record.copy_value());
        }
        if !record.try_lock() {
            return None;
        }
        let value = record.copy_value();
        record.unlock();
        Some(value)
    }

    pub(crate) fn read_internal(&self, thread_id: usize, key: &[u8], hash: KeyHash) -> Result<ReadResult<V>, Status> {
        loop {
            let inline = {
                let guard = self.protect(thread_id);
                let found = self.index.find_entry(hash);
                if !found.found() {
                    return Ok(ReadResult::Done(None));
                }
                match self.trace_in_memory(key, found.address(), &guard) {
                    Trace::Absent => return Ok(ReadResult::Done(None)),
                    Trace::OnDisk(address) => return Ok(ReadResult::OnDisk(address)),
                    Trace::Resident(address, record) => {
                        if record.info().is_tombstone() {
                            return Ok(ReadResult::Done(None));
                        }
                        self.copy_resident_value(address, record)
                    }
                }
            };
            match inline {
                Some(inline) => return self.decode_inline(&inline).map(|v| ReadResult::Done(Some(v))),
                None => self.stats.record_retry(),
            }
        }
    }

    pub(crate) fn upsert_internal(
        &self,
        thread_id: usize,
        key: &[u8],
        hash: KeyHash,
        value: &V,
        progress: (&Mutex<SessionProgress>, u64),
    ) -> Status {
        let mut inline: Option<Vec<u8>> = None;
        self.drive(thread_id, key, Some(progress), |guard, version, _| {
            let found = self.index.find_or_create_entry(hash);
            if inline.is_none() || !Self::VALUE_IS_FIXED {
                inline = Some(self.encode_inline(value, guard)?);
            }
            let bytes = inline.as_deref().unwrap_or_default();
            Ok(Self::appended(self.append(&found, key, bytes, version, false)?))
        })
    }

    pub(crate) fn delete_internal(
        &self,
        thread_id: usize,
        key: &[u8],
        hash: KeyHash,
        progress: (&Mutex<SessionProgress>, u64),
    ) -> Status {
        self.drive(thread_id, key, Some(progress), |guard, version, stable| {
            let found = self.index.find_entry(hash);
            if !found.found() {
                return Ok(Step::Done(Status::NotFound));
            }
            let live = match self.latest(key, found.address(), guard, stable) {
                Err(address) => return Ok(Step::NeedsDisk(address)),
                Ok(Latest::Absent) => false,
                Ok(Latest::Resident(_, record)) => !record.info().is_tombstone(),
                Ok(Latest::Stable(record)) => !record.tombstone,
            };
            if !live {
                return Ok(Step::Done(Status::NotFound));
            }
            Ok(Self::appended(self.append(&found, key, &[], version, true)?))
        })
    }

    pub(crate) fn conditional_insert_internal(
        &self,
        thread_id: usize,
        key: &[u8],
        hash: KeyHash,
        value: &V,
        progress: (&Mutex<SessionProgress>, u64),
    ) -> Status {
        let mut inline: Option<Vec<u8>> = None;
        self.drive(thread_id, key, Some(progress), |guard, version, stable| {
            let found = self.index.find_or_create_entry(hash);
            let live = match self.latest(key, found.address(), guard, stable) {
                Err(address) => return Ok(Step::NeedsDisk(address)),
                Ok(Latest::Absent) => false,
                Ok(Latest::Resident(_, record)) => !record.info().is_tombstone(),
                Ok(Latest::Stable(record)) => !record.tombstone,
            };
            if live {
                return Ok(Step::Done(Status::Aborted));
            }
            if inline.is_none() || !Self::VALUE_IS_FIXED {
                inline = Some(self.encode_inline(value, guard)?);
            }
            let bytes = inline.as_deref().unwrap_or_default();
            Ok(Self::appended(self.append(&found, key, bytes, version, false)?))
        })
    }

    pub(crate) fn rmw_internal<C>(
        &self,
        thread_id: usize,
        key: &[u8],
        hash: KeyHash,
        ctx: &mut C,
        progress: (&Mutex<SessionProgress>, u64),
    ) -> Status
    where
        C: RmwContext<V>,
    {
        self.drive(thread_id, key, Some(progress), |guard, version, stable| {
            let found = self.index.find_or_create_entry(hash);
            match self.latest(key, found.address(), guard, stable) {
                Err(address) => Ok(Step::NeedsDisk(address)),
                Ok(Latest::Absent) => {
                    let value = ctx.initial_value();
                    let inline = self.encode_inline(&value, guard)?;
                    Ok(Self::appended(self.append(&found, key, &inline, version, false)?))
                }
                Ok(Latest::Stable(record)) => {
                    let value = if record.tombstone {
                        ctx.initial_value()
                    } else {
                        ctx.copy_update(&self.decode_inline(&record.value)?)
                    };
                    let inline = self.encode_inline(&value, guard)?;
                    Ok(Self::appended(self.append(&found, key, &inline, version, false)?))
                }
                Ok(Latest::Resident(address, record)) => {
                    self.rmw_resident(&mut *ctx, &found, key, hash, address, record, version, guard)
                }
            }
        })
    }

    /// RMW against the newest record when it is in memory.
    ///
    /// Records at or above the safe read-only address may still be updated in place by
    /// other threads, so both the in-place path and the copy path hold the record lock;
    /// the in-place path also re-checks that no newer record for the key was published.
    #[allow(clippy::too_many_arguments)]
    fn rmw_resident<C>(
        &self,
        ctx: &mut C,
        found: &FindResult,
        key: &[u8],
        hash: KeyHash,
        address: Address,
        record: &Record,
        version: u32,
        guard: &EpochGuard<'_>,
    ) -> Result<Step, Status>
    where
        C: RmwContext<V>,
    {
        let info = record.info();
        let locked = address >= self.hlog.get_safe_read_only_address();
        if locked && !record.try_lock() {
            return Ok(Step::Retry);
        }
        let result = self.rmw_resident_locked(ctx, found, key, hash, address, record, info, version, guard);
        if locked {
            record.unlock();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn rmw_resident_locked<C>(
        &self,
        ctx: &mut C,
        found: &FindResult,
        key: &[u8],
        hash: KeyHash,
        address: Address,
        record: &Record,
        info: RecordInfo,
        version: u32,
        guard: &EpochGuard<'_>,
    ) -> Result<Step, Status>
    where
        C: RmwContext<V>,
    {
        if info.is_tombstone() {
            let inline = self.encode_inline(&ctx.initial_value(), guard)?;
            return Ok(Self::appended(self.append(found, key, &inline, version, false)?));
        }

        let old = self.decode_inline(&record.copy_value())?;
        let in_place = Self::VALUE_IS_FIXED
            && self.hlog.is_mutable(address)
            && info.version() == record_version(version);
        if in_place {
            let newest = self.index.find_entry(hash).address();
            match self.trace_in_memory(key, newest, guard) {
                Trace::Resident(current, _) if current == address => {}
                _ => return Ok(Step::Retry),
            }
            let mut value = old.clone();
            if ctx.in_place_update(&mut value) {
                record.overwrite_value(&encode_value::<V, V::Codec>(&value)?)?;
                self.stats.record_in_place_update();
                return Ok(Step::Done(Status::Ok));
            }
        }

        let value = ctx.copy_update(&old);
        let inline = self.encode_inline(&value, guard)?;
        Ok(Self::appended(self.append(found, key, &inline, version, false)?))
    }

    /// Key hash and predecessor of the record at `address`, for splitting chains.
    fn chain_link(&self, slot: usize, address: Address) -> Result<ChainLink, Status> {
        {
            let guard = EpochGuard::new(&self.epoch, slot);
            if let Some(record) = self.hlog.get(address, &guard) {
                return Ok(ChainLink {
                    hash: KeyHash::new(hash64(record.key())),
                    previous: record.info().previous_address(),
                });
            }
        }
        let bytes = self
            .hlog
            .read_record_from_device(address)?
            .ok_or(Status::Corruption)?;
        let view = RecordView::parse(&bytes)?.ok_or(Status::Corruption)?;
        Ok(ChainLink {
            hash: KeyHash::new(hash64(view.key)),
            previous: view.info.previous_address(),
        })
    }
}

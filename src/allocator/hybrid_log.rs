//! Hybrid log allocator
//!
//! Records are bump-allocated at the tail of a ring of in-memory pages. Pages age from
//! the mutable region into the read-only region, are flushed to the device, and finally
//! leave memory once the head address passes them. Every boundary move that could
//! invalidate a pointer held by another thread is completed by an epoch action.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::address::{Address, AtomicAddress, AtomicPageOffset, PageOffset};
use crate::allocator::page_allocator::{OpenOutcome, PageFrames};
use crate::device::{block_on_io, StorageDevice};
use crate::epoch::{EpochGuard, LightEpoch};
use crate::object_log::ObjectLog;
use crate::record::Record;
use crate::status::Status;

/// First address handed out by a fresh log. Addresses 0 and 1 are never records.
pub const LOG_START_ADDRESS: u64 = 64;

/// Configuration for the hybrid log allocator
#[derive(Debug, Clone, PartialEq)]
pub struct HybridLogConfig {
    /// log2 of the page size
    pub page_size_bits: u32,
    /// Number of page frames kept in memory
    pub memory_pages: u32,
    /// Pages at the tail that accept in-place updates
    pub mutable_pages: u32,
}

impl HybridLogConfig {
    /// Smallest supported page.
    pub const MIN_PAGE_BITS: u32 = 9;
    /// Largest supported page.
    pub const MAX_PAGE_BITS: u32 = 30;

    /// Derive a configuration from a memory budget.
    pub fn new(memory_size: u64, page_size_bits: u32, mutable_fraction: f64) -> Result<Self, Status> {
        if !(Self::MIN_PAGE_BITS..=Self::MAX_PAGE_BITS).contains(&page_size_bits) {
            return Err(Status::InvalidArgument);
        }
        if !(mutable_fraction > 0.0 && mutable_fraction <= 1.0) {
            return Err(Status::InvalidArgument);
        }
        let memory_pages = memory_size >> page_size_bits;
        if memory_pages < 2 || memory_pages > u32::MAX as u64 {
            return Err(Status::InvalidArgument);
        }
        let memory_pages = memory_pages as u32;
        let mutable_pages = ((memory_pages as f64 * mutable_fraction).round() as u32)
            .clamp(1, memory_pages - 1);

        Ok(Self {
            page_size_bits,
            memory_pages,
            mutable_pages,
        })
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u64 {
        1 << self.page_size_bits
    }

    fn validate(&self) -> Result<(), Status> {
        if !(Self::MIN_PAGE_BITS..=Self::MAX_PAGE_BITS).contains(&self.page_size_bits)
            || self.memory_pages < 2
            || self.mutable_pages == 0
            || self.mutable_pages >= self.memory_pages
        {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for HybridLogConfig {
    fn default() -> Self {
        Self {
            page_size_bits: 22,
            memory_pages: 64,
            mutable_pages: 57,
        }
    }
}

/// The hybrid log.
///
/// Shared behind an `Arc` so that epoch actions can own a handle to it; methods that
/// schedule such actions take `self: &Arc<Self>`.
pub struct HybridLog<D: StorageDevice> {
    page_bits: u32,
    mutable_pages: u64,
    frames: PageFrames,
    device: Arc<D>,
    epoch: Arc<LightEpoch>,
    object_log: Option<Arc<ObjectLog>>,

    tail: AtomicPageOffset,
    begin_address: AtomicAddress,
    head_address: AtomicAddress,
    safe_head_address: AtomicAddress,
    read_only_address: AtomicAddress,
    safe_read_only_address: AtomicAddress,
    flushed_until_address: AtomicAddress,
    /// Head address requested by page turns, applied once the log is flushed that far.
    desired_head_address: AtomicAddress,
    /// Object-log prefix referenced by records below the safe read-only address.
    object_flush_target: AtomicU64,
    /// Lowest object address referenced from each evicted page that references any.
    object_floors: Mutex<BTreeMap<u64, u64>>,
    /// First page whose object references are tracked; earlier pages were recovered.
    object_floors_from: AtomicU64,

    flush_lock: Mutex<()>,
    last_flush_error: Mutex<Option<std::io::ErrorKind>>,
}

impl<D: StorageDevice> HybridLog<D> {
    /// Create an empty log.
    pub fn new(
        config: HybridLogConfig,
        device: Arc<D>,
        epoch: Arc<LightEpoch>,
        object_log: Option<Arc<ObjectLog>>,
    ) -> Result<Self, Status> {
        config.validate()?;
        let page_bits = config.page_size_bits;
        let frames = PageFrames::new(config.memory_pages as usize, 1usize << page_bits);
        frames.open(0)?;

        let start = Address::new(LOG_START_ADDRESS);
        Ok(Self {
            page_bits,
            mutable_pages: config.mutable_pages as u64,
            frames,
            device,
            epoch,
            object_log,
            tail: AtomicPageOffset::new(PageOffset::from_address(start, page_bits)),
            begin_address: AtomicAddress::new(start),
            head_address: AtomicAddress::new(start),
            safe_head_address: AtomicAddress::new(start),
            read_only_address: AtomicAddress::new(start),
            safe_read_only_address: AtomicAddress::new(start),
            flushed_until_address: AtomicAddress::new(start),
            desired_head_address: AtomicAddress::new(start),
            object_flush_target: AtomicU64::new(0),
            object_floors: Mutex::new(BTreeMap::new()),
            object_floors_from: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
            last_flush_error: Mutex::new(None),
        })
    }

    /// Page size in bytes.
    #[inline]
    pub fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    /// log2 of the page size.
    #[inline]
    pub fn page_bits(&self) -> u32 {
        self.page_bits
    }

    /// Number of in-memory page frames.
    pub fn buffer_size(&self) -> u64 {
        self.frames.count()
    }

    /// Get the tail address
    #[inline]
    pub fn get_tail_address(&self) -> Address {
        self.tail.load(Ordering::Acquire).to_address(self.page_bits)
    }

    /// Get the read-only address
    #[inline]
    pub fn get_read_only_address(&self) -> Address {
        self.read_only_address.load(Ordering::Acquire)
    }

    /// Get the safe read-only address
    #[inline]
    pub fn get_safe_read_only_address(&self) -> Address {
        self.safe_read_only_address.load(Ordering::Acquire)
    }

    /// Get the head address
    #[inline]
    pub fn get_head_address(&self) -> Address {
        self.head_address.load(Ordering::Acquire)
    }

    /// Get the safe head address
    #[inline]
    pub fn get_safe_head_address(&self) -> Address {
        self.safe_head_address.load(Ordering::Acquire)
    }

    /// Get the begin address
    #[inline]
    pub fn get_begin_address(&self) -> Address {
        self.begin_address.load(Ordering::Acquire)
    }

    /// Get the flushed-until address
    #[inline]
    pub fn get_flushed_until_address(&self) -> Address {
        self.flushed_until_address.load(Ordering::Acquire)
    }

    /// Device backing the stable region.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Object log coupled to this log's flushes, if any.
    pub fn object_log(&self) -> Option<&Arc<ObjectLog>> {
        self.object_log.as_ref()
    }

    /// Kind of the last flush failure, if the most recent flush failed.
    pub fn last_flush_error(&self) -> Option<std::io::ErrorKind> {
        *self.last_flush_error.lock()
    }

    /// Reserve `size` bytes at the tail.
    ///
    /// The caller must be epoch protected. `Err(OutOfMemory)` means the frame for the
    /// next page still holds an unflushed or unevicted page; the caller should leave its
    /// epoch, let the scheduled flush and eviction run, and try again.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<Address, Status> {
        let size = size as u64;
        let page_size = self.page_size();
        if size == 0 || size > page_size {
            return Err(Status::InvalidArgument);
        }

        loop {
            let reserved = self.tail.reserve(size);
            let page = reserved.page();
            if reserved.offset() + size <= page_size {
                return Ok(Address::from_page(page, reserved.offset(), self.page_bits));
            }

            // The reservation ran off the page; whoever gets here first opens the next one.
            // Bytes between the last record and the page end stay zero and read as filler.
            match self.frames.open(page + 1)? {
                OpenOutcome::Ready => {
                    if self.tail.new_page(page) {
                        self.on_page_turn(page + 1);
                    }
                }
                OpenOutcome::Occupied => {
                    self.on_page_turn(page);
                    return Err(Status::OutOfMemory);
                }
            }
        }
    }

    /// Move the region boundaries for a tail that has entered `new_page`.
    fn on_page_turn(self: &Arc<Self>, new_page: u64) {
        let frames = self.frames.count();
        if new_page + 1 >= self.mutable_pages {
            let read_only_page = new_page + 1 - self.mutable_pages;
            self.shift_read_only_address(Address::from_page(read_only_page, 0, self.page_bits));
        }
        if new_page + 2 >= frames {
            let head_page = new_page + 2 - frames;
            let desired = Address::from_page(head_page, 0, self.page_bits);
            self.desired_head_address.monotonic_update(desired);
            self.shift_head_address(desired);
        }
    }

    /// Pointer to the record at `address`, if it lies in memory.
    ///
    /// Returns `None` below the head address. The reference cannot outlive `guard`.
    #[inline]
    pub fn get<'g>(&self, address: Address, _guard: &'g EpochGuard<'_>) -> Option<&'g Record> {
        if address < self.get_head_address() {
            return None;
        }
        let base = self.frames.page_ptr(address.page(self.page_bits))?;
        // SAFETY: the page is resident and cannot be released while the guard keeps this
        // thread in an epoch no later than the head shift that would release it.
        unsafe { Some(Record::from_ptr(base.add(address.offset(self.page_bits) as usize))) }
    }

    /// Raw pointer to `address` for writing a freshly allocated record.
    #[inline]
    pub(crate) fn get_mut_ptr(&self, address: Address) -> Option<*mut u8> {
        let base = self.frames.page_ptr(address.page(self.page_bits))?;
        // SAFETY: the offset is inside the page.
        Some(unsafe { base.add(address.offset(self.page_bits) as usize) })
    }

    /// Check if `address` may be updated in place.
    #[inline]
    pub fn is_mutable(&self, address: Address) -> bool {
        address >= self.get_read_only_address()
    }

    /// Check if `address` lies in the stable region.
    #[inline]
    pub fn is_on_disk(&self, address: Address) -> bool {
        address < self.get_head_address()
    }

    /// Advance the read-only boundary. Pages below it are flushed once every thread
    /// that could still be updating them in place has left its epoch.
    pub fn shift_read_only_address(self: &Arc<Self>, new_address: Address) {
        let new_address = new_address.min(self.get_tail_address());
        if self.read_only_address.monotonic_update(new_address).is_none() {
            return;
        }
        let object_target = self.object_log.as_ref().map(|log| log.get_tail_address());
        let log = Arc::clone(self);
        self.epoch.bump_current_epoch_with_action(move || {
            log.on_safe_read_only(new_address, object_target);
        });
    }

    fn on_safe_read_only(self: &Arc<Self>, new_address: Address, object_target: Option<u64>) {
        if let Some(target) = object_target {
            self.object_flush_target.fetch_max(target, Ordering::AcqRel);
        }
        self.safe_read_only_address.monotonic_update(new_address);
        if self.flush_until(new_address).is_ok() {
            let desired = self.desired_head_address.load(Ordering::Acquire);
            self.shift_head_address(desired);
        }
    }

    /// Advance the head. Never moves past the flushed-until address; pages below the new
    /// head are released once the safe epoch passes the shift.
    pub fn shift_head_address(self: &Arc<Self>, new_address: Address) {
        let new_address = new_address.min(self.get_flushed_until_address());
        if self.head_address.monotonic_update(new_address).is_none() {
            return;
        }
        let log = Arc::clone(self);
        self.epoch.bump_current_epoch_with_action(move || {
            log.on_safe_head(new_address);
        });
    }

    fn on_safe_head(&self, new_address: Address) {
        let Some(previous) = self.safe_head_address.monotonic_update(new_address) else {
            return;
        };
        let first = previous.page(self.page_bits);
        let last = new_address.page(self.page_bits);
        for page in first..last {
            if let Some(floor) = self.frames.object_floor(page) {
                self.object_floors.lock().insert(page, floor);
            }
            self.frames.close(page);
        }
        tracing::debug!(head = %new_address, pages = last.saturating_sub(first), "evicted log pages");
    }

    /// Advance the begin address. Addresses below it end every version chain.
    ///
    /// Never passes the head address: evict first to truncate further. Once no thread
    /// can still be walking into the truncated range, the device prefix is released and
    /// the object log drops the objects only truncated records referenced.
    pub fn shift_begin_address(self: &Arc<Self>, new_address: Address) -> bool {
        let new_address = new_address.min(self.get_head_address());
        if self.begin_address.monotonic_update(new_address).is_none() {
            return false;
        }
        tracing::debug!(begin = %new_address, "shifted begin address");

        let object_tail = self.object_log.as_ref().map(|log| log.get_tail_address());
        let log = Arc::clone(self);
        self.epoch.bump_current_epoch_with_action(move || {
            log.on_safe_begin(new_address, object_tail);
        });
        true
    }

    fn on_safe_begin(&self, begin: Address, object_tail: Option<u64>) {
        // Keep the page holding `begin`; recovery reloads whole pages.
        let keep_from = begin.page_start(self.page_bits).control();
        match block_on_io(self.device.truncate_prefix(keep_from)) {
            Ok(()) => tracing::debug!(until = keep_from, "released log device prefix"),
            Err(e) => tracing::warn!(until = keep_from, error = %e, "could not release log device prefix"),
        }

        let (Some(objects), Some(object_tail)) = (self.object_log.as_ref(), object_tail) else {
            return;
        };
        let Some(floor) = self.object_floor_from(begin) else {
            tracing::debug!(begin = %begin, "object references of recovered pages unknown; object log kept");
            return;
        };
        let begin_page = begin.page(self.page_bits);
        {
            let mut floors = self.object_floors.lock();
            *floors = floors.split_off(&begin_page);
        }
        if let Err(e) = objects.truncate_until(floor.min(object_tail)) {
            tracing::warn!(error = %e, "could not release object log prefix");
        }
    }

    /// Note that the record at `address` references the object at `object`.
    #[inline]
    pub(crate) fn note_object(&self, address: Address, object: u64) {
        self.frames.note_object(address.page(self.page_bits), object);
    }

    /// Lowest object address referenced from a record at or above `begin`; `u64::MAX`
    /// when none is. `None` when some of those records predate recovery.
    pub(crate) fn object_floor_from(&self, begin: Address) -> Option<u64> {
        let first = begin.page(self.page_bits);
        if first < self.object_floors_from.load(Ordering::Acquire) {
            return None;
        }
        let head_page = self.get_head_address().page(self.page_bits);
        let tail_page = self.get_tail_address().page(self.page_bits);
        let mut floor = u64::MAX;
        for page in first.max(head_page)..=tail_page {
            if let Some(page_floor) = self.frames.object_floor(page) {
                floor = floor.min(page_floor);
            }
        }
        // Read after the frames: a page evicted meanwhile has been recorded here.
        let floors = self.object_floors.lock();
        Some(floors.range(first..).map(|(_, f)| *f).fold(floor, u64::min))
    }

    /// Make the whole log read-only, flush it, and move the head to the tail.
    ///
    /// The calling thread must not be epoch protected. With `wait` the call returns only
    /// after every page below the tail has left memory.
    pub fn flush_and_evict(self: &Arc<Self>, wait: bool) -> std::io::Result<()> {
        self.flush_and_evict_until(self.get_tail_address(), wait)
    }

    /// Make `[.., until)` read-only, flush it, and move the head up to `until`.
    ///
    /// The calling thread must not be epoch protected.
    pub fn flush_and_evict_until(self: &Arc<Self>, until: Address, wait: bool) -> std::io::Result<()> {
        let until = until.min(self.get_tail_address());

        self.shift_read_only_address(until);
        self.wait_until(|| self.get_safe_read_only_address() >= until);
        self.flush_until(until)?;

        self.desired_head_address.monotonic_update(until);
        self.shift_head_address(until);
        if wait {
            self.wait_until(|| self.get_safe_head_address() >= until);
        }
        Ok(())
    }

    /// Spin, draining epoch actions, until `done` holds.
    pub(crate) fn wait_until(&self, done: impl Fn() -> bool) {
        while !done() {
            self.epoch.drain_pending();
            thread::yield_now();
        }
    }

    /// Get log statistics
    pub fn get_stats(&self) -> LogStats {
        let tail = self.get_tail_address();
        let read_only = self.get_read_only_address();
        let head = self.get_head_address();
        let begin = self.get_begin_address();

        LogStats {
            tail_address: tail,
            read_only_address: read_only,
            safe_read_only_address: self.get_safe_read_only_address(),
            head_address: head,
            safe_head_address: self.get_safe_head_address(),
            begin_address: begin,
            flushed_until_address: self.get_flushed_until_address(),
            resident_pages: self.frames.resident(),
            mutable_bytes: tail.control().saturating_sub(read_only.control()),
            read_only_bytes: read_only.control().saturating_sub(head.control()),
            on_disk_bytes: head.control().saturating_sub(begin.control()),
        }
    }
}

mod checkpoint;
mod flush;

/// Statistics about the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStats {
    /// Tail address
    pub tail_address: Address,
    /// Read-only boundary
    pub read_only_address: Address,
    /// Read-only boundary every thread has observed
    pub safe_read_only_address: Address,
    /// Head address
    pub head_address: Address,
    /// Head address every thread has observed
    pub safe_head_address: Address,
    /// Begin address
    pub begin_address: Address,
    /// Everything below this is on the device
    pub flushed_until_address: Address,
    /// Page frames holding a page
    pub resident_pages: usize,
    /// Bytes in mutable region
    pub mutable_bytes: u64,
    /// Bytes in read-only region
    pub read_only_bytes: u64,
    /// Bytes on disk
    pub on_disk_bytes: u64,
}

impl std::fmt::Display for LogStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Log Statistics:")?;
        writeln!(f, "  Tail: {}", self.tail_address)?;
        writeln!(f, "  Read-only: {} (safe {})", self.read_only_address, self.safe_read_only_address)?;
        writeln!(f, "  Head: {} (safe {})", self.head_address, self.safe_head_address)?;
        writeln!(f, "  Begin: {}", self.begin_address)?;
        writeln!(f, "  Flushed until: {}", self.flushed_until_address)?;
        writeln!(f, "  Resident pages: {}", self.resident_pages)?;
        writeln!(f, "  Mutable bytes: {}", self.mutable_bytes)?;
        writeln!(f, "  Read-only bytes: {}", self.read_only_bytes)?;
        writeln!(f, "  On-disk bytes: {}", self.on_disk_bytes)
    }
}

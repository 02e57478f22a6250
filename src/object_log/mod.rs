//! Object log for variable-size values
//!
//! Values whose codec is not fixed-size are appended here and the hybrid log record
//! stores only an [`ObjectRef`]. The object log is byte addressed and append only; an
//! object may span pages. Objects never change once written, so pages need no epoch
//! protection: readers copy bytes out under a read lock and fall back to the device once
//! a page has been evicted.
//!
//! ```text
//!  begin            head          flushed_until          tail
//!    |-- on device ---|--- resident, durable --|-- resident --|
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::allocator::PAGE_ALIGNMENT;
use crate::device::{read_exact_at, write_all_at, StorageDevice};
use crate::record::ObjectRef;
use crate::status::Status;
use crate::utility::AlignedBuffer;

/// Configuration for the object log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLogConfig {
    /// log2 of the page size
    pub page_size_bits: u32,
    /// Flushed pages kept in memory before eviction
    pub memory_pages: u32,
}

impl Default for ObjectLogConfig {
    fn default() -> Self {
        Self {
            page_size_bits: 20,
            memory_pages: 16,
        }
    }
}

/// Append-only heap for large values.
pub struct ObjectLog {
    device: Arc<dyn StorageDevice>,
    page_bits: u32,
    memory_pages: usize,

    tail: AtomicU64,
    begin: AtomicU64,
    head: AtomicU64,
    flushed_until: AtomicU64,

    pages: RwLock<BTreeMap<u64, Arc<AlignedBuffer>>>,
    flush_lock: Mutex<()>,
}

impl ObjectLog {
    /// Create an empty object log on `device`.
    pub fn new(config: ObjectLogConfig, device: Arc<dyn StorageDevice>) -> Result<Self, Status> {
        if !(9..=30).contains(&config.page_size_bits) || config.memory_pages == 0 {
            return Err(Status::InvalidArgument);
        }
        Ok(Self {
            device,
            page_bits: config.page_size_bits,
            memory_pages: config.memory_pages as usize,
            tail: AtomicU64::new(0),
            begin: AtomicU64::new(0),
            head: AtomicU64::new(0),
            flushed_until: AtomicU64::new(0),
            pages: RwLock::new(BTreeMap::new()),
            flush_lock: Mutex::new(()),
        })
    }

    #[inline]
    fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    /// Next address to be handed out.
    pub fn get_tail_address(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Everything below this has been written to the device.
    pub fn get_flushed_until_address(&self) -> u64 {
        self.flushed_until.load(Ordering::Acquire)
    }

    /// Lowest resident address.
    pub fn get_head_address(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Objects below this are no longer reachable.
    pub fn get_begin_address(&self) -> u64 {
        self.begin.load(Ordering::Acquire)
    }

    fn page(&self, page: u64) -> Result<Arc<AlignedBuffer>, Status> {
        if let Some(buffer) = self.pages.read().get(&page) {
            return Ok(Arc::clone(buffer));
        }
        let mut pages = self.pages.write();
        if let Some(buffer) = pages.get(&page) {
            return Ok(Arc::clone(buffer));
        }
        let buffer = AlignedBuffer::zeroed(PAGE_ALIGNMENT, self.page_size() as usize)
            .map(Arc::new)
            .ok_or(Status::OutOfMemory)?;
        pages.insert(page, Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Append `bytes` and return a reference to them.
    pub fn store(&self, bytes: &[u8]) -> Result<ObjectRef, Status> {
        let len = u32::try_from(bytes.len()).map_err(|_| Status::InvalidArgument)?;
        let start = self.tail.fetch_add(len as u64, Ordering::AcqRel);
        self.copy_in(start, bytes)?;
        Ok(ObjectRef {
            address: start,
            len,
        })
    }

    fn copy_in(&self, start: u64, bytes: &[u8]) -> Result<(), Status> {
        let page_size = self.page_size();
        let mut written = 0usize;
        while written < bytes.len() {
            let address = start + written as u64;
            let offset = (address & (page_size - 1)) as usize;
            let chunk = (page_size as usize - offset).min(bytes.len() - written);
            let buffer = self.page(address >> self.page_bits)?;
            // SAFETY: the range was reserved by this call's `fetch_add` and is not yet
            // visible to any reader.
            unsafe { buffer.write_at(offset, &bytes[written..written + chunk]) };
            written += chunk;
        }
        Ok(())
    }

    /// Copy the object `object` out, from memory when resident and the device otherwise.
    pub fn load(&self, object: ObjectRef) -> Result<Vec<u8>, Status> {
        let end = object.address + object.len as u64;
        if end > self.get_tail_address() {
            return Err(Status::Corruption);
        }
        if object.address < self.get_begin_address() {
            return Err(Status::NotFound);
        }

        let page_size = self.page_size();
        let mut out = vec![0u8; object.len as usize];
        let mut read = 0usize;
        while read < out.len() {
            let address = object.address + read as u64;
            let offset = (address & (page_size - 1)) as usize;
            let chunk = (page_size as usize - offset).min(out.len() - read);
            // Below the head a resident page may be a recovered tail page whose prefix was
            // never loaded.
            let resident = if address >= self.get_head_address() {
                self.pages.read().get(&(address >> self.page_bits)).cloned()
            } else {
                None
            };
            match resident {
                Some(buffer) => {
                    // SAFETY: objects are immutable once stored and the buffer is kept
                    // alive by the cloned `Arc`.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            buffer.as_ptr().add(offset),
                            out[read..].as_mut_ptr(),
                            chunk,
                        );
                    }
                }
                None => read_exact_at(self.device.as_ref(), address, &mut out[read..read + chunk])?,
            }
            read += chunk;
        }
        Ok(out)
    }

    /// Write `[flushed_until, until)` to the device, then evict flushed pages beyond the
    /// memory budget.
    ///
    /// Every object below `until` must be completely stored.
    pub fn flush_until(&self, until: u64) -> io::Result<()> {
        let _flushing = self.flush_lock.lock();
        let until = until.min(self.get_tail_address());
        // Objects below the begin address are dead; their device range may be released.
        let from = self.get_flushed_until_address().max(self.get_begin_address());
        if until > from {
            let page_size = self.page_size();
            let mut address = from;
            while address < until {
                let offset = (address & (page_size - 1)) as usize;
                let chunk = (page_size - offset as u64).min(until - address) as usize;
                let buffer = self
                    .pages
                    .read()
                    .get(&(address >> self.page_bits))
                    .cloned()
                    .ok_or_else(|| io::Error::other(format!("object page at {address} missing")))?;
                // SAFETY: bytes below `until` are fully stored and never change.
                let bytes = unsafe { std::slice::from_raw_parts(buffer.as_ptr().add(offset), chunk) };
                write_all_at(self.device.as_ref(), address, bytes)?;
                address += chunk as u64;
            }
            crate::device::block_on_io(self.device.flush())?;
            self.flushed_until.fetch_max(until, Ordering::AcqRel);
            tracing::debug!(from, until, "flushed object log");
        }

        let resident = self.pages.read().len();
        if resident > self.memory_pages {
            self.evict_until(self.get_flushed_until_address());
        }
        Ok(())
    }

    /// Drop resident pages that lie entirely below `address` and the flushed boundary.
    pub fn evict_until(&self, address: u64) -> usize {
        let limit = address.min(self.get_flushed_until_address());
        let limit_page = limit >> self.page_bits;
        let mut pages = self.pages.write();
        let keep = pages.split_off(&limit_page);
        let evicted = std::mem::replace(&mut *pages, keep).len();
        if evicted > 0 {
            self.head.fetch_max(limit_page << self.page_bits, Ordering::AcqRel);
            tracing::debug!(head = limit_page << self.page_bits, pages = evicted, "evicted object pages");
        }
        evicted
    }

    /// Mark objects below `address` unreachable.
    pub fn shift_begin_address(&self, address: u64) -> bool {
        let address = address.min(self.get_tail_address());
        self.begin.fetch_max(address, Ordering::AcqRel) < address
    }

    /// Drop objects below `address`: advance the begin address, evict the flushed pages
    /// below it and release the device prefix before its page.
    pub fn truncate_until(&self, address: u64) -> io::Result<bool> {
        if !self.shift_begin_address(address) {
            return Ok(false);
        }
        let begin = self.get_begin_address();
        self.evict_until(begin);
        let keep_from = begin & !(self.page_size() - 1);
        crate::device::block_on_io(self.device.truncate_prefix(keep_from))?;
        tracing::debug!(begin, "truncated object log");
        Ok(true)
    }

    /// Reset a fresh object log to a recovered tail; everything below is on the device.
    pub fn recover_to(&self, tail: u64) {
        self.pages.write().clear();
        self.tail.store(tail, Ordering::Release);
        self.flushed_until.store(tail, Ordering::Release);
        self.head.store(tail, Ordering::Release);
    }

    /// Snapshot of the watermarks.
    pub fn stats(&self) -> ObjectLogStats {
        ObjectLogStats {
            begin_address: self.get_begin_address(),
            head_address: self.get_head_address(),
            flushed_until_address: self.get_flushed_until_address(),
            tail_address: self.get_tail_address(),
            resident_pages: self.pages.read().len(),
        }
    }
}

/// Object log watermarks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLogStats {
    /// Begin address
    pub begin_address: u64,
    /// Lowest resident address
    pub head_address: u64,
    /// Everything below is durable
    pub flushed_until_address: u64,
    /// Tail address
    pub tail_address: u64,
    /// Pages held in memory
    pub resident_pages: usize,
}

impl fmt::Display for ObjectLogStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Object Log Statistics:")?;
        writeln!(f, "  Tail: {}", self.tail_address)?;
        writeln!(f, "  Flushed until: {}", self.flushed_until_address)?;
        writeln!(f, "  Head: {}", self.head_address)?;
        writeln!(f, "  Begin: {}", self.begin_address)?;
        writeln!(f, "  Resident pages: {}", self.resident_pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FileSystemDisk, NullDisk};
    use tempfile::tempdir;

    fn small_config() -> ObjectLogConfig {
        ObjectLogConfig {
            page_size_bits: 12,
            memory_pages: 2,
        }
    }

    #[test]
    fn test_store_and_load_in_memory() {
        let log = ObjectLog::new(small_config(), Arc::new(NullDisk::new())).unwrap();
        let a = log.store(b"first").unwrap();
        let b = log.store(&[9u8; 100]).unwrap();
        assert_eq!(a, ObjectRef { address: 0, len: 5 });
        assert_eq!(b.address, 5);
        assert_eq!(log.load(a).unwrap(), b"first");
        assert_eq!(log.load(b).unwrap(), vec![9u8; 100]);
    }

    #[test]
    fn test_object_spanning_pages() {
        let log = ObjectLog::new(small_config(), Arc::new(NullDisk::new())).unwrap();
        let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        log.store(b"pad").unwrap();
        let r = log.store(&big).unwrap();
        assert_eq!(log.load(r).unwrap(), big);
        assert!(log.stats().resident_pages >= 3);
    }

    #[test]
    fn test_evicted_objects_read_from_device() {
        let dir = tempdir().unwrap();
        let device = Arc::new(FileSystemDisk::single_file(dir.path().join("obj.log")).unwrap());
        let config = ObjectLogConfig {
            memory_pages: 16,
            ..small_config()
        };
        let log = ObjectLog::new(config, device).unwrap();

        let refs: Vec<ObjectRef> = (0..8u8).map(|i| log.store(&[i; 3000]).unwrap()).collect();
        log.flush_until(log.get_tail_address()).unwrap();
        // Within the memory budget nothing leaves on flush.
        assert_eq!(log.get_head_address(), 0);
        let evicted = log.evict_until(log.get_tail_address());
        assert!(evicted > 0);
        assert!(log.get_head_address() > 0);

        for (i, r) in refs.iter().enumerate() {
            assert_eq!(log.load(*r).unwrap(), vec![i as u8; 3000]);
        }
    }

    #[test]
    fn test_evict_never_passes_flushed() {
        let log = ObjectLog::new(small_config(), Arc::new(NullDisk::new())).unwrap();
        log.store(&[1u8; 9000]).unwrap();
        assert_eq!(log.evict_until(u64::MAX), 0);
        assert_eq!(log.get_head_address(), 0);
    }

    #[test]
    fn test_load_rejects_bad_references() {
        let log = ObjectLog::new(small_config(), Arc::new(NullDisk::new())).unwrap();
        let r = log.store(b"abc").unwrap();
        assert_eq!(
            log.load(ObjectRef { address: 2, len: 10 }),
            Err(Status::Corruption)
        );
        assert!(log.shift_begin_address(3));
        assert_eq!(log.load(r), Err(Status::NotFound));
    }

    #[test]
    fn test_recover_to_reads_device() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("obj.log");
        let stored = {
            let log = ObjectLog::new(small_config(), Arc::new(FileSystemDisk::single_file(&path).unwrap())).unwrap();
            let r = log.store(b"durable object").unwrap();
            log.flush_until(log.get_tail_address()).unwrap();
            r
        };

        let log = ObjectLog::new(small_config(), Arc::new(FileSystemDisk::single_file(&path).unwrap())).unwrap();
        log.recover_to(stored.address + stored.len as u64);
        assert_eq!(log.load(stored).unwrap(), b"durable object");
        let next = log.store(b"x").unwrap();
        assert_eq!(next.address, stored.address + stored.len as u64);
        // The tail page is resident again; its recovered prefix still comes from the device.
        assert_eq!(log.load(stored).unwrap(), b"durable object");
        assert_eq!(log.load(next).unwrap(), b"x");
        assert!(log.stats().to_string().contains("Tail: 15"));
    }

    #[test]
    fn test_truncate_until_releases_segments() {
        let dir = tempdir().unwrap();
        let device = Arc::new(FileSystemDisk::segmented(dir.path(), "objects", 4096).unwrap());
        let log = ObjectLog::new(small_config(), device).unwrap();

        let refs: Vec<ObjectRef> = (0..8u8).map(|i| log.store(&[i; 3000]).unwrap()).collect();
        log.flush_until(log.get_tail_address()).unwrap();
        assert!(std::fs::metadata(dir.path().join("objects.0")).is_ok());

        assert!(log.truncate_until(refs[5].address).unwrap());
        assert!(!log.truncate_until(refs[2].address).unwrap());
        assert_eq!(log.get_begin_address(), refs[5].address);
        assert!(std::fs::metadata(dir.path().join("objects.0")).is_err());
        assert_eq!(log.load(refs[1]), Err(Status::NotFound));
        for (i, r) in refs.iter().enumerate().skip(5) {
            assert_eq!(log.load(*r).unwrap(), vec![i as u8; 3000]);
        }

        // Later objects still flush past the released prefix.
        let late = log.store(b"late").unwrap();
        log.flush_until(log.get_tail_address()).unwrap();
        log.evict_until(log.get_tail_address());
        assert_eq!(log.load(late).unwrap(), b"late");
    }
}

//! Shared test utilities: store builders, fault injection and file corruption.

#![allow(dead_code)]

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};

use hybridkv::device::{FileSystemDisk, StorageDevice, SyncStorageDevice};
use hybridkv::store::{FasterKv, FasterKvConfig};

/// Install a tracing subscriber once; filtered by `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Small-page configuration whose checkpoints land in `dir/checkpoints`.
pub fn small_config(dir: &Path) -> FasterKvConfig {
    FasterKvConfig::new(1 << 10, 1 << 20)
        .with_page_size_bits(12)
        .with_checkpoint_dir(dir.join("checkpoints"))
}

/// Log device file under `dir`.
pub fn log_device(dir: &Path) -> FileSystemDisk {
    FileSystemDisk::single_file(dir.join("hlog.dat")).unwrap()
}

/// Object log device file under `dir`.
pub fn object_device(dir: &Path) -> Arc<dyn StorageDevice> {
    Arc::new(FileSystemDisk::single_file(dir.join("objects.dat")).unwrap())
}

/// Store of `u64` keys and values over a file in `dir`.
pub fn u64_store(dir: &Path, config: FasterKvConfig) -> Arc<FasterKv<u64, u64, FileSystemDisk>> {
    init_tracing();
    Arc::new(FasterKv::new(config, log_device(dir)).unwrap())
}

/// A fault-injection wrapper around any `SyncStorageDevice`.
///
/// Writes and reads can be made to fail until cleared. A failure has to persist across
/// the store's own retries, which happen inside epoch actions.
pub struct FaultInjectionDevice<D> {
    inner: D,
    /// Total number of write_sync calls observed so far.
    write_count: AtomicU64,
    /// When true, every write returns an error.
    fail_writes: AtomicBool,
    /// When true, every read returns an error.
    fail_reads: AtomicBool,
}

impl<D: SyncStorageDevice> FaultInjectionDevice<D> {
    /// Wrap an existing device for fault injection.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            write_count: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Make writes fail until called again with `false`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make reads fail until called again with `false`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Return the total number of write_sync calls observed.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }
}

impl<D: SyncStorageDevice> SyncStorageDevice for FaultInjectionDevice<D> {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other(format!("injected read error at {offset}")));
        }
        self.inner.read_sync(offset, buf)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other(format!(
                "injected write error at operation {n}"
            )));
        }
        self.inner.write_sync(offset, buf)
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.inner.flush_sync()
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.inner.truncate_sync(size)
    }

    fn truncate_prefix_sync(&self, offset: u64) -> io::Result<()> {
        self.inner.truncate_prefix_sync(offset)
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.inner.size_sync()
    }
}

// ---------------------------------------------------------------------------
// File corruption utilities
// ---------------------------------------------------------------------------

/// Flip one bit at the given byte offset in a file.
pub fn corrupt_byte_at(path: &Path, offset: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut byte = [0u8];
    file.read_exact(&mut byte)?;
    byte[0] ^= 0x01; // flip lowest bit
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()?;
    Ok(())
}

/// Truncate a file to `new_len` bytes.
pub fn truncate_to(path: &Path, new_len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(new_len)?;
    file.sync_all()?;
    Ok(())
}

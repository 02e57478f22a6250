//! Null storage device
//!
//! Discards writes and reads back zeros. A store backed by it behaves as a purely
//! in-memory store: anything evicted below the head address is gone.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::SyncStorageDevice;

/// Device that discards all writes.
#[derive(Debug, Default)]
pub struct NullDisk {
    /// Highest offset ever written, reported as the device size.
    size: AtomicU64,
}

impl NullDisk {
    /// Create a new null disk.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStorageDevice for NullDisk {
    fn read_sync(&self, _offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.size
            .fetch_max(offset + buf.len() as u64, Ordering::AcqRel);
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        Ok(self.size.load(Ordering::Acquire))
    }
}

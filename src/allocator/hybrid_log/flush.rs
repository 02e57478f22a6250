use std::io;
use std::sync::atomic::Ordering;

use crate::address::Address;
use crate::device::{read_exact_at, write_all_at, StorageDevice};
use crate::record::{record_size, RecordView, RECORD_HEADER_SIZE};
use crate::status::Status;

use super::HybridLog;

impl<D: StorageDevice> HybridLog<D> {
    /// Flush the log up to (but not including) `until_address`.
    ///
    /// Only the safe read-only region is flushed; a larger target is clamped. The object
    /// log is flushed first so that no record on the device references a payload that is
    /// not. A failed flush leaves the flushed-until address where it was.
    pub fn flush_until(&self, until_address: Address) -> io::Result<()> {
        let until_address = until_address.min(self.get_safe_read_only_address());
        let _flushing = self.flush_lock.lock();

        let from = self.get_flushed_until_address();
        if until_address <= from {
            return Ok(());
        }

        let result = self.write_range(from, until_address);
        match &result {
            Ok(()) => {
                self.flushed_until_address.monotonic_update(until_address);
                *self.last_flush_error.lock() = None;
                tracing::debug!(from = %from, until = %until_address, "flushed log");
            }
            Err(e) => {
                *self.last_flush_error.lock() = Some(e.kind());
                tracing::warn!(from = %from, until = %until_address, error = %e, "log flush failed");
            }
        }
        result
    }

    fn write_range(&self, from: Address, until: Address) -> io::Result<()> {
        if let Some(object_log) = &self.object_log {
            object_log.flush_until(self.object_flush_target.load(Ordering::Acquire))?;
        }

        let page_size = self.page_size();
        for page in from.page(self.page_bits)..=until.page(self.page_bits) {
            let page_start = Address::from_page(page, 0, self.page_bits);
            let start = from.max(page_start);
            let end = until.min(page_start + page_size);
            if end <= start {
                continue;
            }
            let base = self.frames.page_ptr(page).ok_or_else(|| {
                io::Error::other(format!("page {page} is not resident during flush"))
            })?;
            let offset = start.offset(self.page_bits) as usize;
            let len = (end - start) as usize;
            // SAFETY: `[start, end)` lies below the safe read-only address, so no thread
            // writes to it, and the page cannot be evicted before it is flushed.
            let bytes = unsafe { std::slice::from_raw_parts(base.add(offset), len) };
            write_all_at(self.device.as_ref(), start.control(), bytes)?;
        }
        crate::device::block_on_io(self.device.flush())
    }

    /// Read the raw bytes of the record at a stable `address` from the device.
    ///
    /// Returns `Ok(None)` when the device holds no record there (a zero header).
    pub fn read_record_from_device(&self, address: Address) -> Result<Option<Vec<u8>>, Status> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        read_exact_at(self.device.as_ref(), address.control(), &mut header)?;
        let Some((_, key_len, value_len)) = RecordView::parse_header(&header) else {
            return Ok(None);
        };
        let size = record_size(key_len, value_len);
        if size as u64 > self.page_size() {
            return Err(Status::Corruption);
        }

        let mut bytes = vec![0u8; size];
        read_exact_at(self.device.as_ref(), address.control(), &mut bytes)?;
        Ok(Some(bytes))
    }
}

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::address::{Address, PageOffset};
use crate::allocator::page_allocator::OpenOutcome;
use crate::checkpoint::{sidecar, write_atomic, CheckpointError, CheckpointType, LogMetadata};
use crate::device::{read_exact_at, write_all_at, StorageDevice};
use crate::epoch::EpochGuard;
use crate::record::{Record, RecordInfo, RecordView, RECORD_HEADER_SIZE};
use crate::status::Status;

use super::{HybridLog, LOG_START_ADDRESS};

const SNAPSHOT_END: u64 = u64::MAX;

impl<D: StorageDevice> HybridLog<D> {
    /// Write pages `[start page, final_address)` to a snapshot file.
    ///
    /// Pages still in memory are copied under `guard`; pages evicted meanwhile are read
    /// back from the device. Bytes at or above `final_address` are written as zeros. A
    /// sidecar `.crc` file holds one checksum per page.
    pub fn write_log_snapshot(
        &self,
        path: &Path,
        start: Address,
        final_address: Address,
        guard: &EpochGuard<'_>,
    ) -> io::Result<u64> {
        let page_size = self.page_size();
        let mut checksums = Vec::new();

        write_atomic(path, |writer| {
            writer.write_all(&start.control().to_le_bytes())?;
            writer.write_all(&final_address.control().to_le_bytes())?;
            writer.write_all(&page_size.to_le_bytes())?;

            if final_address > start {
                for page in start.page(self.page_bits)..=final_address.page(self.page_bits) {
                    let bytes = self.copy_page(page, final_address)?;
                    writer.write_all(&page.to_le_bytes())?;
                    writer.write_all(&bytes)?;
                    checksums.push((page, sidecar::checksum(&bytes)));
                    guard.refresh();
                }
            }
            writer.write_all(&SNAPSHOT_END.to_le_bytes())
        })?;
        sidecar::write_snapshot_checksums(path, &checksums)?;
        Ok(checksums.len() as u64)
    }

    /// Copy of `page` truncated at `final_address`. The caller is epoch protected.
    fn copy_page(&self, page: u64, final_address: Address) -> io::Result<Vec<u8>> {
        let page_size = self.page_size();
        let page_start = Address::from_page(page, 0, self.page_bits);
        let valid = self.valid_bytes(page, final_address);
        let mut bytes = vec![0u8; page_size as usize];

        if page_start + page_size > self.get_head_address() {
            if let Some(base) = self.frames.page_ptr(page) {
                // SAFETY: the page extends above the head, so it stays resident while the
                // caller's epoch is protected.
                let src = unsafe { std::slice::from_raw_parts(base, valid) };
                bytes[..valid].copy_from_slice(src);
                return Ok(bytes);
            }
        }
        self.read_page_prefix(page, &mut bytes[..valid])?;
        Ok(bytes)
    }

    /// Fill `buf` from the start of `page` on the device. The bytes below the log start
    /// address were never written and stay zero.
    fn read_page_prefix(&self, page: u64, buf: &mut [u8]) -> io::Result<()> {
        let page_start = Address::from_page(page, 0, self.page_bits).control();
        let skip = (LOG_START_ADDRESS.saturating_sub(page_start) as usize).min(buf.len());
        read_exact_at(self.device.as_ref(), page_start + skip as u64, &mut buf[skip..])
    }

    /// Restore the log of a fresh store to the cut described by `meta`.
    ///
    /// Pages from the head page through the final page are made resident, from
    /// `snapshot` for a Snapshot checkpoint or from the device for a FoldOver one.
    /// Snapshot pages are written back to the device so everything below the final
    /// address is durable afterwards.
    pub fn restore(&self, meta: &LogMetadata, snapshot: Option<&Path>) -> Result<(), CheckpointError> {
        if meta.page_size_bits != self.page_bits {
            return Err(CheckpointError::Incompatible(format!(
                "checkpoint page size 2^{} differs from configured 2^{}",
                meta.page_size_bits, self.page_bits
            )));
        }
        let final_address = meta.final_address;
        if final_address.control() < LOG_START_ADDRESS {
            return Err(CheckpointError::Incompatible(format!(
                "final address {final_address} below log start"
            )));
        }

        let final_page = final_address.page(self.page_bits);
        let frames = self.frames.count();
        let lowest_head = Address::from_page((final_page + 1).saturating_sub(frames), 0, self.page_bits);
        let head = meta
            .head_address
            .max(lowest_head)
            .max(Address::new(LOG_START_ADDRESS))
            .min(final_address);
        let head_page = head.page(self.page_bits);

        self.frames.close(0);
        for page in head_page..=final_page {
            if self.frames.open(page)? != OpenOutcome::Ready {
                return Err(CheckpointError::Status(Status::OutOfMemory));
            }
        }

        match (meta.checkpoint_type, snapshot) {
            (CheckpointType::Snapshot, Some(path)) => {
                self.load_snapshot(path, head_page, final_address)?;
            }
            (CheckpointType::Snapshot, None) => {
                return Err(CheckpointError::InvalidState("snapshot checkpoint without snapshot file"));
            }
            (CheckpointType::FoldOver, _) => {
                for page in head_page..=final_page {
                    self.load_page_from_device(page, final_address)?;
                }
            }
        }
        self.clear_record_locks(head_page, final_address);

        let begin = meta.begin_address.max(Address::new(LOG_START_ADDRESS));
        self.begin_address.store(begin, Ordering::Release);
        self.head_address.store(head, Ordering::Release);
        self.safe_head_address.store(head, Ordering::Release);
        self.desired_head_address.store(head, Ordering::Release);
        self.read_only_address.store(final_address, Ordering::Release);
        self.safe_read_only_address.store(final_address, Ordering::Release);
        self.flushed_until_address.store(final_address, Ordering::Release);
        self.object_flush_target
            .store(meta.object_log_tail.unwrap_or(0), Ordering::Release);
        // Object references of restored records are not tracked.
        self.object_floors.lock().clear();
        self.object_floors_from.store(final_page + 1, Ordering::Release);
        self.tail.store(
            PageOffset::from_address(final_address, self.page_bits),
            Ordering::Release,
        );

        tracing::debug!(
            begin = %begin,
            head = %head,
            tail = %final_address,
            "restored log watermarks"
        );
        Ok(())
    }

    fn frame_ptr(&self, page: u64) -> Result<*mut u8, CheckpointError> {
        self.frames
            .page_ptr(page)
            .ok_or(CheckpointError::Status(Status::OutOfMemory))
    }

    fn valid_bytes(&self, page: u64, final_address: Address) -> usize {
        let page_start = Address::from_page(page, 0, self.page_bits);
        final_address
            .control()
            .saturating_sub(page_start.control())
            .min(self.page_size()) as usize
    }

    fn load_page_from_device(&self, page: u64, final_address: Address) -> Result<(), CheckpointError> {
        let valid = self.valid_bytes(page, final_address);
        let base = self.frame_ptr(page)?;
        // SAFETY: recovery runs before the store is shared, so nothing else touches the
        // frame.
        let frame = unsafe { std::slice::from_raw_parts_mut(base, valid) };
        self.read_page_prefix(page, frame)?;
        Ok(())
    }

    /// Load snapshot pages at or above `head_page`. Pages the snapshot does not cover
    /// come from the device.
    fn load_snapshot(
        &self,
        path: &Path,
        head_page: u64,
        final_address: Address,
    ) -> Result<(), CheckpointError> {
        let checksums = sidecar::read_snapshot_checksums(path)?;
        let corrupt = || CheckpointError::ChecksumMismatch {
            path: path.to_path_buf(),
        };

        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CheckpointError::MissingArtifact {
                path: path.to_path_buf(),
            },
            _ => CheckpointError::Io(e),
        })?;
        let mut reader = BufReader::with_capacity(1 << 20, file);
        let mut word = [0u8; 8];
        let mut next_word = |reader: &mut BufReader<File>| -> Result<u64, CheckpointError> {
            reader.read_exact(&mut word).map_err(|_| corrupt())?;
            Ok(u64::from_le_bytes(word))
        };

        let _start = next_word(&mut reader)?;
        let snapshot_final = next_word(&mut reader)?;
        let page_size = next_word(&mut reader)?;
        if snapshot_final != final_address.control() || page_size != self.page_size() {
            return Err(CheckpointError::Incompatible(format!(
                "snapshot {} does not match log metadata",
                path.display()
            )));
        }

        let final_page = final_address.page(self.page_bits);
        let mut page_buf = vec![0u8; page_size as usize];
        let mut loaded = HashSet::new();
        loop {
            let page = next_word(&mut reader)?;
            if page == SNAPSHOT_END {
                break;
            }
            reader.read_exact(&mut page_buf).map_err(|_| corrupt())?;
            if checksums.get(&page) != Some(&sidecar::checksum(&page_buf)) {
                return Err(corrupt());
            }
            if page < head_page || page > final_page {
                continue;
            }
            let base = self.frame_ptr(page)?;
            // SAFETY: the frame holds `page_size` bytes and is not yet shared.
            unsafe { std::ptr::copy_nonoverlapping(page_buf.as_ptr(), base, page_buf.len()) };

            // The device may hold bytes written after the cut; overwrite them.
            let valid = self.valid_bytes(page, final_address);
            let offset = Address::from_page(page, 0, self.page_bits).control();
            write_all_at(self.device.as_ref(), offset, &page_buf[..valid])?;
            loaded.insert(page);
        }
        if loaded.len() != checksums.keys().filter(|&&p| p >= head_page && p <= final_page).count() {
            return Err(corrupt());
        }

        for page in head_page..=final_page {
            if !loaded.contains(&page) {
                self.load_page_from_device(page, final_address)?;
            }
        }
        crate::device::block_on_io(self.device.flush())?;
        Ok(())
    }

    /// Clear lock bits captured in loaded pages.
    fn clear_record_locks(&self, head_page: u64, final_address: Address) {
        let mut address = Address::from_page(head_page, 0, self.page_bits).max(Address::new(LOG_START_ADDRESS));
        while address < final_address {
            let Some(ptr) = self.get_mut_ptr(address) else {
                break;
            };
            if (self.page_size() - address.offset(self.page_bits)) < RECORD_HEADER_SIZE as u64 {
                address = Address::from_page(address.page(self.page_bits) + 1, 0, self.page_bits);
                continue;
            }
            // SAFETY: `address` is a record boundary inside a resident page.
            let record = unsafe { Record::from_ptr(ptr) };
            let info = record.info();
            if info.is_null() {
                address = Address::from_page(address.page(self.page_bits) + 1, 0, self.page_bits);
                continue;
            }
            if info.is_locked() {
                record.store_info(info.unlocked());
            }
            address += record.size() as u64;
        }
    }

    /// Walk the records in `[from, until)`, reading resident pages from memory and
    /// evicted ones from the device. Only for use before the store is shared.
    pub(crate) fn scan_records<F>(&self, from: Address, until: Address, mut visit: F) -> Result<(), Status>
    where
        F: FnMut(Address, RecordView<'_>) -> Result<(), Status>,
    {
        let page_size = self.page_size();
        let mut address = from.max(Address::new(LOG_START_ADDRESS));
        let next_page = |a: Address| Address::from_page(a.page(self.page_bits) + 1, 0, self.page_bits);

        while address < until {
            if page_size - address.offset(self.page_bits) < RECORD_HEADER_SIZE as u64 {
                address = next_page(address);
                continue;
            }
            let size = if address >= self.get_head_address() {
                let Some(ptr) = self.get_mut_ptr(address) else {
                    return Err(Status::Corruption);
                };
                let remaining = (page_size - address.offset(self.page_bits)) as usize;
                // SAFETY: the page is resident and unshared during recovery.
                let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, remaining) };
                match RecordView::parse(bytes)? {
                    Some(view) => {
                        let size = view.size;
                        visit(address, view)?;
                        size
                    }
                    None => {
                        address = next_page(address);
                        continue;
                    }
                }
            } else {
                match self.read_record_from_device(address)? {
                    Some(bytes) => match RecordView::parse(&bytes)? {
                        Some(view) => {
                            let size = view.size;
                            visit(address, view)?;
                            size
                        }
                        None => {
                            address = next_page(address);
                            continue;
                        }
                    },
                    None => {
                        address = next_page(address);
                        continue;
                    }
                }
            };
            address += size as u64;
        }
        Ok(())
    }

    /// Set the invalid bit of the record at `address`, in memory and on the device.
    /// Only for use before the store is shared.
    pub(crate) fn mark_invalid(&self, address: Address) -> Result<(), Status> {
        if address >= self.get_head_address() {
            if let Some(ptr) = self.get_mut_ptr(address) {
                // SAFETY: `address` is a record boundary reported by `scan_records`.
                unsafe { Record::from_ptr(ptr) }.set_invalid();
            }
        }
        if address < self.get_flushed_until_address() {
            let mut header = [0u8; 8];
            read_exact_at(self.device.as_ref(), address.control(), &mut header)?;
            let invalid = RecordInfo::from_control(u64::from_le_bytes(header)).with_invalid();
            write_all_at(self.device.as_ref(), address.control(), &invalid.control().to_le_bytes())?;
        }
        Ok(())
    }
}

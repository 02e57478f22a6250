//! Record layout in the hybrid log.
//!
//! Every record is laid out the same way, in memory and on disk:
//!
//! ```text
//! +------------+---------+-----------+-----------+-------------+---------+
//! | RecordInfo | key_len | value_len | key bytes | value bytes | padding |
//! |  8 bytes   |  u32    |   u32     |           |             | to 8    |
//! +------------+---------+-----------+-----------+-------------+---------+
//! ```
//!
//! For values routed to the object log, the value bytes are an [`ObjectRef`]. A zero
//! header marks the unused tail of a page.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::Backoff;

use crate::address::Address;
use crate::status::Status;
use crate::utility::pad_alignment;

/// Size of the record header (`RecordInfo` plus two length fields).
pub const RECORD_HEADER_SIZE: usize = 16;

/// Alignment of every record in the log.
pub const RECORD_ALIGNMENT: usize = 8;

/// Bits of the checkpoint version kept in a record.
pub const VERSION_BITS: u32 = 12;

/// Mask a store version down to what a record can hold.
#[inline]
pub const fn record_version(version: u32) -> u16 {
    (version as u64 & ((1 << VERSION_BITS) - 1)) as u16
}

/// Total on-log size of a record with the given key and value lengths.
#[inline]
pub const fn record_size(key_len: usize, value_len: usize) -> usize {
    pad_alignment(RECORD_HEADER_SIZE + key_len + value_len, RECORD_ALIGNMENT)
}

/// Snapshot of a record's control word.
///
/// - previous address: bits 0..48
/// - version: bits 48..60
/// - lock: bit 60
/// - invalid: bit 61
/// - tombstone: bit 62
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordInfo(u64);

impl RecordInfo {
    const PREV_ADDR_MASK: u64 = (1 << 48) - 1;
    const VERSION_SHIFT: u32 = 48;
    const VERSION_MASK: u64 = (1 << VERSION_BITS) - 1;
    const LOCK_BIT: u64 = 1 << 60;
    const INVALID_BIT: u64 = 1 << 61;
    const TOMBSTONE_BIT: u64 = 1 << 62;

    /// Build the header for a new record.
    pub fn new(previous_address: Address, version: u32, tombstone: bool) -> Self {
        let mut control = previous_address.control() & Self::PREV_ADDR_MASK;
        control |= (record_version(version) as u64) << Self::VERSION_SHIFT;
        if tombstone {
            control |= Self::TOMBSTONE_BIT;
        }
        Self(control)
    }

    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// True for the all-zero header that terminates a page.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn previous_address(&self) -> Address {
        Address::from_control(self.0 & Self::PREV_ADDR_MASK)
    }

    #[inline]
    pub const fn version(&self) -> u16 {
        ((self.0 >> Self::VERSION_SHIFT) & Self::VERSION_MASK) as u16
    }

    #[inline]
    pub const fn is_locked(&self) -> bool {
        self.0 & Self::LOCK_BIT != 0
    }

    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 & Self::INVALID_BIT != 0
    }

    #[inline]
    pub const fn is_tombstone(&self) -> bool {
        self.0 & Self::TOMBSTONE_BIT != 0
    }

    /// Same header with a different previous address.
    #[inline]
    pub const fn with_previous_address(self, address: Address) -> Self {
        Self((self.0 & !Self::PREV_ADDR_MASK) | (address.control() & Self::PREV_ADDR_MASK))
    }

    /// Same header with the lock bit cleared.
    #[inline]
    pub const fn unlocked(self) -> Self {
        Self(self.0 & !Self::LOCK_BIT)
    }

    #[inline]
    pub const fn with_invalid(self) -> Self {
        Self(self.0 | Self::INVALID_BIT)
    }
}

/// Record header as it sits in log memory.
#[repr(C)]
pub struct Record {
    info: AtomicU64,
    key_len: AtomicU32,
    value_len: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<Record>() == RECORD_HEADER_SIZE);

impl Record {
    /// View the record starting at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be 8-byte aligned and point at a record (or a zeroed header) inside a
    /// live page that stays allocated for `'a`.
    #[inline]
    pub unsafe fn from_ptr<'a>(ptr: *const u8) -> &'a Record {
        &*(ptr as *const Record)
    }

    /// Write a complete record at `ptr` and publish its header last.
    ///
    /// # Safety
    /// `ptr` must be 8-byte aligned with `record_size(key.len(), value.len())` writable bytes
    /// that no other thread can reach yet.
    pub unsafe fn write(ptr: *mut u8, info: RecordInfo, key: &[u8], value: &[u8]) {
        let payload = ptr.add(RECORD_HEADER_SIZE);
        std::ptr::copy_nonoverlapping(key.as_ptr(), payload, key.len());
        std::ptr::copy_nonoverlapping(value.as_ptr(), payload.add(key.len()), value.len());
        let record = Self::from_ptr(ptr);
        record.key_len.store(key.len() as u32, Ordering::Relaxed);
        record.value_len.store(value.len() as u32, Ordering::Relaxed);
        record.info.store(info.control(), Ordering::Release);
    }

    #[inline]
    pub fn info(&self) -> RecordInfo {
        RecordInfo(self.info.load(Ordering::Acquire))
    }

    #[inline]
    pub fn key_len(&self) -> usize {
        self.key_len.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn value_len(&self) -> usize {
        self.value_len.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        record_size(self.key_len(), self.value_len())
    }

    #[inline]
    fn payload_ptr(&self) -> *mut u8 {
        (self as *const Record as *mut u8).wrapping_add(RECORD_HEADER_SIZE)
    }

    /// Key bytes. Keys never change once a record is published.
    #[inline]
    pub fn key(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload_ptr(), self.key_len()) }
    }

    /// Copy the value out. Callers hold the record lock when the record is mutable.
    pub fn copy_value(&self) -> Vec<u8> {
        let len = self.value_len();
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.payload_ptr().add(self.key_len()),
                out.as_mut_ptr(),
                len,
            );
        }
        out
    }

    /// Overwrite the value in place. `value` must have the stored length and the caller
    /// must hold the record lock.
    pub fn overwrite_value(&self, value: &[u8]) -> Result<(), Status> {
        if value.len() != self.value_len() {
            return Err(Status::InvalidArgument);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                value.as_ptr(),
                self.payload_ptr().add(self.key_len()),
                value.len(),
            );
        }
        Ok(())
    }

    /// Try to take the record lock. Fails on invalid records.
    pub fn try_lock(&self) -> bool {
        let backoff = Backoff::new();
        loop {
            let current = self.info.load(Ordering::Acquire);
            let info = RecordInfo(current);
            if info.is_invalid() {
                return false;
            }
            if info.is_locked() {
                backoff.snooze();
                continue;
            }
            if self
                .info
                .compare_exchange_weak(
                    current,
                    current | RecordInfo::LOCK_BIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
            backoff.spin();
        }
    }

    pub fn unlock(&self) {
        self.info.fetch_and(!RecordInfo::LOCK_BIT, Ordering::Release);
    }

    /// Mark the record invalid so chain walks skip it.
    pub fn set_invalid(&self) {
        self.info.fetch_or(RecordInfo::INVALID_BIT, Ordering::AcqRel);
    }

    /// Replace the header wholesale. Only used while the record is unreachable or during
    /// single-threaded recovery.
    pub fn store_info(&self, info: RecordInfo) {
        self.info.store(info.control(), Ordering::Release);
    }
}

/// Record parsed out of a byte buffer (a page image or a disk read).
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub info: RecordInfo,
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub size: usize,
}

impl<'a> RecordView<'a> {
    /// Parse the record at the start of `bytes`.
    ///
    /// Returns `Ok(None)` at a zero header and `Corruption` when the lengths run past the
    /// buffer.
    pub fn parse(bytes: &'a [u8]) -> Result<Option<Self>, Status> {
        let (info, key_len, value_len) = match Self::parse_header(bytes) {
            Some(header) => header,
            None => return Ok(None),
        };
        let size = record_size(key_len, value_len);
        if size > bytes.len() {
            return Err(Status::Corruption);
        }
        let key_end = RECORD_HEADER_SIZE + key_len;
        Ok(Some(Self {
            info,
            key: &bytes[RECORD_HEADER_SIZE..key_end],
            value: &bytes[key_end..key_end + value_len],
            size,
        }))
    }

    /// Header fields, or `None` at a zero header or a buffer too short to hold one.
    pub fn parse_header(bytes: &[u8]) -> Option<(RecordInfo, usize, usize)> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return None;
        }
        let control = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        if control == 0 {
            return None;
        }
        let key_len = u32::from_le_bytes(bytes[8..12].try_into().ok()?) as usize;
        let value_len = u32::from_le_bytes(bytes[12..16].try_into().ok()?) as usize;
        Some((RecordInfo(control).unlocked(), key_len, value_len))
    }
}

/// Inline stand-in for a value stored in the object log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    /// Address of the value bytes in the object log.
    pub address: u64,
    /// Length of the value bytes.
    pub len: u32,
}

impl ObjectRef {
    /// Encoded size inside a record.
    pub const SIZE: usize = 12;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.address.to_le_bytes());
        out[8..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Status> {
        if bytes.len() != Self::SIZE {
            return Err(Status::Corruption);
        }
        let mut address = [0u8; 8];
        address.copy_from_slice(&bytes[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[8..]);
        Ok(Self {
            address: u64::from_le_bytes(address),
            len: u32::from_le_bytes(len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utility::AlignedBuffer;

    #[test]
    fn test_record_info_fields() {
        let info = RecordInfo::new(Address::new(4096), 4097, true);
        assert_eq!(info.previous_address(), Address::new(4096));
        assert_eq!(info.version(), 1);
        assert!(info.is_tombstone());
        assert!(!info.is_invalid());
        assert!(!info.is_null());

        let moved = info.with_previous_address(Address::INVALID);
        assert_eq!(moved.previous_address(), Address::INVALID);
        assert_eq!(moved.version(), 1);
    }

    #[test]
    fn test_record_size_is_aligned() {
        assert_eq!(record_size(8, 8), 32);
        assert_eq!(record_size(3, 0), 24);
        assert_eq!(record_size(0, 0), 16);
    }

    #[test]
    fn test_write_then_view() {
        let buf = AlignedBuffer::zeroed(64, 256).unwrap();
        let info = RecordInfo::new(Address::INVALID, 2, false);
        unsafe { Record::write(buf.as_mut_ptr(), info, b"key", b"value!") };

        let record = unsafe { Record::from_ptr(buf.as_ptr()) };
        assert_eq!(record.info(), info);
        assert_eq!(record.key(), b"key");
        assert_eq!(record.copy_value(), b"value!");
        assert_eq!(record.size(), record_size(3, 6));

        let bytes = unsafe { buf.as_slice() };
        let view = RecordView::parse(bytes).unwrap().unwrap();
        assert_eq!(view.key, b"key");
        assert_eq!(view.value, b"value!");
        assert_eq!(view.info, info);

        let next = &bytes[view.size..];
        assert!(RecordView::parse(next).unwrap().is_none());
    }

    #[test]
    fn test_lock_and_overwrite() {
        let buf = AlignedBuffer::zeroed(64, 64).unwrap();
        unsafe {
            Record::write(
                buf.as_mut_ptr(),
                RecordInfo::new(Address::INVALID, 0, false),
                &1u64.to_le_bytes(),
                &5u64.to_le_bytes(),
            )
        };
        let record = unsafe { Record::from_ptr(buf.as_ptr()) };
        assert!(record.try_lock());
        assert!(record.info().is_locked());
        record.overwrite_value(&9u64.to_le_bytes()).unwrap();
        assert_eq!(record.overwrite_value(&[1, 2]), Err(Status::InvalidArgument));
        record.unlock();
        assert!(!record.info().is_locked());
        assert_eq!(record.copy_value(), 9u64.to_le_bytes());

        record.set_invalid();
        assert!(!record.try_lock());
    }

    #[test]
    fn test_parse_rejects_overlong_lengths() {
        let mut bytes = vec![0u8; 32];
        bytes[..8].copy_from_slice(&RecordInfo::new(Address::INVALID, 0, false).control().to_le_bytes());
        bytes[8..12].copy_from_slice(&100u32.to_le_bytes());
        assert_eq!(RecordView::parse(&bytes).unwrap_err(), Status::Corruption);
    }

    #[test]
    fn test_object_ref_bytes() {
        let r = ObjectRef { address: 8192, len: 77 };
        assert_eq!(ObjectRef::from_bytes(&r.to_bytes()).unwrap(), r);
        assert!(ObjectRef::from_bytes(&[0u8; 4]).is_err());
    }
}

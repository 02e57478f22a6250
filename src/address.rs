//! Logical addresses into the hybrid log
//!
//! An [`Address`] is a 48-bit monotonically increasing offset into the log's logical
//! address space. The split between page number and in-page offset depends on the
//! configured page size, so page arithmetic always takes the page size in bits.
//! Addresses are never reused, which is what makes every CAS on an address ABA-free.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

/// A logical address in the hybrid log.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(u64);

impl Address {
    /// Placeholder for "no address".
    ///
    /// Set to 1 rather than 0 so that a zeroed hash bucket entry (empty slot) can be told
    /// apart from an entry whose chain terminates.
    pub const INVALID: Self = Self(1);

    /// Number of bits an address occupies.
    pub const ADDRESS_BITS: u32 = 48;

    /// Largest representable address.
    pub const MAX_ADDRESS: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// Create an address from a raw log offset.
    #[inline]
    pub const fn new(offset: u64) -> Self {
        Self(offset & Self::MAX_ADDRESS)
    }

    /// Create an address from its raw control value.
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control & Self::MAX_ADDRESS)
    }

    /// Create an address from a page number and an in-page offset.
    #[inline]
    pub const fn from_page(page: u64, offset: u64, page_bits: u32) -> Self {
        debug_assert!(offset < (1 << page_bits));
        Self((page << page_bits) | offset)
    }

    /// Raw control value.
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Page number for a log with `2^page_bits` byte pages.
    #[inline]
    pub const fn page(&self, page_bits: u32) -> u64 {
        self.0 >> page_bits
    }

    /// Offset within the page.
    #[inline]
    pub const fn offset(&self, page_bits: u32) -> u64 {
        self.0 & ((1 << page_bits) - 1)
    }

    /// First address of the page containing this address.
    #[inline]
    pub const fn page_start(&self, page_bits: u32) -> Self {
        Self(self.0 & !((1 << page_bits) - 1))
    }

    /// Check if this is the invalid placeholder.
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Check if this address can name a record.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        !self.is_invalid()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl PartialEq for Address {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, delta: u64) -> Self::Output {
        Self(self.0 + delta)
    }
}

impl AddAssign<u64> for Address {
    #[inline]
    fn add_assign(&mut self, delta: u64) {
        self.0 += delta;
    }
}

impl Sub for Address {
    type Output = u64;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self::from_control(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Atomic cell holding an [`Address`].
#[repr(transparent)]
pub struct AtomicAddress {
    control: AtomicU64,
}

impl AtomicAddress {
    /// Create a new atomic address.
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self {
            control: AtomicU64::new(address.0),
        }
    }

    /// Load the address.
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Address {
        Address(self.control.load(ordering))
    }

    /// Store an address.
    #[inline]
    pub fn store(&self, address: Address, ordering: AtomicOrdering) {
        self.control.store(address.0, ordering);
    }

    /// Compare and exchange.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Address, Address> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Raise the address to `target` if it is currently lower.
    ///
    /// Returns `Some(previous)` when this call moved the address, `None` when the
    /// current value was already at or beyond `target`.
    #[inline]
    pub fn monotonic_update(&self, target: Address) -> Option<Address> {
        let mut current = self.load(AtomicOrdering::Acquire);
        while current < target {
            match self.compare_exchange(
                current,
                target,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(prev) => return Some(prev),
                Err(actual) => current = actual,
            }
        }
        None
    }
}

impl Default for AtomicAddress {
    fn default() -> Self {
        Self::new(Address::default())
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicAddress")
            .field(&self.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

/// Page number and offset packed for the tail allocator.
///
/// The low 41 bits hold the offset so that concurrent reservations may run past the end
/// of a page without clobbering the page number; the top 23 bits hold the page.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOffset(u64);

impl PageOffset {
    const OFFSET_BITS: u32 = 41;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    /// Pack a page and offset.
    #[inline]
    pub const fn new(page: u64, offset: u64) -> Self {
        Self((page << Self::OFFSET_BITS) | (offset & Self::OFFSET_MASK))
    }

    /// Page number.
    #[inline]
    pub const fn page(&self) -> u64 {
        self.0 >> Self::OFFSET_BITS
    }

    /// Offset, which may exceed the page size after an overflowing reservation.
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    /// Convert to a log address, clamping an overflowed offset to the page end.
    #[inline]
    pub fn to_address(&self, page_bits: u32) -> Address {
        let page_size = 1u64 << page_bits;
        if self.offset() >= page_size {
            Address::from_page(self.page() + 1, 0, page_bits)
        } else {
            Address::from_page(self.page(), self.offset(), page_bits)
        }
    }

    /// Split a log address into page and offset.
    #[inline]
    pub const fn from_address(address: Address, page_bits: u32) -> Self {
        Self::new(address.page(page_bits), address.offset(page_bits))
    }
}

impl fmt::Debug for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageOffset")
            .field("page", &self.page())
            .field("offset", &self.offset())
            .finish()
    }
}

/// Tail cursor of the log: bump-reserves space and rolls to new pages.
pub struct AtomicPageOffset {
    control: AtomicU64,
}

impl AtomicPageOffset {
    /// Create a new cursor.
    #[inline]
    pub const fn new(page_offset: PageOffset) -> Self {
        Self {
            control: AtomicU64::new(page_offset.0),
        }
    }

    /// Load the cursor.
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> PageOffset {
        PageOffset(self.control.load(ordering))
    }

    /// Overwrite the cursor (recovery and initialization only).
    #[inline]
    pub fn store(&self, page_offset: PageOffset, ordering: AtomicOrdering) {
        self.control.store(page_offset.0, ordering);
    }

    /// Reserve `size` bytes in the current page.
    ///
    /// Returns the cursor before the reservation. The caller owns
    /// `[offset, offset + size)` only if that range fits in the page.
    #[inline]
    pub fn reserve(&self, size: u64) -> PageOffset {
        PageOffset(self.control.fetch_add(size, AtomicOrdering::AcqRel))
    }

    /// Advance from `old_page` to the next page.
    ///
    /// Returns `true` if this thread performed the move. A `false` return means some
    /// other thread already moved the cursor past `old_page`.
    #[inline]
    pub fn new_page(&self, old_page: u64) -> bool {
        let mut current = self.load(AtomicOrdering::Acquire);
        loop {
            if current.page() != old_page {
                return false;
            }
            let next = PageOffset::new(old_page + 1, 0);
            match self.control.compare_exchange(
                current.0,
                next.0,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = PageOffset(actual),
            }
        }
    }
}

impl fmt::Debug for AtomicPageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicPageOffset")
            .field(&self.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_page_split() {
        let addr = Address::from_page(10, 1000, 20);
        assert_eq!(addr.page(20), 10);
        assert_eq!(addr.offset(20), 1000);
        assert_eq!(addr.page_start(20), Address::from_page(10, 0, 20));
    }

    #[test]
    fn test_address_invalid() {
        assert!(Address::INVALID.is_invalid());
        assert!(Address::from_control(64).is_valid());
        assert!(Address::default().is_valid());
    }

    #[test]
    fn test_address_ordering_and_arithmetic() {
        let a1 = Address::from_page(1, 100, 12);
        let a2 = a1 + 50;
        let a3 = Address::from_page(2, 0, 12);

        assert!(a1 < a2);
        assert!(a2 < a3);
        assert_eq!(a2 - a1, 50);
    }

    #[test]
    fn test_from_control_masks_high_bits() {
        let addr = Address::from_control(u64::MAX);
        assert_eq!(addr.control(), Address::MAX_ADDRESS);
    }

    #[test]
    fn test_atomic_address_monotonic_update() {
        let atomic = AtomicAddress::new(Address::from_control(100));
        assert_eq!(
            atomic.monotonic_update(Address::from_control(200)),
            Some(Address::from_control(100))
        );
        assert_eq!(atomic.monotonic_update(Address::from_control(150)), None);
        assert_eq!(atomic.load(AtomicOrdering::Relaxed).control(), 200);
    }

    #[test]
    fn test_page_offset_reserve_overflow() {
        let page_bits = 12;
        let cursor = AtomicPageOffset::new(PageOffset::new(3, 4000));

        let prev = cursor.reserve(200);
        assert_eq!(prev.page(), 3);
        assert_eq!(prev.offset(), 4000);

        let now = cursor.load(AtomicOrdering::Relaxed);
        assert_eq!(now.offset(), 4200);
        // Overflowed cursor clamps to the start of the next page.
        assert_eq!(now.to_address(page_bits), Address::from_page(4, 0, page_bits));
    }

    #[test]
    fn test_new_page_only_once() {
        let cursor = AtomicPageOffset::new(PageOffset::new(0, 10));
        assert!(cursor.new_page(0));
        assert!(!cursor.new_page(0));
        assert_eq!(cursor.load(AtomicOrdering::Relaxed).page(), 1);
    }
}

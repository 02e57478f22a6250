//! Small helpers shared across the crate.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Check if a value is a power of two.
#[inline]
pub const fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Pad a size to the specified alignment.
#[inline]
pub const fn pad_alignment(size: usize, alignment: usize) -> usize {
    debug_assert!(is_power_of_two(alignment as u64));
    (size + alignment - 1) & !(alignment - 1)
}

/// Zeroed, aligned heap block used for log pages.
///
/// The block is shared between threads through raw pointers; synchronization of the
/// bytes themselves is the caller's job (epoch protection plus record lock bits).
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer. Returns `None` on a bad layout or allocation failure.
    pub fn zeroed(alignment: usize, size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, alignment).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, layout })
    }

    /// Base pointer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr() as *const u8
    }

    /// Base pointer for writes.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes.
    #[cfg(test)]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// View the whole buffer.
    ///
    /// # Safety
    /// No thread may be writing to the buffer for the lifetime of the slice.
    #[cfg(test)]
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size())
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// # Safety
    /// No other thread may access `[offset, offset + data.len())` concurrently.
    pub unsafe fn write_at(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.layout.size());
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was produced by alloc_zeroed with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: the buffer owns its allocation; concurrent access goes through raw pointers
// whose use is guarded by the epoch and record-lock protocol.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

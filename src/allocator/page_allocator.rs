//! Ring of page frames backing the in-memory part of a log.
//!
//! Logical page `p` lives in frame `p % frames`. A frame is either free or holds exactly
//! one page; its buffer is allocated when the page opens and released when the page is
//! evicted.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use crate::status::Status;
use crate::utility::AlignedBuffer;

/// Alignment of page buffers; matches a disk sector.
pub const PAGE_ALIGNMENT: usize = 4096;

const FREE: u64 = u64::MAX;
const OPENING: u64 = u64::MAX - 1;

struct PageFrame {
    /// Page held by the frame, `FREE` or `OPENING`.
    page: AtomicU64,
    data: AtomicPtr<u8>,
    owner: Mutex<Option<AlignedBuffer>>,
    /// Lowest object-log address referenced by a record on the page, `u64::MAX` if none.
    object_floor: AtomicU64,
}

impl PageFrame {
    fn new() -> Self {
        Self {
            page: AtomicU64::new(FREE),
            data: AtomicPtr::new(ptr::null_mut()),
            owner: Mutex::new(None),
            object_floor: AtomicU64::new(u64::MAX),
        }
    }
}

/// Outcome of [`PageFrames::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The page is resident (opened by this call or an earlier one).
    Ready,
    /// The frame still holds an older page that has not been evicted.
    Occupied,
}

/// Frames holding the resident pages of one log.
pub struct PageFrames {
    frames: Box<[PageFrame]>,
    page_size: usize,
}

impl PageFrames {
    /// `count` empty frames of `page_size` bytes each.
    pub fn new(count: usize, page_size: usize) -> Self {
        Self {
            frames: (0..count).map(|_| PageFrame::new()).collect(),
            page_size,
        }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.frames.len() as u64
    }

    #[inline]
    fn frame(&self, page: u64) -> &PageFrame {
        &self.frames[(page % self.count()) as usize]
    }

    /// Make `page` resident with a zeroed buffer.
    pub fn open(&self, page: u64) -> Result<OpenOutcome, Status> {
        let frame = self.frame(page);
        let backoff = Backoff::new();
        loop {
            match frame
                .page
                .compare_exchange(FREE, OPENING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let Some(buffer) = AlignedBuffer::zeroed(PAGE_ALIGNMENT, self.page_size) else {
                        frame.page.store(FREE, Ordering::Release);
                        return Err(Status::OutOfMemory);
                    };
                    frame.data.store(buffer.as_mut_ptr(), Ordering::Release);
                    *frame.owner.lock() = Some(buffer);
                    frame.object_floor.store(u64::MAX, Ordering::Release);
                    frame.page.store(page, Ordering::Release);
                    return Ok(OpenOutcome::Ready);
                }
                Err(OPENING) => backoff.snooze(),
                Err(held) if held == page => return Ok(OpenOutcome::Ready),
                Err(_) => return Ok(OpenOutcome::Occupied),
            }
        }
    }

    /// Release the frame holding `page`, if it does.
    pub fn close(&self, page: u64) {
        let frame = self.frame(page);
        if frame.page.load(Ordering::Acquire) != page {
            return;
        }
        frame.data.store(ptr::null_mut(), Ordering::Release);
        let buffer = frame.owner.lock().take();
        frame.page.store(FREE, Ordering::Release);
        drop(buffer);
    }

    /// Base pointer of `page`, or `None` if the page is not resident.
    #[inline]
    pub fn page_ptr(&self, page: u64) -> Option<*mut u8> {
        let frame = self.frame(page);
        if frame.page.load(Ordering::Acquire) != page {
            return None;
        }
        let data = frame.data.load(Ordering::Acquire);
        (!data.is_null()).then_some(data)
    }

    /// True when `page` is resident.
    pub fn is_resident(&self, page: u64) -> bool {
        self.page_ptr(page).is_some()
    }

    /// Note that a record on `page` references the object at `object`.
    pub fn note_object(&self, page: u64, object: u64) {
        let frame = self.frame(page);
        if frame.page.load(Ordering::Acquire) == page {
            frame.object_floor.fetch_min(object, Ordering::AcqRel);
        }
    }

    /// Lowest object address referenced from the resident `page`, if any.
    pub fn object_floor(&self, page: u64) -> Option<u64> {
        let frame = self.frame(page);
        if frame.page.load(Ordering::Acquire) != page {
            return None;
        }
        let floor = frame.object_floor.load(Ordering::Acquire);
        (floor != u64::MAX).then_some(floor)
    }

    /// Number of resident pages.
    pub fn resident(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| !matches!(f.page.load(Ordering::Acquire), FREE | OPENING))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_idempotent() {
        let frames = PageFrames::new(4, 4096);
        assert_eq!(frames.open(2).unwrap(), OpenOutcome::Ready);
        let first = frames.page_ptr(2).unwrap();
        assert_eq!(frames.open(2).unwrap(), OpenOutcome::Ready);
        assert_eq!(frames.page_ptr(2).unwrap(), first);
        assert_eq!(frames.resident(), 1);
    }

    #[test]
    fn test_ring_frame_reuse() {
        let frames = PageFrames::new(2, 4096);
        frames.open(0).unwrap();
        frames.open(1).unwrap();
        // Page 2 shares a frame with page 0.
        assert_eq!(frames.open(2).unwrap(), OpenOutcome::Occupied);
        assert!(frames.page_ptr(2).is_none());

        frames.close(0);
        assert!(!frames.is_resident(0));
        assert_eq!(frames.open(2).unwrap(), OpenOutcome::Ready);
        assert!(frames.is_resident(2));
    }

    #[test]
    fn test_reopened_frame_is_zeroed() {
        let frames = PageFrames::new(1, 4096);
        frames.open(0).unwrap();
        unsafe { *frames.page_ptr(0).unwrap() = 0xab };
        frames.close(0);
        frames.open(1).unwrap();
        assert_eq!(unsafe { *frames.page_ptr(1).unwrap() }, 0);
    }

    #[test]
    fn test_close_ignores_other_page() {
        let frames = PageFrames::new(2, 4096);
        frames.open(3).unwrap();
        frames.close(1);
        assert!(frames.is_resident(3));
    }

    #[test]
    fn test_object_floor_resets_with_frame() {
        let frames = PageFrames::new(1, 4096);
        frames.open(0).unwrap();
        assert_eq!(frames.object_floor(0), None);
        frames.note_object(0, 900);
        frames.note_object(0, 300);
        frames.note_object(0, 500);
        assert_eq!(frames.object_floor(0), Some(300));
        // Another page's note is dropped.
        frames.note_object(1, 10);
        assert_eq!(frames.object_floor(0), Some(300));

        frames.close(0);
        assert_eq!(frames.object_floor(0), None);
        frames.open(1).unwrap();
        assert_eq!(frames.object_floor(1), None);
    }
}

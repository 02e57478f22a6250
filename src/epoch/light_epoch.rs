//! LightEpoch: lightweight epoch protection
//!
//! Every thread that touches shared log memory publishes the global epoch it observed in
//! its own cache-line slot. The minimum over all published epochs tells us which epochs
//! no thread can still be inside; deferred actions registered against an older epoch run
//! once that point has been passed.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};

/// Published value of a thread that is outside any protected region.
pub const UNPROTECTED: u64 = 0;

const DRAIN_LIST_SIZE: usize = 256;

/// One slot of the epoch table.
#[repr(C, align(64))]
struct Entry {
    local_current_epoch: AtomicU64,
    reentrant: AtomicU32,
    in_use: AtomicBool,
    _padding: [u8; CACHE_LINE_BYTES - 13],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_current_epoch: AtomicU64::new(UNPROTECTED),
            reentrant: AtomicU32::new(0),
            in_use: AtomicBool::new(false),
            _padding: [0; CACHE_LINE_BYTES - 13],
        }
    }
}

/// Deferred callback waiting for an epoch to become safe.
pub struct EpochAction {
    epoch: AtomicU64,
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl EpochAction {
    const FREE: u64 = u64::MAX;
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Claim and run the action registered for `expected_epoch`.
    fn try_pop(&self, expected_epoch: u64) -> bool {
        if self
            .epoch
            .compare_exchange(expected_epoch, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // SAFETY: the LOCKED state grants exclusive access to the callback cell.
        let callback = unsafe { (*self.callback.get()).take() };
        self.epoch.store(Self::FREE, Ordering::Release);
        if let Some(cb) = callback {
            cb();
        }
        true
    }

    fn try_push<F>(&self, prior_epoch: u64, callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .epoch
            .compare_exchange(Self::FREE, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(callback);
        }
        // SAFETY: the LOCKED state grants exclusive access to the callback cell.
        unsafe {
            *self.callback.get() = Some(Box::new(callback));
        }
        self.epoch.store(prior_epoch, Ordering::Release);
        Ok(())
    }
}

// SAFETY: the callback cell is only touched by the thread that moved `epoch` to LOCKED.
unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Epoch protection framework.
pub struct LightEpoch {
    table: Box<[Entry]>,
    drain_list: Box<[EpochAction]>,
    drain_count: AtomicU32,
    current_epoch: AtomicU64,
    safe_to_reclaim_epoch: AtomicU64,
}

impl LightEpoch {
    /// Create a new epoch table with `MAX_THREADS` slots.
    pub fn new() -> Self {
        let table: Vec<Entry> = (0..MAX_THREADS).map(|_| Entry::new()).collect();
        let drain_list: Vec<EpochAction> =
            (0..DRAIN_LIST_SIZE).map(|_| EpochAction::new()).collect();

        Self {
            table: table.into_boxed_slice(),
            drain_list: drain_list.into_boxed_slice(),
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_to_reclaim_epoch: AtomicU64::new(0),
        }
    }

    /// Claim a free slot in the epoch table. Returns `None` when all slots are taken.
    pub fn acquire_thread_slot(&self) -> Option<usize> {
        self.table.iter().position(|entry| {
            entry
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Return a slot claimed with [`acquire_thread_slot`](Self::acquire_thread_slot).
    pub fn release_thread_slot(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        let entry = &self.table[thread_id];
        entry.reentrant.store(0, Ordering::Release);
        entry
            .local_current_epoch
            .store(UNPROTECTED, Ordering::Release);
        entry.in_use.store(false, Ordering::Release);
    }

    /// Current global epoch.
    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Last computed safe-to-reclaim epoch.
    #[inline]
    pub fn safe_to_reclaim_epoch(&self) -> u64 {
        self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Enter the protected region.
    #[inline]
    pub fn protect(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.table[thread_id]
            .local_current_epoch
            .store(epoch, Ordering::SeqCst);
        epoch
    }

    /// Enter the protected region and run any actions that have become safe.
    #[inline]
    pub fn protect_and_drain(&self, thread_id: usize) -> u64 {
        let epoch = self.protect(thread_id);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Nested protection; only the outermost call publishes an epoch.
    #[inline]
    pub fn reentrant_protect(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let entry = &self.table[thread_id];
        if entry.reentrant.fetch_add(1, Ordering::AcqRel) == 0 {
            self.protect_and_drain(thread_id)
        } else {
            entry.local_current_epoch.load(Ordering::Acquire)
        }
    }

    /// Leave a nested protection; the outermost call unpublishes.
    #[inline]
    pub fn reentrant_unprotect(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        let entry = &self.table[thread_id];
        if entry.reentrant.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.unprotect(thread_id);
        }
    }

    /// Check if the thread is currently protected.
    #[inline]
    pub fn is_protected(&self, thread_id: usize) -> bool {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_current_epoch
            .load(Ordering::Acquire)
            != UNPROTECTED
    }

    /// Exit the protected region.
    #[inline]
    pub fn unprotect(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_current_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    fn drain(&self, next_epoch: u64) {
        let safe_epoch = self.compute_new_safe_to_reclaim_epoch(next_epoch);

        for action in self.drain_list.iter() {
            let trigger_epoch = action.epoch.load(Ordering::Acquire);
            if trigger_epoch <= safe_epoch
                && trigger_epoch != EpochAction::FREE
                && trigger_epoch != EpochAction::LOCKED
                && action.try_pop(trigger_epoch)
                && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1
            {
                break;
            }
        }
    }

    /// Run every deferred action whose epoch is safe. Callable from unprotected threads.
    pub fn drain_pending(&self) {
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(self.current_epoch());
        }
    }

    /// Increment the global epoch.
    pub fn bump_current_epoch(&self) -> u64 {
        let next_epoch = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next_epoch);
        }
        next_epoch
    }

    /// Increment the global epoch and run `callback` once every thread has left the
    /// prior epoch. Returns the new epoch.
    pub fn bump_current_epoch_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let new_epoch = self.bump_current_epoch();
        let prior_epoch = new_epoch - 1;

        let mut callback = callback;
        loop {
            for action in self.drain_list.iter() {
                if action.epoch.load(Ordering::Acquire) != EpochAction::FREE {
                    continue;
                }
                match action.try_push(prior_epoch, callback) {
                    Ok(()) => {
                        self.drain_count.fetch_add(1, Ordering::AcqRel);
                        return new_epoch;
                    }
                    Err(returned) => callback = returned,
                }
            }
            // Every slot is busy: make room by draining what is already safe.
            self.drain(self.current_epoch());
            thread::yield_now();
        }
    }

    /// Recompute the safe-to-reclaim epoch by scanning all slots.
    pub fn compute_new_safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let oldest_ongoing = self
            .table
            .iter()
            .map(|entry| entry.local_current_epoch.load(Ordering::SeqCst))
            .filter(|&epoch| epoch != UNPROTECTED)
            .fold(current_epoch, u64::min);

        let safe = oldest_ongoing.saturating_sub(1);
        self.safe_to_reclaim_epoch.fetch_max(safe, Ordering::AcqRel);
        self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Spin until `epoch` is safe to reclaim, running deferred actions meanwhile.
    ///
    /// The calling thread must not itself be protected at an epoch `<= epoch`.
    pub fn spin_wait_for_safe(&self, epoch: u64) {
        loop {
            let safe = self.compute_new_safe_to_reclaim_epoch(self.current_epoch());
            self.drain_pending();
            if safe >= epoch {
                return;
            }
            thread::yield_now();
        }
    }

    /// Check if `epoch` is safe to reclaim.
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Number of deferred actions not yet run.
    pub fn pending_actions(&self) -> u32 {
        self.drain_count.load(Ordering::Acquire)
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for epoch protection.
///
/// Pointers into log pages obtained while the guard is alive must not outlive it.
pub struct EpochGuard<'a> {
    epoch: &'a LightEpoch,
    thread_id: usize,
}

impl<'a> EpochGuard<'a> {
    /// Protect `thread_id` (draining ready actions) until the guard drops.
    pub fn new(epoch: &'a LightEpoch, thread_id: usize) -> Self {
        epoch.reentrant_protect(thread_id);
        Self { epoch, thread_id }
    }

    /// Thread slot this guard protects.
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Re-publish the current epoch so long-running protected work does not stall
    /// reclamation.
    pub fn refresh(&self) {
        self.epoch.protect_and_drain(self.thread_id);
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.epoch.reentrant_unprotect(self.thread_id);
    }
}

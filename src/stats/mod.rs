//! Operation counters for a store
//!
//! Counters are relaxed atomics bumped on the data path; a [`StoreStatsSnapshot`] is a
//! plain copy for reporting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::status::{OperationType, Status};

/// Statistics for store operations
#[derive(Debug, Default)]
pub struct StoreStats {
    reads: AtomicU64,
    read_hits: AtomicU64,
    upserts: AtomicU64,
    rmws: AtomicU64,
    in_place_updates: AtomicU64,
    deletes: AtomicU64,
    conditional_inserts: AtomicU64,
    pending: AtomicU64,
    retries: AtomicU64,
    io_errors: AtomicU64,
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one operation.
    pub fn record(&self, op: OperationType, status: Status) {
        let counter = match op {
            OperationType::Read => &self.reads,
            OperationType::Upsert => &self.upserts,
            OperationType::Rmw => &self.rmws,
            OperationType::Delete => &self.deletes,
            OperationType::ConditionalInsert => &self.conditional_inserts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        match status {
            Status::Ok if op == OperationType::Read => {
                self.read_hits.fetch_add(1, Ordering::Relaxed);
            }
            Status::Pending => {
                self.pending.fetch_add(1, Ordering::Relaxed);
            }
            Status::IoError => {
                self.io_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// A resolved pending read.
    pub fn record_completed_read(&self, status: Status) {
        match status {
            Status::Ok => {
                self.read_hits.fetch_add(1, Ordering::Relaxed);
            }
            Status::IoError => {
                self.io_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_in_place_update(&self) {
        self.in_place_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// A lost CAS or a wait on a full log.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            read_hits: self.read_hits.load(Ordering::Relaxed),
            upserts: self.upserts.load(Ordering::Relaxed),
            rmws: self.rmws.load(Ordering::Relaxed),
            in_place_updates: self.in_place_updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            conditional_inserts: self.conditional_inserts.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.reads,
            &self.read_hits,
            &self.upserts,
            &self.rmws,
            &self.in_place_updates,
            &self.deletes,
            &self.conditional_inserts,
            &self.pending,
            &self.retries,
            &self.io_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStatsSnapshot {
    pub reads: u64,
    /// Reads that returned a value, synchronously or after completing
    pub read_hits: u64,
    pub upserts: u64,
    pub rmws: u64,
    /// RMWs applied to a mutable record without appending
    pub in_place_updates: u64,
    pub deletes: u64,
    pub conditional_inserts: u64,
    /// Reads that went to the device
    pub pending: u64,
    pub retries: u64,
    pub io_errors: u64,
}

impl StoreStatsSnapshot {
    /// Get total operations
    pub fn total_operations(&self) -> u64 {
        self.reads + self.upserts + self.rmws + self.deletes + self.conditional_inserts
    }

    /// Get hit rate
    pub fn hit_rate(&self) -> f64 {
        if self.reads == 0 {
            return 0.0;
        }
        self.read_hits as f64 / self.reads as f64
    }
}

impl fmt::Display for StoreStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Store Statistics:")?;
        writeln!(f, "  Reads: {} (hits {}, pending {})", self.reads, self.read_hits, self.pending)?;
        writeln!(f, "  Upserts: {}", self.upserts)?;
        writeln!(f, "  RMWs: {} (in place {})", self.rmws, self.in_place_updates)?;
        writeln!(f, "  Deletes: {}", self.deletes)?;
        writeln!(f, "  Conditional inserts: {}", self.conditional_inserts)?;
        writeln!(f, "  Retries: {}", self.retries)?;
        writeln!(f, "  I/O errors: {}", self.io_errors)
    }
}

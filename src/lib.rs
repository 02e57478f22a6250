//! hybridkv - A concurrent, latch-free key-value store over a hybrid log
//!
//! Records live in a single logical address space that spans memory and a storage
//! device:
//! - **Hash index**: maps key hashes to the newest record of a chain
//! - **Hybrid log**: a mutable in-memory tail, a read-only in-memory region, and a
//!   stable region on the device
//! - **Object log**: a second log holding variable-size values
//! - **Epoch protection**: deferred reclamation that makes page eviction, index growth
//!   and checkpoint cuts safe without locks on the data path
//! - **Checkpoints**: Snapshot and FoldOver checkpoints with per-session recovery points
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hybridkv::device::FileSystemDisk;
//! use hybridkv::store::{FasterKv, FasterKvConfig, UpdateFn};
//! use hybridkv::Status;
//!
//! let config = FasterKvConfig::new(1 << 16, 1 << 26).with_checkpoint_dir("checkpoints");
//! let device = FileSystemDisk::single_file("hlog.dat")?;
//! let store = Arc::new(FasterKv::<u64, u64, _>::new(config, device)?);
//!
//! let mut session = store.start_session()?;
//! session.upsert(&1, &100);
//! session.rmw(&1, &mut UpdateFn::new(0, |v: &mut u64| *v += 1));
//! match session.read(&1) {
//!     Ok(value) => assert_eq!(value, Some(101)),
//!     Err(Status::Pending) => {
//!         session.complete_pending(true);
//!     }
//!     Err(status) => return Err(status.into()),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod device;
pub mod epoch;
pub mod index;
pub mod object_log;
pub mod record;
pub mod stats;
pub mod status;
pub mod store;
mod utility;

// Re-exports for convenience
pub use address::{Address, AtomicAddress};
pub use checkpoint::{CheckpointError, CheckpointToken, CheckpointType};
pub use config::{ConfigError, HybridKvConfig};
pub use record::{Record, RecordInfo};
pub use status::Status;
pub use store::{FasterKv, FasterKvConfig, Session};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads supported
    pub const MAX_THREADS: usize = 96;
}

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::{Address, AtomicAddress};
    pub use crate::checkpoint::{CheckpointToken, CheckpointType};
    pub use crate::codec::{PersistKey, PersistValue};
    pub use crate::device::{FileSystemDisk, NullDisk, StorageDevice};
    pub use crate::status::Status;
    pub use crate::store::{FasterKv, FasterKvConfig, RmwContext, Session, UpdateFn};
}

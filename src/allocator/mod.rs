//! In-memory page management for the hybrid log.
//!
//! ```text
//!  begin            head           read_only              tail
//!    |---- stable ----|-- read-only --|------ mutable ------|
//!      (device only)     (in memory)     (in place updates)
//! ```
//!
//! Pages move rightwards through the regions as the tail advances. A page is flushed
//! when it becomes read-only and its frame is released once it falls below the head.

mod hybrid_log;
pub mod page_allocator;

pub use hybrid_log::{HybridLog, HybridLogConfig, LogStats};
pub use page_allocator::{OpenOutcome, PageFrames, PAGE_ALIGNMENT};

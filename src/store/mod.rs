//! FasterKV key-value store implementation
//!
//! This module provides the main FasterKV store implementation
//! along with session management and operation contexts.

mod contexts;
mod faster_kv;
mod pending_io;
mod session;

pub use contexts::{CompletedRead, RmwContext, UpdateFn};
pub use faster_kv::{FasterKv, FasterKvConfig};
pub use session::Session;

//! Epoch-based protection and reclamation
//!
//! The epoch table is the crate's single safe-point barrier: page eviction, index growth
//! and checkpoint version cuts all register deferred work against it.

mod light_epoch;

pub use light_epoch::{EpochAction, EpochGuard, LightEpoch, UNPROTECTED};

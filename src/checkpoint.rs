//! Checkpoint and recovery artifacts
//!
//! A full checkpoint captures a fuzzy image of the hash index and a consistent cut of the
//! hybrid log at a version boundary. Recovery loads both and repairs the index by
//! replaying the log between the index checkpoint and the cut.
//!
//! # Checkpoint Types
//!
//! - **Snapshot**: the in-memory part of the log is written to `log.snapshot`.
//! - **FoldOver**: the log is flushed up to the cut; only metadata is written.
//!
//! # File Structure
//!
//! Each checkpoint is a directory `<checkpoint_dir>/<token>/` holding:
//!
//! - `index.meta`: index checkpoint metadata (JSON)
//! - `index.dat`: hash index image (binary)
//! - `log.meta`: log checkpoint metadata and session states (JSON)
//! - `log.snapshot`: log pages (binary, Snapshot only)
//!
//! Every artifact has a `.crc` sidecar. Artifacts are written to a temporary name and
//! renamed into place, so a crash mid-checkpoint leaves either a complete artifact or
//! none.
//!
//! # Usage
//!
//! ```rust,ignore
//! let token = store.take_full_checkpoint(CheckpointType::Snapshot)?;
//! store.complete_checkpoint(true)?;
//!
//! let recovered = FasterKv::<u64, u64, _>::recover(config, device, None, token)?;
//! ```

use std::io;
use std::path::PathBuf;

use uuid::Uuid;

use crate::status::Status;

mod recovery;
mod serialization;
pub mod sidecar;
mod state;

pub use recovery::{latest_checkpoint, list_checkpoints, validate_checkpoint, CheckpointInfo};
pub use serialization::{
    checkpoint_path, create_checkpoint_directory, index_data_path, index_metadata_path,
    log_metadata_path, log_snapshot_path, read_json, write_atomic, write_json,
};
pub use state::{CheckpointType, IndexMetadata, LogMetadata, SessionState};

/// Token identifying a checkpoint
pub type CheckpointToken = Uuid;

/// Errors from taking or recovering a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Reading or writing an artifact failed.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] io::Error),

    /// A metadata file could not be parsed.
    #[error("malformed checkpoint metadata {path}: {source}")]
    Metadata {
        /// The metadata file.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// An artifact does not match its sidecar checksum.
    #[error("checksum mismatch in {path}")]
    ChecksumMismatch {
        /// The damaged artifact.
        path: PathBuf,
    },

    /// A required artifact is absent.
    #[error("missing checkpoint artifact {path}")]
    MissingArtifact {
        /// Expected location.
        path: PathBuf,
    },

    /// The checkpoint cannot be loaded into a store with this configuration.
    #[error("incompatible checkpoint: {0}")]
    Incompatible(String),

    /// The store is not in a state that allows the request.
    #[error("invalid store state: {0}")]
    InvalidState(&'static str),

    /// A store operation failed while checkpointing or recovering.
    #[error("store operation failed: {0}")]
    Status(#[from] Status),
}

impl CheckpointError {
    /// Status to report to data-path callers.
    pub fn status(&self) -> Status {
        match self {
            CheckpointError::Io(_) => Status::IoError,
            CheckpointError::Metadata { .. }
            | CheckpointError::ChecksumMismatch { .. }
            | CheckpointError::MissingArtifact { .. } => Status::Corruption,
            CheckpointError::Incompatible(_) => Status::InvalidArgument,
            CheckpointError::InvalidState(_) => Status::InvalidOperation,
            CheckpointError::Status(status) => *status,
        }
    }
}

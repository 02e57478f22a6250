//! Locating and validating checkpoints on disk
//!
//! Recovery itself lives with the store; this module answers which checkpoints exist
//! and whether one is complete enough to recover from.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::checkpoint::{
    checkpoint_path, index_data_path, index_metadata_path, log_metadata_path, log_snapshot_path,
    read_json, sidecar, CheckpointError, CheckpointToken, CheckpointType, IndexMetadata,
    LogMetadata,
};

/// A complete checkpoint with its verified metadata.
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    /// Checkpoint token
    pub token: CheckpointToken,
    /// Directory holding the artifacts
    pub directory: PathBuf,
    /// Index metadata
    pub index: IndexMetadata,
    /// Log metadata
    pub log: LogMetadata,
}

impl CheckpointInfo {
    /// Load and verify the metadata of checkpoint `token` under `base_dir`.
    ///
    /// Checks every artifact and its sidecar except the per-page snapshot checksums,
    /// which are verified as pages are loaded.
    pub fn load(base_dir: &Path, token: CheckpointToken) -> Result<Self, CheckpointError> {
        let directory = checkpoint_path(base_dir, token);
        if !directory.is_dir() {
            return Err(CheckpointError::MissingArtifact { path: directory });
        }

        let index: IndexMetadata = read_json(&index_metadata_path(&directory))?;
        let log: LogMetadata = read_json(&log_metadata_path(&directory))?;
        if index.token != token || log.token != token {
            return Err(CheckpointError::Incompatible(format!(
                "metadata in {} belongs to another checkpoint",
                directory.display()
            )));
        }

        sidecar::verify_file_checksum(&index_data_path(&directory))?;
        if log.checkpoint_type == CheckpointType::Snapshot {
            let snapshot = log_snapshot_path(&directory);
            if !snapshot.is_file() {
                return Err(CheckpointError::MissingArtifact { path: snapshot });
            }
            sidecar::read_snapshot_checksums(&snapshot)?;
        }

        Ok(Self {
            token,
            directory,
            index,
            log,
        })
    }

    /// Store version captured by the checkpoint.
    pub fn version(&self) -> u32 {
        self.log.version
    }
}

/// Check that checkpoint `token` is complete.
pub fn validate_checkpoint(base_dir: &Path, token: CheckpointToken) -> Result<(), CheckpointError> {
    CheckpointInfo::load(base_dir, token).map(|_| ())
}

/// Every complete checkpoint under `base_dir`, oldest first.
///
/// Directories whose name is not a token or whose artifacts fail validation are skipped.
pub fn list_checkpoints(base_dir: &Path) -> Vec<CheckpointInfo> {
    let Ok(entries) = fs::read_dir(base_dir) else {
        return Vec::new();
    };

    let mut found: Vec<CheckpointInfo> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| Uuid::parse_str(&entry.file_name().to_string_lossy()).ok())
        .filter_map(|token| match CheckpointInfo::load(base_dir, token) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!(token = %token, error = %e, "skipping incomplete checkpoint");
                None
            }
        })
        .collect();

    found.sort_by_key(|info| (info.log.timestamp_ms, info.log.version));
    found
}

/// The most recent complete checkpoint under `base_dir`.
pub fn latest_checkpoint(base_dir: &Path) -> Option<CheckpointInfo> {
    list_checkpoints(base_dir).pop()
}

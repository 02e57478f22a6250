//! Artifact paths and atomic file writes

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::checkpoint::{sidecar, CheckpointError, CheckpointToken};

/// Directory of the checkpoint `token` under `base_dir`.
pub fn checkpoint_path(base_dir: &Path, token: CheckpointToken) -> PathBuf {
    base_dir.join(token.to_string())
}

/// Create (if needed) and return the directory for `token`.
pub fn create_checkpoint_directory(base_dir: &Path, token: CheckpointToken) -> io::Result<PathBuf> {
    let dir = checkpoint_path(base_dir, token);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Path of the index metadata file
pub fn index_metadata_path(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join("index.meta")
}

/// Path of the index image
pub fn index_data_path(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join("index.dat")
}

/// Path of the log metadata file
pub fn log_metadata_path(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join("log.meta")
}

/// Path of the log snapshot
pub fn log_snapshot_path(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join("log.snapshot")
}

fn tmp_path(path: &Path) -> io::Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing file name"))?
        .to_string_lossy();
    let parent = path.parent().unwrap_or(Path::new("."));
    Ok(parent.join(format!(".{file_name}.tmp")))
}

/// Write `path` through a temporary file that is synced and then renamed into place.
pub fn write_atomic<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let tmp = tmp_path(path)?;
    let mut writer = BufWriter::with_capacity(1 << 20, File::create(&tmp)?);
    write(&mut writer)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

/// Write `value` as pretty JSON with a checksum sidecar.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, |w| w.write_all(&bytes))?;
    sidecar::write_file_checksum(path)
}

/// Verify the sidecar of `path` and parse it as JSON.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    sidecar::verify_file_checksum(path)?;
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Metadata {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SessionState;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[test]
    fn test_json_round_trip_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = SessionState::new(Uuid::new_v4(), 9);
        write_json(&path, &state).unwrap();

        let back: SessionState = read_json(&path).unwrap();
        assert_eq!(back, state);
        assert!(!dir.path().join(".state.json.tmp").exists());
    }

    #[test]
    fn test_read_json_rejects_garbage_with_valid_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.meta");
        fs::write(&path, b"not json").unwrap();
        sidecar::write_file_checksum(&path).unwrap();
        assert!(matches!(
            read_json::<SessionState>(&path),
            Err(CheckpointError::Metadata { .. })
        ));
    }

    #[test]
    fn test_artifact_paths() {
        let token = Uuid::new_v4();
        let dir = checkpoint_path(Path::new("/ckpt"), token);
        assert_eq!(dir, Path::new("/ckpt").join(token.to_string()));
        assert!(index_data_path(&dir).ends_with("index.dat"));
        assert!(log_snapshot_path(&dir).ends_with("log.snapshot"));
    }
}

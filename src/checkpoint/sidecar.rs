//! Sidecar `.crc` files for checkpoint artifact integrity verification.
//!
//! Each checkpoint artifact gets a companion `.crc` file written alongside it:
//!
//! - For metadata and index files: a single 8-byte xxh3 checksum of the file content.
//! - For snapshot files: per-page checksums as
//!   `[num_pages: u64][page_num: u64, checksum: u64]...` in little-endian format.
//!
//! A missing sidecar fails verification: the sidecar is written after the artifact is in
//! place, so its absence means the checkpoint was interrupted.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::xxh3_64;

use crate::checkpoint::{write_atomic, CheckpointError};

/// Get the sidecar path for a given artifact file.
pub fn crc_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".crc");
    PathBuf::from(p)
}

/// Checksum of one artifact or snapshot page.
#[inline]
pub fn checksum(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Write a whole-file checksum sidecar for `path`.
pub fn write_file_checksum(path: &Path) -> io::Result<()> {
    let content = std::fs::read(path)?;
    let sum = checksum(&content);
    write_atomic(&crc_path(path), |w| w.write_all(&sum.to_le_bytes()))
}

/// Verify the whole-file sidecar of `path`.
pub fn verify_file_checksum(path: &Path) -> Result<(), CheckpointError> {
    let content = read_artifact(path)?;
    let crc = read_artifact(&crc_path(path))?;
    let stored: [u8; 8] = crc
        .as_slice()
        .try_into()
        .map_err(|_| CheckpointError::ChecksumMismatch {
            path: path.to_path_buf(),
        })?;
    if u64::from_le_bytes(stored) != checksum(&content) {
        return Err(CheckpointError::ChecksumMismatch {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Write per-page checksums for a snapshot file to `<path>.crc`.
pub fn write_snapshot_checksums(path: &Path, checksums: &[(u64, u64)]) -> io::Result<()> {
    write_atomic(&crc_path(path), |w| {
        w.write_all(&(checksums.len() as u64).to_le_bytes())?;
        for &(page, sum) in checksums {
            w.write_all(&page.to_le_bytes())?;
            w.write_all(&sum.to_le_bytes())?;
        }
        Ok(())
    })
}

/// Read per-page checksums from a snapshot sidecar file.
pub fn read_snapshot_checksums(path: &Path) -> Result<HashMap<u64, u64>, CheckpointError> {
    let crc = crc_path(path);
    let data = read_artifact(&crc)?;
    let mismatch = || CheckpointError::ChecksumMismatch { path: crc.clone() };

    let word = |at: usize| -> Option<u64> {
        data.get(at..at + 8)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
    };

    let count = word(0).ok_or_else(mismatch)? as usize;
    if data.len() != 8 + count.saturating_mul(16) {
        return Err(mismatch());
    }

    let mut map = HashMap::with_capacity(count);
    for i in 0..count {
        let at = 8 + i * 16;
        let page = word(at).ok_or_else(mismatch)?;
        let sum = word(at + 8).ok_or_else(mismatch)?;
        if map.insert(page, sum).is_some() {
            return Err(mismatch());
        }
    }
    Ok(map)
}

fn read_artifact(path: &Path) -> Result<Vec<u8>, CheckpointError> {
    std::fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CheckpointError::MissingArtifact {
            path: path.to_path_buf(),
        },
        _ => CheckpointError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_checksum_detects_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.meta");
        std::fs::write(&path, b"{\"table_size\":1024}").unwrap();
        write_file_checksum(&path).unwrap();
        verify_file_checksum(&path).unwrap();

        std::fs::write(&path, b"{\"table_size\":2048}").unwrap();
        assert!(matches!(
            verify_file_checksum(&path),
            Err(CheckpointError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_sidecar_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.meta");
        std::fs::write(&path, b"{}").unwrap();
        assert!(matches!(
            verify_file_checksum(&path),
            Err(CheckpointError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn test_snapshot_checksums_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.snapshot");
        write_snapshot_checksums(&path, &[(3, 11), (4, 12)]).unwrap();
        let map = read_snapshot_checksums(&path).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&4], 12);

        std::fs::write(crc_path(&path), [1u8; 12]).unwrap();
        assert!(read_snapshot_checksums(&path).is_err());
    }
}

//! Device failure tests using the FaultInjectionDevice.
//!
//! I/O errors from the storage device must surface as statuses or checkpoint errors,
//! and the store must keep working once the device recovers.

mod common;

use std::io;
use std::sync::Arc;

use hybridkv::checkpoint::{list_checkpoints, CheckpointError, CheckpointType};
use hybridkv::device::SyncStorageDevice;
use hybridkv::status::Status;
use hybridkv::store::FasterKv;
use parking_lot::Mutex;
use tempfile::tempdir;

use common::FaultInjectionDevice;

/// A simple in-memory device that actually stores data.
#[derive(Default)]
struct MemDevice {
    data: Mutex<Vec<u8>>,
}

impl SyncStorageDevice for MemDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let end = (offset + buf.len()).min(data.len());
        buf[..end - offset].copy_from_slice(&data[offset..end]);
        Ok(end - offset)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}

type FaultyStore = FasterKv<u64, u64, FaultInjectionDevice<MemDevice>>;

fn faulty_store(dir: &std::path::Path) -> Arc<FaultyStore> {
    common::init_tracing();
    let device = FaultInjectionDevice::new(MemDevice::default());
    Arc::new(FasterKv::new(common::small_config(dir), device).unwrap())
}

#[test]
fn test_failed_flush_is_reported_and_retried() {
    let dir = tempdir().unwrap();
    let store = faulty_store(dir.path());
    let mut session = store.start_session().unwrap();
    for key in 0..500u64 {
        session.upsert(&key, &(key + 1));
    }
    assert_eq!(store.device().write_count(), 0);

    store.device().set_fail_writes(true);
    assert_eq!(store.flush_and_evict(true), Status::IoError);
    assert!(store.log_stats().head_address < store.log_stats().tail_address);
    // Nothing was evicted, so everything is still served from memory.
    for key in 0..500u64 {
        assert_eq!(session.read(&key), Ok(Some(key + 1)));
    }

    store.device().set_fail_writes(false);

    assert_eq!(store.flush_and_evict(true), Status::Ok);
    assert!(store.device().write_count() > 1);
    for key in 0..500u64 {
        assert_eq!(session.read(&key), Err(Status::Pending));
    }
    assert!(session.complete_pending(true));
    let completed = session.take_completed_reads();
    assert_eq!(completed.len(), 500);
    for read in completed {
        assert_eq!(read.result, Ok(Some(read.key + 1)));
    }
}

#[test]
fn test_fold_over_checkpoint_fails_on_write_error() {
    let dir = tempdir().unwrap();
    let store = faulty_store(dir.path());
    let mut session = store.start_session().unwrap();
    for key in 0..100u64 {
        session.upsert(&key, &key);
    }

    store.device().set_fail_writes(true);
    let result = store.take_full_checkpoint(CheckpointType::FoldOver);
    assert!(matches!(result, Err(CheckpointError::Io(_))), "{result:?}");
    assert_eq!(result.unwrap_err().status(), Status::IoError);
    assert!(store.last_checkpoint().is_none());
    assert!(list_checkpoints(&store.config().checkpoint_dir).is_empty());

    // The store keeps working and the next checkpoint succeeds.
    store.device().set_fail_writes(false);
    session.upsert(&1_000, &1);
    let token = store.take_full_checkpoint(CheckpointType::FoldOver).unwrap();
    let listed = list_checkpoints(&store.config().checkpoint_dir);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].token, token);
}

#[test]
fn test_snapshot_checkpoint_does_not_touch_device() {
    let dir = tempdir().unwrap();
    let store = faulty_store(dir.path());
    let mut session = store.start_session().unwrap();
    for key in 0..100u64 {
        session.upsert(&key, &key);
    }

    store.device().set_fail_writes(true);
    store.take_full_checkpoint(CheckpointType::Snapshot).unwrap();
    assert_eq!(store.device().write_count(), 0);
}

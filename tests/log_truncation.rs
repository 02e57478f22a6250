//! Log truncation tests: keys below the begin address disappear.

mod common;

use std::path::Path;
use std::sync::Arc;

use hybridkv::allocator::LogStats;
use hybridkv::checkpoint::CheckpointType;
use hybridkv::codec::{hash64, RawBytes};
use hybridkv::device::{FileSystemDisk, StorageDevice};
use hybridkv::index::{GrowConfig, KeyHash};
use hybridkv::status::Status;
use hybridkv::store::{FasterKv, FasterKvConfig, UpdateFn};
use tempfile::tempdir;

fn assert_ordered(stats: &LogStats) {
    assert!(stats.begin_address <= stats.head_address, "{stats}");
    assert!(stats.head_address <= stats.tail_address, "{stats}");
}

/// Two `u64` keys that land in the same bucket with the same tag.
fn colliding_keys(table_size: u64) -> (u64, u64) {
    let hash = |key: u64| KeyHash::new(hash64(&key.to_le_bytes()));
    let first = hash(1);
    let other = (2u64..)
        .find(|&key| {
            let h = hash(key);
            h.tag() == first.tag()
                && h.hash_table_index(table_size) == first.hash_table_index(table_size)
        })
        .unwrap();
    (1, other)
}

fn segment_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[test]
fn test_shift_begin_to_tail_drops_every_key() {
    let dir = tempdir().unwrap();
    let store = common::u64_store(dir.path(), common::small_config(dir.path()));
    let mut session = store.start_session().unwrap();

    for key in 0..1_000u64 {
        session.upsert(&key, &(key + 1));
    }
    let tail = store.log_stats().tail_address;
    assert!(store.shift_begin_address(tail));
    let stats = store.log_stats();
    assert_eq!(stats.begin_address, tail);
    assert_ordered(&stats);

    for key in 0..1_000u64 {
        assert_eq!(session.read(&key), Ok(None), "key {key}");
    }
    assert_eq!(session.delete(&5), Status::NotFound);
}

#[test]
fn test_truncated_keys_restart_from_initial_value() {
    let dir = tempdir().unwrap();
    let store = common::u64_store(dir.path(), common::small_config(dir.path()));
    let mut session = store.start_session().unwrap();
    let mut add = UpdateFn::new(10u64, |v: &mut u64| *v += 10);

    session.rmw(&1, &mut add);
    session.rmw(&1, &mut add);
    assert_eq!(session.read(&1), Ok(Some(20)));

    let tail = store.log_stats().tail_address;
    store.shift_begin_address(tail);
    session.rmw(&1, &mut add);
    assert_eq!(session.read(&1), Ok(Some(10)));
}

#[test]
fn test_partial_truncation_keeps_newer_records() {
    let dir = tempdir().unwrap();
    let store = common::u64_store(dir.path(), common::small_config(dir.path()));
    let mut session = store.start_session().unwrap();

    for key in 0..100u64 {
        session.upsert(&key, &key);
    }
    let cut = store.log_stats().tail_address;
    for key in 50..100u64 {
        session.upsert(&key, &(key * 10));
    }
    assert!(store.shift_begin_address(cut));
    assert_ordered(&store.log_stats());
    // Moving backwards is refused.
    assert!(!store.shift_begin_address(cut));

    for key in 0..50u64 {
        assert_eq!(session.read(&key), Ok(None));
    }
    for key in 50..100u64 {
        assert_eq!(session.read(&key), Ok(Some(key * 10)));
    }
}

#[test]
fn test_truncation_of_evicted_region() {
    let dir = tempdir().unwrap();
    let store = common::u64_store(dir.path(), common::small_config(dir.path()));
    let mut session = store.start_session().unwrap();

    for key in 0..200u64 {
        session.upsert(&key, &key);
    }
    assert_eq!(store.flush_and_evict(true), Status::Ok);
    let tail = store.log_stats().tail_address;
    store.shift_begin_address(tail);

    // Chains end at the begin address without touching the device.
    for key in (0..200u64).step_by(13) {
        assert_eq!(session.read(&key), Ok(None));
    }
    assert_eq!(session.pending_count(), 0);
}

#[test]
fn test_truncation_evicts_before_moving_begin() {
    let dir = tempdir().unwrap();
    let store = common::u64_store(dir.path(), common::small_config(dir.path()));
    let mut session = store.start_session().unwrap();

    for key in 0..300u64 {
        session.upsert(&key, &key);
    }
    let cut = store.log_stats().tail_address;
    for key in 300..600u64 {
        session.upsert(&key, &key);
    }
    assert!(store.log_stats().head_address < cut);

    // The cut lies in the resident region, so the store evicts up to it first.
    assert!(store.shift_begin_address(cut));
    let stats = store.log_stats();
    assert_eq!(stats.begin_address, cut);
    assert!(stats.head_address >= cut, "{stats}");
    assert_ordered(&stats);

    let mut pending = 0;
    for key in 300..600u64 {
        match session.read(&key) {
            Ok(value) => assert_eq!(value, Some(key)),
            Err(Status::Pending) => pending += 1,
            Err(status) => panic!("read of {key} failed: {status}"),
        }
    }
    assert!(session.complete_pending(true));
    let completed = session.take_completed_reads();
    assert_eq!(completed.len(), pending);
    for read in completed {
        assert_eq!(read.result, Ok(Some(read.key)));
    }
}

fn checkpoint_after_truncation(kind: CheckpointType) {
    let dir = tempdir().unwrap();
    let config = common::small_config(dir.path()).with_checkpoint_type(kind);

    let token = {
        let store = common::u64_store(dir.path(), config.clone());
        let mut session = store.start_session().unwrap();
        for key in 0..1_000u64 {
            session.upsert(&key, &(key + 1));
        }
        let tail = store.log_stats().tail_address;
        assert!(store.shift_begin_address(tail));
        session.upsert(&7, &70);

        let token = store.checkpoint().unwrap();
        assert!(store.complete_checkpoint(true).unwrap());
        assert_ordered(&store.log_stats());
        token
    };

    let store = Arc::new(
        FasterKv::<u64, u64, _>::recover(config, common::log_device(dir.path()), None, token)
            .unwrap(),
    );
    assert_ordered(&store.log_stats());
    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&3), Ok(None));
    match session.read(&7) {
        Ok(value) => assert_eq!(value, Some(70)),
        Err(Status::Pending) => {
            assert!(session.complete_pending(true));
            assert_eq!(session.take_completed_reads()[0].result, Ok(Some(70)));
        }
        Err(status) => panic!("read failed: {status}"),
    }
}

#[test]
fn test_snapshot_checkpoint_after_truncation() {
    checkpoint_after_truncation(CheckpointType::Snapshot);
}

#[test]
fn test_fold_over_checkpoint_after_truncation() {
    checkpoint_after_truncation(CheckpointType::FoldOver);
}

#[test]
fn test_truncated_record_is_not_served_from_resolved_reads() {
    let dir = tempdir().unwrap();
    let config = FasterKvConfig {
        table_size: 2,
        grow: GrowConfig::default().with_auto_grow(false),
        ..common::small_config(dir.path())
    };
    let store = common::u64_store(dir.path(), config);
    let mut session = store.start_session().unwrap();
    let (older, newer) = colliding_keys(2);

    assert_eq!(session.upsert(&older, &111), Status::Ok);
    let cut = store.log_stats().tail_address;
    assert_eq!(session.upsert(&newer, &222), Status::Ok);
    assert_eq!(store.flush_and_evict(true), Status::Ok);

    // The chain head is `newer`, so `older` resolves on the device.
    assert_eq!(session.read(&older), Err(Status::Pending));
    assert!(session.complete_pending(true));
    assert_eq!(session.take_completed_reads()[0].result, Ok(Some(111)));
    assert_eq!(session.read(&older), Ok(Some(111)));

    // The chain head survives the cut while the record behind it does not.
    assert!(store.shift_begin_address(cut));
    assert_eq!(session.read(&older), Err(Status::Pending));
    assert!(session.complete_pending(true));
    let completed = session.take_completed_reads();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].key, older);
    assert_eq!(completed[0].result, Ok(None));

    assert_eq!(session.read(&newer), Err(Status::Pending));
    assert!(session.complete_pending(true));
    assert_eq!(session.take_completed_reads()[0].result, Ok(Some(222)));
}

#[test]
fn test_truncation_releases_device_segments() {
    let dir = tempdir().unwrap();
    let log_dir = dir.path().join("log");
    let object_dir = dir.path().join("objects");
    let config = FasterKvConfig {
        log_memory_size: 1 << 16,
        ..common::small_config(dir.path())
    };
    let log = FileSystemDisk::segmented(&log_dir, "hlog", 1 << 14).unwrap();
    let objects: Arc<dyn StorageDevice> =
        Arc::new(FileSystemDisk::segmented(&object_dir, "objects", 1 << 14).unwrap());
    let store = Arc::new(
        FasterKv::<u64, RawBytes, FileSystemDisk>::with_object_log(config, log, objects).unwrap(),
    );
    let mut session = store.start_session().unwrap();
    let value = |key: u64| RawBytes::from(vec![key as u8; 1_000]);

    for key in 0..2_000u64 {
        assert_eq!(session.upsert(&key, &value(key)), Status::Ok);
    }
    let cut = store.log_stats().tail_address;
    for key in 2_000..2_100u64 {
        assert_eq!(session.upsert(&key, &value(key)), Status::Ok);
    }
    assert_eq!(store.flush_and_evict(true), Status::Ok);
    let log_segments = segment_count(&log_dir);
    let object_segments = segment_count(&object_dir);
    assert!(log_dir.join("hlog.0").exists());
    assert!(object_dir.join("objects.0").exists());

    assert!(store.shift_begin_address(cut));
    let stats = store.object_log_stats().unwrap();
    assert!(stats.begin_address > 0, "{stats}");
    assert!(!log_dir.join("hlog.0").exists());
    assert!(!object_dir.join("objects.0").exists());
    assert!(segment_count(&log_dir) < log_segments);
    assert!(segment_count(&object_dir) < object_segments);

    for key in (0..2_000u64).step_by(97) {
        assert_eq!(session.read(&key), Ok(None), "key {key}");
    }
    let mut pending = 0;
    for key in 2_000..2_100u64 {
        match session.read(&key) {
            Ok(found) => assert_eq!(found, Some(value(key))),
            Err(Status::Pending) => pending += 1,
            Err(status) => panic!("read of {key} failed: {status}"),
        }
    }
    assert!(session.complete_pending(true));
    let completed = session.take_completed_reads();
    assert_eq!(completed.len(), pending);
    for read in completed {
        assert_eq!(read.result, Ok(Some(value(read.key))), "key {}", read.key);
    }
}

//! Integration tests for checkpoint and recovery functionality

mod common;

use std::path::Path;
use std::sync::Arc;

use hybridkv::checkpoint::{
    index_data_path, latest_checkpoint, list_checkpoints, log_metadata_path, log_snapshot_path,
    validate_checkpoint, CheckpointError, CheckpointToken, CheckpointType,
};
use hybridkv::codec::{RawBytes, Utf8};
use hybridkv::device::FileSystemDisk;
use hybridkv::status::Status;
use hybridkv::store::{FasterKv, FasterKvConfig, UpdateFn};
use tempfile::tempdir;

type U64Store = FasterKv<u64, u64, FileSystemDisk>;

fn recover_u64(dir: &Path, config: FasterKvConfig, token: CheckpointToken) -> Arc<U64Store> {
    Arc::new(U64Store::recover(config, common::log_device(dir), None, token).unwrap())
}

fn round_trip(kind: CheckpointType) {
    let dir = tempdir().unwrap();
    let config = common::small_config(dir.path()).with_checkpoint_type(kind);

    let token = {
        let store = common::u64_store(dir.path(), config.clone());
        let mut session = store.start_session().unwrap();
        for key in 0..1_000u64 {
            assert_eq!(session.upsert(&key, &(key * 10)), Status::Ok);
        }
        for key in (0..1_000u64).step_by(10) {
            assert_eq!(session.delete(&key), Status::Ok);
        }
        // The first RMW of a key stores the initial value as is.
        let mut add = UpdateFn::new(1u64, |v: &mut u64| *v += 1);
        for key in 1_000..1_100u64 {
            session.rmw(&key, &mut add);
            session.rmw(&key, &mut add);
        }

        let token = store.checkpoint().unwrap();
        assert!(store.complete_checkpoint(true).unwrap());
        assert_eq!(store.last_checkpoint(), Some(token));

        // Not part of the checkpoint.
        for key in 0..100u64 {
            session.upsert(&key, &u64::MAX);
        }
        session.upsert(&5_000, &5_000);
        token
    };

    let store = recover_u64(dir.path(), config, token);
    assert_eq!(store.last_checkpoint(), Some(token));
    let mut session = store.start_session().unwrap();
    let mut pending = 0;
    for key in 0..1_000u64 {
        let expected = if key % 10 == 0 { None } else { Some(key * 10) };
        match session.read(&key) {
            Ok(value) => assert_eq!(value, expected, "key {key}"),
            Err(Status::Pending) => pending += 1,
            Err(status) => panic!("read of {key} failed: {status}"),
        }
    }
    assert!(session.complete_pending(true));
    let completed = session.take_completed_reads();
    assert_eq!(completed.len(), pending);
    for read in completed {
        let expected = if read.key % 10 == 0 { None } else { Some(read.key * 10) };
        assert_eq!(read.result, Ok(expected), "key {}", read.key);
    }
    for key in 1_000..1_100u64 {
        assert_eq!(session.read(&key), Ok(Some(2)));
    }
    assert_eq!(session.read(&5_000), Ok(None));

    // The recovered store keeps working.
    session.upsert(&5_000, &1);
    assert_eq!(session.read(&5_000), Ok(Some(1)));
    assert!(store.version() > 1);
}

#[test]
fn test_snapshot_round_trip() {
    common::init_tracing();
    round_trip(CheckpointType::Snapshot);
}

#[test]
fn test_fold_over_round_trip() {
    common::init_tracing();
    round_trip(CheckpointType::FoldOver);
}

#[test]
fn test_round_trip_after_eviction() {
    let dir = tempdir().unwrap();
    let config = FasterKvConfig {
        log_memory_size: 1 << 16,
        ..common::small_config(dir.path())
    };

    let token = {
        let store = common::u64_store(dir.path(), config.clone());
        let mut session = store.start_session().unwrap();
        for key in 0..10_000u64 {
            session.upsert(&key, &(key + 7));
        }
        assert!(store.log_stats().head_address.control() > 64);
        store.take_full_checkpoint(CheckpointType::Snapshot).unwrap()
    };

    let store = recover_u64(dir.path(), config, token);
    let mut session = store.start_session().unwrap();
    for key in (0..10_000u64).step_by(37) {
        match session.read(&key) {
            Ok(value) => assert_eq!(value, Some(key + 7)),
            Err(Status::Pending) => {}
            Err(status) => panic!("{status}"),
        }
    }
    assert!(session.complete_pending(true));
    for read in session.take_completed_reads() {
        assert_eq!(read.result, Ok(Some(read.key + 7)));
    }
}

fn large_value(seed: u8, len: usize) -> RawBytes {
    RawBytes::from((0..len).map(|i| seed.wrapping_add(i as u8)).collect::<Vec<u8>>())
}

fn large_value_round_trip(kind: CheckpointType) {
    let dir = tempdir().unwrap();
    let config = common::small_config(dir.path()).with_checkpoint_type(kind);
    type Store = FasterKv<Utf8, RawBytes, FileSystemDisk>;

    let token = {
        let store = Arc::new(
            Store::with_object_log(config.clone(), common::log_device(dir.path()), common::object_device(dir.path()))
                .unwrap(),
        );
        let mut session = store.start_session().unwrap();
        for i in 0..40u8 {
            let key = Utf8::from(format!("object-{i}"));
            assert_eq!(session.upsert(&key, &large_value(i, 10_000 + i as usize * 100)), Status::Ok);
        }
        session.delete(&Utf8::from("object-3"));
        store.checkpoint().unwrap()
    };

    let store = Arc::new(
        Store::recover(
            config,
            common::log_device(dir.path()),
            Some(common::object_device(dir.path())),
            token,
        )
        .unwrap(),
    );
    let mut session = store.start_session().unwrap();
    for i in 0..40u8 {
        let key = Utf8::from(format!("object-{i}"));
        let expected = (i != 3).then(|| large_value(i, 10_000 + i as usize * 100));
        match session.read(&key) {
            Ok(value) => assert_eq!(value, expected, "{}", key.as_str()),
            Err(Status::Pending) => {}
            Err(status) => panic!("{status}"),
        }
    }
    assert!(session.complete_pending(true));
    for read in session.take_completed_reads() {
        let i: u8 = read.key.as_str()["object-".len()..].parse().unwrap();
        let expected = (i != 3).then(|| large_value(i, 10_000 + i as usize * 100));
        assert_eq!(read.result, Ok(expected));
    }
}

#[test]
fn test_snapshot_round_trip_large_values() {
    large_value_round_trip(CheckpointType::Snapshot);
}

#[test]
fn test_fold_over_round_trip_large_values() {
    large_value_round_trip(CheckpointType::FoldOver);
}

#[test]
fn test_sessions_resume_from_checkpointed_serial() {
    let dir = tempdir().unwrap();
    let config = common::small_config(dir.path());

    let (token, guid) = {
        let store = common::u64_store(dir.path(), config.clone());
        let mut session = store.start_session().unwrap();
        for key in 0..25u64 {
            session.upsert(&key, &key);
        }
        let token = store.checkpoint().unwrap();
        session.upsert(&100, &100);
        assert_eq!(session.serial_num(), 26);
        (token, session.guid())
    };

    let info = latest_checkpoint(&config.checkpoint_dir).unwrap();
    assert_eq!(info.token, token);
    assert_eq!(info.log.session_serial(guid), Some(25));

    let store = recover_u64(dir.path(), config, token);
    assert_eq!(store.recovered_serial(guid), Some(25));
    let mut session = store.continue_session(guid).unwrap();
    assert_eq!(session.guid(), guid);
    assert_eq!(session.serial_num(), 25);
    assert!(matches!(store.continue_session(guid), Err(Status::InvalidOperation)));

    session.upsert(&100, &100);
    assert_eq!(session.serial_num(), 26);
}

#[test]
fn test_list_and_latest_checkpoints() {
    let dir = tempdir().unwrap();
    let config = common::small_config(dir.path());
    let store = common::u64_store(dir.path(), config.clone());
    let mut session = store.start_session().unwrap();

    assert!(list_checkpoints(&config.checkpoint_dir).is_empty());
    let mut tokens = Vec::new();
    for round in 0..3u64 {
        session.upsert(&round, &round);
        tokens.push(store.checkpoint().unwrap());
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let listed = list_checkpoints(&config.checkpoint_dir);
    assert_eq!(listed.len(), 3);
    let latest = latest_checkpoint(&config.checkpoint_dir).unwrap();
    assert_eq!(latest.token, tokens[2]);
    assert!(latest.version() > listed.iter().map(|c| c.version()).min().unwrap());
    for token in tokens {
        validate_checkpoint(&config.checkpoint_dir, token).unwrap();
    }
}

#[test]
fn test_corrupt_artifacts_fail_recovery() {
    let dir = tempdir().unwrap();
    let config = common::small_config(dir.path());
    let token = {
        let store = common::u64_store(dir.path(), config.clone());
        let mut session = store.start_session().unwrap();
        for key in 0..100u64 {
            session.upsert(&key, &key);
        }
        store.take_full_checkpoint(CheckpointType::Snapshot).unwrap()
    };
    let cp_dir = config.checkpoint_dir.join(token.to_string());

    common::corrupt_byte_at(&index_data_path(&cp_dir), 20).unwrap();
    let result = U64Store::recover(config.clone(), common::log_device(dir.path()), None, token);
    assert!(matches!(result, Err(CheckpointError::ChecksumMismatch { .. })));

    // Undo, then damage the snapshot.
    common::corrupt_byte_at(&index_data_path(&cp_dir), 20).unwrap();
    let snapshot = log_snapshot_path(&cp_dir);
    let len = std::fs::metadata(&snapshot).unwrap().len();
    common::corrupt_byte_at(&snapshot, len / 2).unwrap();
    assert!(U64Store::recover(config.clone(), common::log_device(dir.path()), None, token).is_err());

    std::fs::remove_file(log_metadata_path(&cp_dir)).unwrap();
    assert!(U64Store::recover(config.clone(), common::log_device(dir.path()), None, token).is_err());

    let missing = U64Store::recover(config, common::log_device(dir.path()), None, uuid::Uuid::new_v4());
    assert!(matches!(missing, Err(CheckpointError::MissingArtifact { .. })));
}

#[test]
fn test_recover_rejects_mismatched_page_size() {
    let dir = tempdir().unwrap();
    let config = common::small_config(dir.path());
    let token = {
        let store = common::u64_store(dir.path(), config.clone());
        let mut session = store.start_session().unwrap();
        session.upsert(&1, &1);
        store.checkpoint().unwrap()
    };

    let other = config.with_page_size_bits(13);
    let result = U64Store::recover(other, common::log_device(dir.path()), None, token);
    assert!(matches!(result, Err(CheckpointError::Incompatible(_))));
}

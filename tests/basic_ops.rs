//! Basic operation tests for hybridkv
//!
//! This module contains integration tests for basic KV operations.

mod common;

use std::sync::Arc;

use hybridkv::device::NullDisk;
use hybridkv::status::Status;
use hybridkv::store::{FasterKv, FasterKvConfig, UpdateFn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Create a test store
fn create_store() -> Arc<FasterKv<u64, u64, NullDisk>> {
    common::init_tracing();
    let config = FasterKvConfig::new(1024, 1 << 24).with_page_size_bits(14);
    Arc::new(FasterKv::new(config, NullDisk::new()).unwrap())
}

#[test]
fn test_basic_upsert_read() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.upsert(&42, &100), Status::Ok);
    assert_eq!(session.read(&42), Ok(Some(100)));
}

#[test]
fn test_read_nonexistent() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    for key in 0..100u64 {
        session.upsert(&key, &key);
    }
    // Past the largest inserted key.
    assert_eq!(session.read(&100), Ok(None));
    assert_eq!(session.read(&u64::MAX), Ok(None));
}

#[test]
fn test_update_existing() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&42, &100);
    assert_eq!(session.read(&42), Ok(Some(100)));

    session.upsert(&42, &200);
    assert_eq!(session.read(&42), Ok(Some(200)));
}

#[test]
fn test_delete_then_reinsert() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&42, &100);
    assert_eq!(session.delete(&42), Status::Ok);
    assert_eq!(session.read(&42), Ok(None));
    assert_eq!(session.delete(&42), Status::NotFound);
    assert_eq!(session.delete(&43), Status::NotFound);

    session.upsert(&42, &300);
    assert_eq!(session.read(&42), Ok(Some(300)));
}

#[test]
fn test_rmw_twice_doubles_single_value() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    let mut once = UpdateFn::new(7u64, |v: &mut u64| *v += 7);
    assert_eq!(session.rmw(&1, &mut once), Status::Ok);
    let single = session.read(&1).unwrap().unwrap();

    let mut twice = UpdateFn::new(7u64, |v: &mut u64| *v += 7);
    assert_eq!(session.rmw(&2, &mut twice), Status::Ok);
    assert_eq!(session.rmw(&2, &mut twice), Status::Ok);
    assert_eq!(session.read(&2), Ok(Some(2 * single)));
}

#[test]
fn test_random_workload_matches_model() {
    let store = create_store();
    let mut session = store.start_session().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model = std::collections::HashMap::new();

    for _ in 0..20_000 {
        let key = rng.gen_range(0..500u64);
        match rng.gen_range(0..4) {
            0 => {
                let value = rng.gen::<u64>();
                assert_eq!(session.upsert(&key, &value), Status::Ok);
                model.insert(key, value);
            }
            1 => {
                let expected = if model.remove(&key).is_some() {
                    Status::Ok
                } else {
                    Status::NotFound
                };
                assert_eq!(session.delete(&key), expected);
            }
            2 => {
                let mut add = UpdateFn::new(1u64, |v: &mut u64| *v = v.wrapping_add(1));
                assert_eq!(session.rmw(&key, &mut add), Status::Ok);
                let entry = model.entry(key).or_insert(0);
                *entry = entry.wrapping_add(1);
            }
            _ => {
                assert_eq!(session.read(&key), Ok(model.get(&key).copied()));
            }
        }
    }

    for key in 0..500u64 {
        assert_eq!(session.read(&key), Ok(model.get(&key).copied()));
    }
    let stats = store.stats();
    assert!(stats.total_operations() >= 20_000);
}

#[test]
fn test_stats_count_operations() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&1, &1);
    session.read(&1).unwrap();
    session.read(&2).unwrap();
    session.delete(&1);

    let stats = store.stats();
    assert_eq!(stats.upserts, 1);
    assert_eq!(stats.reads, 2);
    assert_eq!(stats.read_hits, 1);
    assert_eq!(stats.deletes, 1);

    store.reset_stats();
    assert_eq!(store.stats().total_operations(), 0);
}

#[test]
fn test_index_and_log_stats() {
    let store = create_store();
    let mut session = store.start_session().unwrap();
    let before = store.log_stats().tail_address;
    for key in 0..100u64 {
        session.upsert(&key, &key);
    }
    assert!(store.log_stats().tail_address > before);
    let index = store.index_stats();
    assert_eq!(index.table_size, 1024);
    assert!(index.used_entries > 0);
    assert!(!store.log_stats().to_string().is_empty());
}

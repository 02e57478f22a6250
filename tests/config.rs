//! Loading store configuration from TOML files and environment overrides

mod common;

use std::env;
use std::fs;
use std::sync::{Arc, Mutex};

use hybridkv::checkpoint::CheckpointType;
use hybridkv::config::{ConfigError, HybridKvConfig, CONFIG_ENV_VAR};
use hybridkv::status::Status;
use hybridkv::store::FasterKv;
use tempfile::tempdir;

// Tests in this binary share the process environment.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("hybridkv.toml");
    let contents = format!(
        r#"
[store]
table_size = 1024
log_memory_size = 1048576
page_size_bits = 12

[checkpoint]
dir = "{checkpoints}"
type = "fold_over"

[device]
kind = "single_file"
path = "{log}"
"#,
        checkpoints = dir.join("cp").display(),
        log = dir.join("hlog.dat").display(),
    );
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_store_from_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    common::init_tracing();
    let dir = tempdir().unwrap();
    let config = HybridKvConfig::load_from_path(write_config(dir.path())).unwrap();

    let kv_config = config.to_faster_kv_config().unwrap();
    assert_eq!(kv_config.table_size, 1024);
    assert_eq!(kv_config.checkpoint_type, CheckpointType::FoldOver);
    let (device, objects) = config.open_device().unwrap().unwrap();
    assert!(objects.is_none());

    let token = {
        let store = Arc::new(FasterKv::<u64, u64, _>::new(kv_config.clone(), device).unwrap());
        let mut session = store.start_session().unwrap();
        assert_eq!(session.upsert(&1, &11), Status::Ok);
        store.checkpoint().unwrap()
    };
    assert!(dir.path().join("cp").join(token.to_string()).is_dir());

    let (device, _) = config.open_device().unwrap().unwrap();
    let store = Arc::new(FasterKv::<u64, u64, _>::recover(kv_config, device, None, token).unwrap());
    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&1), Ok(Some(11)));
}

#[test]
fn test_env_file_and_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = tempdir().unwrap();
    let path = write_config(dir.path());

    env::set_var(CONFIG_ENV_VAR, &path);
    env::set_var("HYBRIDKV__STORE__TABLE_SIZE", "4096");
    env::set_var("HYBRIDKV__checkpoint__type", "snapshot");
    let loaded = HybridKvConfig::load_from_env();
    env::remove_var(CONFIG_ENV_VAR);
    env::remove_var("HYBRIDKV__STORE__TABLE_SIZE");
    env::remove_var("HYBRIDKV__checkpoint__type");

    let kv_config = loaded.unwrap().to_faster_kv_config().unwrap();
    assert_eq!(kv_config.table_size, 4096);
    assert_eq!(kv_config.page_size_bits, 12);
    assert_eq!(kv_config.checkpoint_type, CheckpointType::Snapshot);
}

#[test]
fn test_invalid_override_is_reported() {
    let _guard = ENV_LOCK.lock().unwrap();

    env::set_var("HYBRIDKV__store__mutable_fraction", "most");
    let loaded = HybridKvConfig::load_from_env();
    env::remove_var("HYBRIDKV__store__mutable_fraction");
    assert!(matches!(loaded, Err(ConfigError::InvalidValue { .. })));

    env::set_var("HYBRIDKV__store__mutable_fraction", "1.5");
    let loaded = HybridKvConfig::load_from_env().unwrap();
    env::remove_var("HYBRIDKV__store__mutable_fraction");
    assert!(loaded.to_faster_kv_config().is_err());
}

#[test]
fn test_unknown_file_keys_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[store]\ntable_sise = 16\n").unwrap();

    assert!(matches!(
        HybridKvConfig::load_from_path(&path),
        Err(ConfigError::Toml(_))
    ));
    assert!(matches!(
        HybridKvConfig::load_from_path(dir.path().join("missing.toml")),
        Err(ConfigError::Io(_))
    ));
}

//! Configuration loading helpers.
//!
//! A TOML file with `[store]`, `[checkpoint]` and `[device]` sections, named by the
//! `HYBRIDKV_CONFIG` environment variable, overridden key by key through
//! `HYBRIDKV__<section>__<field>` variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::checkpoint::CheckpointType;
use crate::device::FileSystemDisk;
use crate::store::FasterKvConfig;

/// Names the configuration file.
pub const CONFIG_ENV_VAR: &str = "HYBRIDKV_CONFIG";
/// Prefix of per-key environment overrides.
pub const ENV_OVERRIDE_PREFIX: &str = "HYBRIDKV__";

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HybridKvConfig {
    /// Store configuration.
    pub store: Option<StoreConfig>,
    /// Checkpoint configuration.
    pub checkpoint: Option<CheckpointConfigSpec>,
    /// Device configuration.
    pub device: Option<DeviceConfigSpec>,
}

impl HybridKvConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `HYBRIDKV_CONFIG` env var (if set),
    /// then apply `HYBRIDKV__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_ENV_VAR).ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix(ENV_OVERRIDE_PREFIX) else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["store", "table_size"] => {
                    self.store_mut().table_size = Some(parse_value(&key, &value)?);
                }
                ["store", "log_memory_size"] => {
                    self.store_mut().log_memory_size = Some(parse_value(&key, &value)?);
                }
                ["store", "page_size_bits"] => {
                    self.store_mut().page_size_bits = Some(parse_value(&key, &value)?);
                }
                ["store", "mutable_fraction"] => {
                    self.store_mut().mutable_fraction = Some(parse_value(&key, &value)?);
                }
                ["store", "auto_grow"] => {
                    self.store_mut().auto_grow = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "dir"] => {
                    self.checkpoint_mut().dir = Some(PathBuf::from(value));
                }
                ["checkpoint", "type"] => {
                    self.checkpoint_mut().checkpoint_type = Some(value);
                }
                ["device", "kind"] => {
                    self.device_mut().kind = Some(value);
                }
                ["device", "path"] => {
                    self.device_mut().path = Some(PathBuf::from(value));
                }
                ["device", "object_path"] => {
                    self.device_mut().object_path = Some(PathBuf::from(value));
                }
                ["device", "base_dir"] => {
                    self.device_mut().base_dir = Some(PathBuf::from(value));
                }
                ["device", "segment_size"] => {
                    self.device_mut().segment_size = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a `FasterKvConfig` using defaults plus overrides.
    pub fn to_faster_kv_config(&self) -> Result<FasterKvConfig, ConfigError> {
        let mut config = FasterKvConfig::default();
        if let Some(store) = &self.store {
            store.apply_to(&mut config);
        }
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.apply_to(&mut config)?;
        }
        config.validate().map_err(|status| ConfigError::InvalidValue {
            key: "store".into(),
            value: status.to_string(),
        })?;
        Ok(config)
    }

    /// Resolve a device configuration, if present.
    pub fn device_config(&self) -> Result<Option<DeviceConfig>, ConfigError> {
        match self.device.as_ref() {
            Some(spec) => Ok(Some(spec.resolve()?)),
            None => Ok(None),
        }
    }

    /// Open the log device and, when configured, the object log device.
    pub fn open_device(&self) -> Result<Option<(FileSystemDisk, Option<FileSystemDisk>)>, ConfigError> {
        match self.device_config()? {
            Some(device) => Ok(Some(device.open()?)),
            None => Ok(None),
        }
    }

    fn store_mut(&mut self) -> &mut StoreConfig {
        self.store.get_or_insert_with(StoreConfig::default)
    }

    fn checkpoint_mut(&mut self) -> &mut CheckpointConfigSpec {
        self.checkpoint.get_or_insert_with(CheckpointConfigSpec::default)
    }

    fn device_mut(&mut self) -> &mut DeviceConfigSpec {
        self.device.get_or_insert_with(DeviceConfigSpec::default)
    }
}

/// Store configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Initial hash table size.
    pub table_size: Option<u64>,
    /// Log memory size in bytes.
    pub log_memory_size: Option<u64>,
    /// Log page size bits.
    pub page_size_bits: Option<u32>,
    /// Mutable fraction of log memory.
    pub mutable_fraction: Option<f64>,
    /// Grow the index automatically under overflow pressure.
    pub auto_grow: Option<bool>,
}

impl StoreConfig {
    fn apply_to(&self, config: &mut FasterKvConfig) {
        if let Some(value) = self.table_size {
            config.table_size = value;
        }
        if let Some(value) = self.log_memory_size {
            config.log_memory_size = value;
        }
        if let Some(value) = self.page_size_bits {
            config.page_size_bits = value;
        }
        if let Some(value) = self.mutable_fraction {
            config.mutable_fraction = value;
        }
        if let Some(value) = self.auto_grow {
            config.grow.auto_grow = value;
        }
    }
}

/// Checkpoint configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfigSpec {
    /// Directory receiving checkpoints.
    pub dir: Option<PathBuf>,
    /// "snapshot" or "fold_over".
    #[serde(rename = "type")]
    pub checkpoint_type: Option<String>,
}

impl CheckpointConfigSpec {
    fn apply_to(&self, config: &mut FasterKvConfig) -> Result<(), ConfigError> {
        if let Some(dir) = &self.dir {
            config.checkpoint_dir = dir.clone();
        }
        if let Some(value) = &self.checkpoint_type {
            config.checkpoint_type =
                value
                    .parse::<CheckpointType>()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "checkpoint.type".into(),
                        value: value.clone(),
                    })?;
        }
        Ok(())
    }
}

/// Device configuration from TOML/env.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfigSpec {
    /// Device kind: "single_file" or "segmented".
    pub kind: Option<String>,
    /// Path of the log file.
    pub path: Option<PathBuf>,
    /// Path of the object log file, for variable-size values.
    pub object_path: Option<PathBuf>,
    /// Directory holding the segments of a segmented device.
    pub base_dir: Option<PathBuf>,
    /// Segment size in bytes for a segmented device.
    pub segment_size: Option<u64>,
}

impl DeviceConfigSpec {
    fn resolve(&self) -> Result<DeviceConfig, ConfigError> {
        let kind = self.kind.as_deref().map(|v| v.to_ascii_lowercase());

        match kind.as_deref() {
            Some("single_file") | None => {
                let path = self
                    .path
                    .clone()
                    .ok_or_else(|| ConfigError::MissingField("device.path".into()))?;
                Ok(DeviceConfig::SingleFile {
                    path,
                    object_path: self.object_path.clone(),
                })
            }
            Some("segmented") => {
                let base_dir = self
                    .base_dir
                    .clone()
                    .ok_or_else(|| ConfigError::MissingField("device.base_dir".into()))?;
                let segment_size = self
                    .segment_size
                    .ok_or_else(|| ConfigError::MissingField("device.segment_size".into()))?;
                if segment_size == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "device.segment_size".into(),
                        value: segment_size.to_string(),
                    });
                }
                Ok(DeviceConfig::Segmented {
                    base_dir,
                    segment_size,
                })
            }
            Some(other) => Err(ConfigError::InvalidValue {
                key: "device.kind".into(),
                value: other.into(),
            }),
        }
    }
}

/// Resolved device configuration.
#[derive(Debug, Clone)]
pub enum DeviceConfig {
    /// Single file device.
    SingleFile {
        /// Path to the log file.
        path: PathBuf,
        /// Path to the object log file.
        object_path: Option<PathBuf>,
    },
    /// Segment files `hlog.<n>` and `objects.<n>` in one directory.
    Segmented {
        /// Directory holding the segments.
        base_dir: PathBuf,
        /// Segment size in bytes.
        segment_size: u64,
    },
}

impl DeviceConfig {
    /// Open the file-based devices described by this config.
    pub fn open(&self) -> Result<(FileSystemDisk, Option<FileSystemDisk>), ConfigError> {
        match self {
            DeviceConfig::SingleFile { path, object_path } => {
                let log = FileSystemDisk::single_file(path)?;
                let objects = object_path
                    .as_ref()
                    .map(FileSystemDisk::single_file)
                    .transpose()?;
                Ok((log, objects))
            }
            DeviceConfig::Segmented {
                base_dir,
                segment_size,
            } => {
                let log = FileSystemDisk::segmented(base_dir, "hlog", *segment_size)?;
                let objects = FileSystemDisk::segmented(base_dir, "objects", *segment_size)?;
                Ok((log, Some(objects)))
            }
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

//! Checkpoint metadata

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::CheckpointToken;

/// How the log part of a checkpoint is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub enum CheckpointType {
    /// Copy in-memory pages into a separate snapshot file.
    #[default]
    Snapshot,
    /// Flush the log up to the cut and record only addresses.
    FoldOver,
}

impl CheckpointType {
    /// Name used in configuration files.
    pub const fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::Snapshot => "snapshot",
            CheckpointType::FoldOver => "fold_over",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "snapshot" => Ok(CheckpointType::Snapshot),
            "fold_over" | "foldover" => Ok(CheckpointType::FoldOver),
            other => Err(format!("unknown checkpoint type `{other}`")),
        }
    }
}

/// Index metadata for checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Checkpoint token
    pub token: CheckpointToken,
    /// Store version when the index image was taken
    pub version: u32,
    /// Hash table size (number of buckets)
    pub table_size: u64,
    /// Overflow buckets in the image
    pub overflow_buckets: u64,
    /// Non-empty entries at the time of the image
    pub num_entries: u64,
    /// Bytes in `index.dat`
    pub num_bytes: u64,
    /// Begin address when the image was taken
    pub log_begin_address: Address,
    /// Tail address before the image was taken; replay starts here
    pub checkpoint_start_address: Address,
}

impl IndexMetadata {
    /// Create empty metadata for `token`.
    pub fn with_token(token: CheckpointToken) -> Self {
        Self {
            token,
            version: 0,
            table_size: 0,
            overflow_buckets: 0,
            num_entries: 0,
            num_bytes: 0,
            log_begin_address: Address::INVALID,
            checkpoint_start_address: Address::INVALID,
        }
    }
}

/// Session state for checkpoint persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Session GUID
    pub guid: Uuid,
    /// Serial number of the last operation included in the checkpoint
    pub serial_num: u64,
}

impl SessionState {
    /// Create a new session state
    pub fn new(guid: Uuid, serial_num: u64) -> Self {
        Self { guid, serial_num }
    }
}

/// Log metadata for checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Checkpoint token
    pub token: CheckpointToken,
    /// How the log was persisted
    pub checkpoint_type: CheckpointType,
    /// Version captured by the checkpoint; records of later versions are discarded
    pub version: u32,
    /// log2 of the page size the log was written with
    pub page_size_bits: u32,
    /// Begin address at the cut
    pub begin_address: Address,
    /// Head address at the cut; the snapshot starts here
    pub head_address: Address,
    /// Tail address at the cut
    pub final_address: Address,
    /// Flushed-until address at the cut
    pub flushed_until_address: Address,
    /// Object-log tail, when the store keeps values in an object log
    #[serde(default)]
    pub object_log_tail: Option<u64>,
    /// Milliseconds since the Unix epoch when the checkpoint completed
    #[serde(default)]
    pub timestamp_ms: u64,
    /// Sessions active at the cut
    #[serde(default)]
    pub session_states: Vec<SessionState>,
}

impl LogMetadata {
    /// Create empty metadata for `token`.
    pub fn with_token(token: CheckpointToken, checkpoint_type: CheckpointType) -> Self {
        Self {
            token,
            checkpoint_type,
            version: 0,
            page_size_bits: 0,
            begin_address: Address::INVALID,
            head_address: Address::INVALID,
            final_address: Address::INVALID,
            flushed_until_address: Address::INVALID,
            object_log_tail: None,
            timestamp_ms: 0,
            session_states: Vec::new(),
        }
    }

    /// Serial number checkpointed for session `guid`.
    pub fn session_serial(&self, guid: Uuid) -> Option<u64> {
        self.session_states
            .iter()
            .find(|state| state.guid == guid)
            .map(|state| state.serial_num)
    }
}

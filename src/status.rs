//! Status codes returned by store operations
//!
//! Operations report outcomes as values rather than panics so callers can tell a miss
//! (`NotFound`) from a read that must be drained later (`Pending`) from a real failure.

use std::fmt;

/// Status code returned by store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u8)]
pub enum Status {
    /// Operation completed; any output is valid.
    #[default]
    Ok = 0,
    /// Disk I/O is required; drain completions before trusting the output.
    Pending = 1,
    /// Key absent, deleted, or truncated below the begin address.
    NotFound = 2,
    /// The in-memory log has no room for the allocation.
    OutOfMemory = 3,
    /// The backing device failed.
    IoError = 4,
    /// Persisted bytes failed validation.
    Corruption = 5,
    /// The operation was refused (e.g. conditional insert of an existing key).
    Aborted = 6,
    /// Invalid argument.
    InvalidArgument = 7,
    /// Operation not valid in the current store state.
    InvalidOperation = 8,
}

impl Status {
    /// Check if the status indicates success.
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the operation went pending.
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }

    /// Check if the key was not found.
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status is a failure (neither a result nor pending).
    #[inline]
    pub const fn is_error(&self) -> bool {
        !matches!(self, Status::Ok | Status::Pending | Status::NotFound)
    }

    /// Name of the status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Pending => "Pending",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::Aborted => "Aborted",
            Status::InvalidArgument => "InvalidArgument",
            Status::InvalidOperation => "InvalidOperation",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Status {}

impl From<std::io::Error> for Status {
    fn from(_: std::io::Error) -> Self {
        Status::IoError
    }
}

/// Kind of operation, used in logs and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationType {
    /// Point read.
    Read,
    /// Read-modify-write.
    Rmw,
    /// Blind write.
    Upsert,
    /// Tombstone append.
    Delete,
    /// Insert only when absent.
    ConditionalInsert,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Read => write!(f, "Read"),
            OperationType::Rmw => write!(f, "RMW"),
            OperationType::Upsert => write!(f, "Upsert"),
            OperationType::Delete => write!(f, "Delete"),
            OperationType::ConditionalInsert => write!(f, "ConditionalInsert"),
        }
    }
}

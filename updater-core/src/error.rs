//! Error types for the installer and its collaborators

use std::io;

use thiserror::Error;

/// Failure reported by the removable storage gateway
#[derive(Debug, Error)]
#[error("{operation} failed on {path}")]
pub struct StorageError {
    pub operation: &'static str,
    pub path: String,
    #[source]
    pub source: io::Error,
}

impl StorageError {
    pub fn new(operation: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        Self {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Failure reported by the partition table or flash write transaction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name} ({code})")]
pub struct PartitionError {
    /// Platform error code, `esp_err_t` on the device
    pub code: i32,
    pub name: String,
}

impl PartitionError {
    pub fn new(code: i32, name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("no staged image at {path}")]
    NotFound { path: String },

    #[error("failed to open {path}")]
    OpenFailed {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("{path} is empty")]
    EmptyImage { path: String },

    #[error("no update partition available")]
    NoPartitionAvailable,

    #[error("image of {image} bytes does not fit partition {label} ({capacity} bytes)")]
    CapacityExceeded {
        label: String,
        image: u64,
        capacity: u64,
    },

    #[error("begin write failed")]
    BeginFailed(#[source] PartitionError),

    #[error("read error at offset {offset}")]
    ReadError {
        offset: u64,
        #[source]
        source: Option<io::Error>,
    },

    #[error("write error at offset {offset}")]
    WriteError {
        offset: u64,
        #[source]
        source: PartitionError,
    },

    #[error("finalize failed")]
    FinalizeError(#[source] PartitionError),

    #[error("set boot partition failed")]
    CommitError(#[source] PartitionError),

    #[error("failed to rename {from} to {to}")]
    MarkRenameFailed {
        from: String,
        to: String,
        #[source]
        source: StorageError,
    },

    #[error("invalid installer config: {0}")]
    InvalidConfig(String),
}

impl InstallError {
    /// "Nothing staged" is the normal boot path, not a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, InstallError::NotFound { .. })
    }
}

//! Error types for the swarm runtime
//!
//! Domain errors use thiserror; startup and the binaries use anyhow.
//! Nothing in here is fatal on its own: the service turns protocol errors
//! into `error` events and the supervisors log resource errors and carry on.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::entity::EntityId;

/// Errors raised while interpreting a command record
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Modern hierarchical operation name with no mapping
    #[error("unknown op {0}")]
    UnknownOp(String),

    /// Legacy flat command name with no mapping
    #[error("unknown cmd {0}")]
    UnknownCmd(String),

    /// Required field absent
    #[error("missing field {0}")]
    MissingField(&'static str),

    /// Field present but not parseable for its type
    #[error("invalid value for {field}: {value}")]
    InvalidValue {
        /// Field name as it appeared on the wire
        field: &'static str,
        /// Offending raw value
        value: String,
    },

    /// Behavior name outside the known set
    #[error("unknown behavior {0}")]
    UnknownBehavior(String),

    /// Debug display mode outside the known set
    #[error("unknown mode {0}")]
    UnknownMode(String),

    /// Command addressed an id with no live entity
    #[error("no entity with id {0}")]
    UnknownEntity(EntityId),
}

/// Entity store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The configured entity bound was reached
    #[error("entity limit reached ({0})")]
    Full(usize),
}

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// Settings file error
    #[error("Settings file error: {0}")]
    Settings(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Script supervision errors
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The private channel could not be bound
    #[error("failed to create script channel for {id}: {source}")]
    CreateChannel {
        /// Owning entity
        id: EntityId,
        /// Underlying socket error
        source: io::Error,
    },

    /// The subprocess could not be spawned
    #[error("failed to launch script for {id}: {source}")]
    Launch {
        /// Owning entity
        id: EntityId,
        /// Underlying spawn error
        source: io::Error,
    },

    /// A scripted entity was created without a script path
    #[error("entity {0} has no script path")]
    MissingScript(EntityId),
}

impl ScriptError {
    /// Short code carried by `scriptError` events.
    pub fn code(&self) -> &'static str {
        match self {
            ScriptError::CreateChannel { .. } => "createPipe",
            ScriptError::Launch { .. } => "launchFail",
            ScriptError::MissingScript(_) => "missingScript",
        }
    }
}

//! Error types for the jobgrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A `mutate_runtime` call supplied a stale `resource_version`.
    #[error("version conflict on {job_id}: expected {expected}, current {current}")]
    Conflict {
        job_id: String,
        expected: u64,
        current: u64,
    },

    /// Attempted to overwrite an immutable config version.
    #[error("config version already exists: {0}")]
    VersionExists(String),
}

//! Domain error taxonomy for job operations.
//!
//! Every mutating operation reports failure through `JobError`; the
//! serializable `ErrorKind` tag rides in API responses so callers can
//! distinguish the exact failure kind without string matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobgrid_state::StateError;

/// Result type alias for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Errors a job operation can report.
#[derive(Debug, Error)]
pub enum JobError {
    /// Create targeting an identity that already exists.
    #[error("job already exists: {0}")]
    AlreadyExists(String),

    /// Operation targets an unknown job (or stale workflow).
    #[error("job not found: {0}")]
    NotFound(String),

    /// SLA or instance-count invariant violated, or malformed config.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Malformed identity, out-of-range instance indices, unknown pool.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Stale resource version on a mutating call.
    #[error("conflict: expected resource version {expected}, current {current}")]
    Conflict { expected: u64, current: u64 },

    /// A rolling batch cannot proceed without violating availability
    /// constraints. Retryable, not fatal.
    #[error("admission stalled: {0}")]
    AdmissionStalled(String),

    /// Catch-all for unexpected internal failure.
    #[error("internal error: {0}")]
    Unknown(String),
}

/// Machine-readable tag for `JobError`, carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    InvalidConfig,
    InvalidArgument,
    Conflict,
    AdmissionStalled,
    Unknown,
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            JobError::NotFound(_) => ErrorKind::NotFound,
            JobError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            JobError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            JobError::Conflict { .. } => ErrorKind::Conflict,
            JobError::AdmissionStalled(_) => ErrorKind::AdmissionStalled,
            JobError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

impl From<StateError> for JobError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(id) => JobError::NotFound(id),
            StateError::Conflict {
                expected, current, ..
            } => JobError::Conflict { expected, current },
            // A config-version collision means two writers raced; the loser
            // sees it as a conflict, not corruption.
            StateError::VersionExists(key) => {
                tracing::debug!(%key, "config version collision mapped to conflict");
                JobError::Conflict {
                    expected: 0,
                    current: 0,
                }
            }
            other => JobError::Unknown(other.to_string()),
        }
    }
}

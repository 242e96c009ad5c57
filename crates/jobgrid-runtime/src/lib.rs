//! jobgrid-runtime — the runtime state machine for jobs.
//!
//! Owns the rules that turn per-instance task state into a job-level
//! state, the timestamp discipline (start time set once, completion time
//! on terminal entry), and the domain error taxonomy shared by every
//! mutating operation.
//!
//! # Components
//!
//! - **`machine`** — task-stats aggregation and job state derivation
//! - **`cache`** — best-effort in-memory job mirror (diagnostics only)
//! - **`error`** — `JobError` tagged taxonomy

pub mod cache;
pub mod error;
pub mod machine;

pub use cache::{CachedJob, JobCache};
pub use error::{ErrorKind, JobError, JobResult};
pub use machine::{
    accumulate_usage, apply_task_stats, config_version_stats_of, derive_state, task_stats_of,
};

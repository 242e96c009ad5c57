//! redb table definitions for the jobgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys use zero-padded numeric suffixes so lexicographic
//! iteration order matches numeric order within a prefix.

use redb::TableDefinition;

/// Immutable job config versions keyed by `{job_id}@{version:08}`.
pub const JOB_CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("job_configs");

/// Mutable runtime records keyed by `{job_id}`.
pub const JOB_RUNTIMES: TableDefinition<&str, &[u8]> = TableDefinition::new("job_runtimes");

/// Per-instance task records keyed by `{job_id}:{instance_id:08}`.
pub const TASK_INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("task_instances");

/// Workflow records keyed by `{job_id}:{update_id}`.
pub const WORKFLOWS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");

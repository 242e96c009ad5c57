//! Domain types for the jobgrid state store.
//!
//! These types represent the persisted control-plane state of jobs: the
//! immutable config version chain, the mutable runtime record with its
//! version counters, per-instance task records, and workflow records.
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque unique identifier for a job. Immutable for the job's lifetime.
pub type JobId = String;

/// Opaque identifier for a workflow (rolling operation) generation.
pub type UpdateId = String;

// ── Job configuration ─────────────────────────────────────────────

/// Kind of workload a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Runs to completion; goal state is `Succeeded`.
    Batch,
    /// Long-running; goal state is `Running`.
    Service,
    /// Long-running, one instance per host class; goal state is `Running`.
    Daemon,
}

/// SLA / admission constraints for a job.
///
/// A zero `maximum_running_instances` means "unset" and resolves to the
/// job's instance count at validation time. Violations of
/// `1 <= min <= max <= instance_count` are rejected at admission, never
/// clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaConfig {
    pub priority: u32,
    pub preemptible: bool,
    pub revocable: bool,
    pub minimum_running_instances: u32,
    /// 0 = unset (resolves to instance_count).
    pub maximum_running_instances: u32,
    /// Per-task wall-clock ceiling, enforced by the task supervisor.
    pub max_running_time_secs: u64,
    /// Ceiling on concurrently unavailable instances during rolling ops.
    pub maximum_unavailable_instances: u32,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            preemptible: false,
            revocable: false,
            minimum_running_instances: 1,
            maximum_running_instances: 0,
            max_running_time_secs: 0,
            maximum_unavailable_instances: 1,
        }
    }
}

/// Resource requirements for one task instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

/// Configuration for a task instance (command + resources + env).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub command: String,
    pub resources: ResourceSpec,
    pub env: BTreeMap<String, String>,
}

/// Reference to a secret held by the external secret store.
///
/// Only identifying metadata is ever persisted or returned; the value
/// lives in the secret store and never passes through this control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRef {
    pub id: String,
    /// Mount path inside the task sandbox.
    pub path: String,
}

/// Who wrote a config version, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub version: u64,
    pub author: String,
    /// Unix timestamp (seconds).
    pub updated_at: u64,
}

/// A single immutable version of a job's configuration.
///
/// Versions start at 1 and are written once; updates append a new version
/// rather than mutating an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: JobId,
    pub version: u64,
    pub name: String,
    pub description: String,
    pub job_type: JobType,
    pub owner: String,
    pub owning_team: String,
    pub labels: BTreeMap<String, String>,
    pub instance_count: u32,
    pub sla: SlaConfig,
    /// Applied to every instance without an override.
    pub default_task: TaskConfig,
    /// Per-instance overrides keyed by instance id; lookup falls back to
    /// `default_task` when no key exists. Insertion order carries no meaning.
    pub instance_overrides: BTreeMap<u32, TaskConfig>,
    /// Owning resource-pool path, e.g. `/infra/batch`.
    pub resource_pool: String,
    pub secrets: Vec<SecretRef>,
    pub changelog: ChangeLogEntry,
}

impl JobConfig {
    /// Effective task config for an instance (override or default).
    pub fn task_config(&self, instance_id: u32) -> &TaskConfig {
        self.instance_overrides
            .get(&instance_id)
            .unwrap_or(&self.default_task)
    }
}

// ── Job and task state ────────────────────────────────────────────

/// Lifecycle state of a job, derived from its task instances.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Uninitialized,
    Initialized,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
    /// A kill has been requested but not all tasks are terminal yet.
    Killing,
    /// Terminal and irreversible; the job record is gone.
    Deleted,
    /// Reserved; never assigned by normal operation.
    Unknown,
}

impl JobState {
    /// Terminal states: no further task activity is expected.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Killed | JobState::Deleted
        )
    }

    /// Active states: the job still owns live task instances.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != JobState::Unknown
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Encodes the lifecycle table: `Uninitialized -> Initialized ->
    /// Pending -> Running -> {Succeeded | Failed | Killed}`, with `Killing`
    /// reachable from any non-terminal state and `Deleted` from any
    /// terminal state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (_, same) if self == same => true,
            (Uninitialized, Initialized) => true,
            (Initialized, Pending) => true,
            (Pending, Running) => true,
            (Running, Succeeded | Failed | Killed) => true,
            // Kill requested before convergence.
            (Initialized | Pending | Running | Killing, Killing) => true,
            (Killing, Succeeded | Failed | Killed) => true,
            (Succeeded | Failed | Killed, Deleted) => true,
            _ => false,
        }
    }
}

/// State of a single task instance, as reported by the task layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Launched,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Killed
        )
    }

    /// Available = contributing to the job's running-instance count.
    pub fn is_available(self) -> bool {
        matches!(
            self,
            TaskState::Pending | TaskState::Launched | TaskState::Running
        )
    }
}

// ── Runtime record ────────────────────────────────────────────────

/// Mutable runtime record for a job. One current record per job, mutated
/// in place for the job's life.
///
/// The four internal counters are deliberately independent: config edits,
/// workflow initiation, and state convergence are concurrently driven
/// activities, and flattening them into one counter would force false
/// conflicts between unrelated operations. `resource_version` is the only
/// token exposed to callers and is bumped atomically with any mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub job_id: JobId,
    pub state: JobState,
    /// Target state the reconciliation loop converges `state` toward.
    pub goal_state: JobState,
    /// Unix timestamps (seconds).
    pub creation_time: u64,
    /// Set exactly once, on leaving `Initialized`.
    pub start_time: Option<u64>,
    /// Set on entering a terminal state.
    pub completion_time: Option<u64>,
    /// Histogram of task instances per task state.
    pub task_stats: BTreeMap<TaskState, u32>,
    /// Histogram of task instances per adopted config version.
    pub task_config_version_stats: BTreeMap<u64, u32>,
    /// Resource-kind -> consumed unit-seconds.
    pub resource_usage: BTreeMap<String, f64>,
    /// JobConfig version currently in effect.
    pub configuration_version: u64,
    /// Counts workflow (update_id) generations for this job.
    pub workflow_version: u64,
    /// Increments on every runtime mutation.
    pub state_version: u64,
    /// Set when a new convergence target is requested.
    pub desired_state_version: u64,
    /// Externally visible optimistic-concurrency token.
    pub resource_version: u64,
}

impl RuntimeInfo {
    /// Fresh runtime record for a newly created job (already `Initialized`;
    /// `Uninitialized` exists only before the record is first written).
    pub fn new(job_id: &str, goal_state: JobState, now: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: JobState::Initialized,
            goal_state,
            creation_time: now,
            start_time: None,
            completion_time: None,
            task_stats: BTreeMap::new(),
            task_config_version_stats: BTreeMap::new(),
            resource_usage: BTreeMap::new(),
            configuration_version: 1,
            workflow_version: 0,
            state_version: 1,
            desired_state_version: 0,
            resource_version: 1,
        }
    }

    /// Whether the runtime has converged to its most recent target.
    pub fn converged(&self) -> bool {
        self.state_version >= self.desired_state_version
    }
}

/// Per-instance task record; `RuntimeInfo::task_stats` is the histogram of
/// these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub job_id: JobId,
    pub instance_id: u32,
    pub state: TaskState,
    /// Config version this instance currently runs.
    pub config_version: u64,
    /// True when the instance was killed by user request (distinguishes the
    /// job-level `Killed` outcome from `Failed`).
    pub user_killed: bool,
    pub updated_at: u64,
}

// ── Workflows ─────────────────────────────────────────────────────

/// Half-open range `[from, to)` over instance ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRange {
    pub from: u32,
    pub to: u32,
}

impl InstanceRange {
    pub fn new(from: u32, to: u32) -> Self {
        Self { from, to }
    }

    pub fn len(&self) -> u32 {
        self.to.saturating_sub(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }
}

/// Which rolling operation a workflow executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkflowOp {
    Start,
    Stop,
    Restart,
    /// Reconfigure-then-restart onto a new config version.
    Update { target_config_version: u64 },
}

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Batches are being processed.
    Running,
    /// A batch cannot proceed without violating SLA constraints; the
    /// orchestrator keeps retrying admission. Retryable, not fatal.
    Stalled,
    /// A newer workflow took over; remaining batches were abandoned.
    Superseded,
    Succeeded,
    Failed,
}

/// Record of one rolling operation (the async, batched execution of a
/// Start/Stop/Restart/Update). Exactly one may be current per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub update_id: UpdateId,
    pub job_id: JobId,
    /// Generation counter; mirrors `RuntimeInfo::workflow_version` at
    /// initiation time.
    pub workflow_version: u64,
    pub op: WorkflowOp,
    pub ranges: Vec<InstanceRange>,
    /// 0 = the whole target set as one batch.
    pub batch_size: u32,
    pub state: WorkflowState,
    pub batches_total: u32,
    pub batches_done: u32,
    pub instances_done: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Projections ───────────────────────────────────────────────────

/// Full config + runtime view of a job, returned by Get and Query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub config: JobConfig,
    pub runtime: RuntimeInfo,
}

/// Denormalized listing projection; never carries per-instance overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub name: String,
    pub owner: String,
    pub owning_team: String,
    pub job_type: JobType,
    pub state: JobState,
    pub instance_count: u32,
    pub resource_pool: String,
    pub labels: BTreeMap<String, String>,
    pub creation_time: u64,
    pub completion_time: Option<u64>,
    pub task_stats: BTreeMap<TaskState, u32>,
}

impl JobSummary {
    pub fn project(config: &JobConfig, runtime: &RuntimeInfo) -> Self {
        Self {
            job_id: config.job_id.clone(),
            name: config.name.clone(),
            owner: config.owner.clone(),
            owning_team: config.owning_team.clone(),
            job_type: config.job_type,
            state: runtime.state,
            instance_count: config.instance_count,
            resource_pool: config.resource_pool.clone(),
            labels: config.labels.clone(),
            creation_time: runtime.creation_time,
            completion_time: runtime.completion_time,
            task_stats: runtime.task_stats.clone(),
        }
    }
}

// ── Table keys ────────────────────────────────────────────────────

impl JobConfig {
    /// Build the composite key for the job_configs table.
    pub fn table_key(&self) -> String {
        config_key(&self.job_id, self.version)
    }
}

impl TaskInstance {
    /// Build the composite key for the task_instances table.
    pub fn table_key(&self) -> String {
        instance_key(&self.job_id, self.instance_id)
    }
}

impl WorkflowRecord {
    /// Build the composite key for the workflows table.
    pub fn table_key(&self) -> String {
        workflow_key(&self.job_id, &self.update_id)
    }
}

/// `{job_id}@{version:08}` — zero-padded so lexicographic order is numeric.
pub fn config_key(job_id: &str, version: u64) -> String {
    format!("{job_id}@{version:08}")
}

/// `{job_id}:{instance_id:08}`.
pub fn instance_key(job_id: &str, instance_id: u32) -> String {
    format!("{job_id}:{instance_id:08}")
}

/// `{job_id}:{update_id}`.
pub fn workflow_key(job_id: &str, update_id: &str) -> String {
    format!("{job_id}:{update_id}")
}

//! REST API handlers.
//!
//! Each handler works through `StateStore`, the orchestrator, or the
//! query index, and returns JSON responses. Errors carry a machine
//! readable `kind` tag next to the human message, so callers never have
//! to string-match.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use jobgrid_query::{QueryResults, QuerySpec};
use jobgrid_runtime::{ErrorKind, JobError, JobResult, apply_task_stats};
use jobgrid_state::{
    InstanceRange, JobConfig, JobInfo, JobState, JobSummary, JobType, RuntimeInfo, StateError,
    TaskInstance, TaskState, UpdateId,
};
use jobgrid_workflow::admission;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        })
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AlreadyExists | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidConfig | ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        // Retryable: the caller should back off and reissue.
        ErrorKind::AdmissionStalled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &JobError) -> axum::response::Response {
    let kind = err.kind();
    (
        status_for(kind),
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
            kind: Some(kind),
        }),
    )
        .into_response()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Lifecycle ──────────────────────────────────────────────────

/// Identity + concurrency token returned by mutating calls.
#[derive(Serialize, Deserialize)]
pub struct JobIdentity {
    pub job_id: String,
    pub resource_version: u64,
}

/// Outcome of a rolling operation: poll the workflow for progress.
#[derive(Serialize, Deserialize)]
pub struct RollingStarted {
    pub job_id: String,
    pub resource_version: u64,
    pub update_id: UpdateId,
}

fn validate_job_id(job_id: &str) -> JobResult<()> {
    let ok = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(JobError::InvalidArgument(format!(
            "job id must be non-empty [A-Za-z0-9._-], got {job_id:?}"
        )))
    }
}

fn create(state: &ApiState, mut config: JobConfig) -> JobResult<(JobConfig, RuntimeInfo)> {
    validate_job_id(&config.job_id)?;
    if config.instance_count == 0 {
        return Err(JobError::InvalidConfig(
            "instance_count must be at least 1".to_string(),
        ));
    }
    admission::validate_sla(&config.sla, config.instance_count)?;

    if state.store.get_runtime(&config.job_id)?.is_some() {
        return Err(JobError::AlreadyExists(config.job_id));
    }

    let now = epoch_secs();
    config.version = 1;
    config.changelog.version = 1;
    if config.changelog.updated_at == 0 {
        config.changelog.updated_at = now;
    }

    // A lost create race surfaces the same way the existence check would.
    state.store.put_config(&config).map_err(|e| match e {
        StateError::VersionExists(_) => JobError::AlreadyExists(config.job_id.clone()),
        other => other.into(),
    })?;

    let goal = match config.job_type {
        JobType::Batch => JobState::Succeeded,
        JobType::Service | JobType::Daemon => JobState::Running,
    };
    let runtime = RuntimeInfo::new(&config.job_id, goal, now);
    state.store.put_runtime(&runtime)?;

    // Instances start pending at v1; their states flow back through the
    // task layer, not from create.
    let instances: Vec<TaskInstance> = (0..config.instance_count)
        .map(|instance_id| TaskInstance {
            job_id: config.job_id.clone(),
            instance_id,
            state: TaskState::Pending,
            config_version: 1,
            user_killed: false,
            updated_at: now,
        })
        .collect();
    state.store.put_instances(&instances)?;

    Ok((config, runtime))
}

/// POST /api/v1/jobs
pub async fn create_job(
    State(state): State<ApiState>,
    Json(config): Json<JobConfig>,
) -> impl IntoResponse {
    match create(&state, config) {
        Ok((config, runtime)) => {
            let identity = JobIdentity {
                job_id: runtime.job_id.clone(),
                resource_version: runtime.resource_version,
            };
            info!(job = %runtime.job_id, "job created");
            state.cache.insert(config, runtime).await;
            (StatusCode::CREATED, ApiResponse::ok(identity)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/jobs/:id
///
/// Secret values never pass through this control plane; the config's
/// `secrets` field carries references only, so nothing needs redacting.
pub async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match load_job(&state, &id) {
        Ok(info) => ApiResponse::ok(info).into_response(),
        Err(e) => error_response(&e),
    }
}

fn load_job(state: &ApiState, job_id: &str) -> JobResult<JobInfo> {
    let runtime = state
        .store
        .get_runtime(job_id)?
        .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
    let config = state
        .store
        .latest_config(job_id)?
        .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
    Ok(JobInfo { config, runtime })
}

/// DELETE /api/v1/jobs/:id
///
/// Only terminal jobs may be deleted; the whole record chain (configs,
/// runtime, instances, workflows) goes at once. Deleting again is
/// NotFound.
pub async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result: JobResult<()> = (|| {
        let runtime = state
            .store
            .get_runtime(&id)?
            .ok_or_else(|| JobError::NotFound(id.clone()))?;
        if !runtime.state.is_terminal() {
            return Err(JobError::InvalidArgument(format!(
                "job {id} is {:?}; stop it before deleting",
                runtime.state
            )));
        }
        state.store.delete_job(&id)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            state.cache.remove(&id).await;
            info!(job = %id, "job deleted");
            ApiResponse::ok("deleted").into_response()
        }
        Err(e) => error_response(&e),
    }
}

// ── Rolling operations ─────────────────────────────────────────

/// Body for start/stop/restart.
#[derive(Deserialize)]
pub struct RollingRequest {
    /// Token from the caller's last read; stale tokens conflict.
    pub resource_version: u64,
    /// Target instance ranges; empty = all instances.
    #[serde(default)]
    pub ranges: Vec<InstanceRange>,
    /// Instances per batch; 0 = one batch.
    #[serde(default)]
    pub batch_size: u32,
}

/// Body for PUT /jobs/:id — a rolling config update.
#[derive(Deserialize)]
pub struct UpdateRequest {
    pub config: JobConfig,
    pub resource_version: u64,
    #[serde(default)]
    pub ranges: Vec<InstanceRange>,
    #[serde(default)]
    pub batch_size: u32,
}

fn rolling_response(
    job_id: &str,
    result: JobResult<(u64, UpdateId)>,
) -> axum::response::Response {
    match result {
        Ok((resource_version, update_id)) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(RollingStarted {
                job_id: job_id.to_string(),
                resource_version,
                update_id,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/v1/jobs/:id/start
pub async fn start_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RollingRequest>,
) -> impl IntoResponse {
    let result = state
        .orchestrator
        .start(&id, req.ranges, req.resource_version, req.batch_size)
        .await;
    rolling_response(&id, result)
}

/// POST /api/v1/jobs/:id/stop
pub async fn stop_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RollingRequest>,
) -> impl IntoResponse {
    let result = state
        .orchestrator
        .stop(&id, req.ranges, req.resource_version, req.batch_size)
        .await;
    rolling_response(&id, result)
}

/// POST /api/v1/jobs/:id/restart
pub async fn restart_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RollingRequest>,
) -> impl IntoResponse {
    let result = state
        .orchestrator
        .restart(&id, req.ranges, req.resource_version, req.batch_size)
        .await;
    rolling_response(&id, result)
}

/// PUT /api/v1/jobs/:id
pub async fn update_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRequest>,
) -> impl IntoResponse {
    let result = state
        .orchestrator
        .update(&id, req.config, req.ranges, req.resource_version, req.batch_size)
        .await;
    rolling_response(&id, result)
}

/// GET /api/v1/jobs/:id/workflows/:update_id
///
/// The path segment is the `wf-N` suffix of the update id (path segments
/// cannot carry the embedded job id).
pub async fn get_workflow(
    State(state): State<ApiState>,
    Path((id, suffix)): Path<(String, String)>,
) -> impl IntoResponse {
    let update_id = format!("{id}/{suffix}");
    match state.orchestrator.workflow_status(&id, &update_id) {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Diagnostics and reads ──────────────────────────────────────

/// POST /api/v1/jobs/:id/refresh
///
/// Reloads authoritative store state into the runtime record: task stats
/// are recomputed from the instance records and the cache entry is
/// replaced.
pub async fn refresh_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result: JobResult<JobInfo> = (|| {
        let instances = state.store.list_instances_for_job(&id)?;
        let now = epoch_secs();
        let runtime = state
            .store
            .mutate_runtime(&id, None, |rt| apply_task_stats(rt, &instances, now))?;
        let config = state
            .store
            .latest_config(&id)?
            .ok_or_else(|| JobError::NotFound(id.clone()))?;
        Ok(JobInfo { config, runtime })
    })();

    match result {
        Ok(info) => {
            state
                .cache
                .insert(info.config.clone(), info.runtime.clone())
                .await;
            ApiResponse::ok(info).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/jobs/:id/cache
///
/// Best-effort snapshot with no freshness guarantee; diagnostics only.
pub async fn get_cached_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.cache.get(&id).await {
        Some(cached) => ApiResponse::ok(cached).into_response(),
        None => error_response(&JobError::NotFound(id)),
    }
}

/// GET /api/v1/jobs/active
///
/// Reads the store, not the index, so a follow-up Get on a returned id
/// cannot miss a live job.
pub async fn active_jobs(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_runtimes() {
        Ok(runtimes) => {
            let ids: Vec<String> = runtimes
                .into_iter()
                .filter(|rt| rt.state.is_active())
                .map(|rt| rt.job_id)
                .collect();
            ApiResponse::ok(ids).into_response()
        }
        Err(e) => error_response(&JobError::from(e)),
    }
}

/// Query results plus pagination metadata.
#[derive(Serialize)]
pub struct QueryResponse {
    pub total_matched: usize,
    pub offset: usize,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<JobInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summaries: Option<Vec<JobSummary>>,
}

/// POST /api/v1/jobs/query
///
/// Served from the index snapshot; may lag the store until the next
/// refresh.
pub async fn query_jobs(
    State(state): State<ApiState>,
    Json(spec): Json<QuerySpec>,
) -> impl IntoResponse {
    match state.index.query(&spec).await {
        Ok(output) => {
            let count = output.results.len();
            let (jobs, summaries) = match output.results {
                QueryResults::Full(jobs) => (Some(jobs), None),
                QueryResults::Summaries(s) => (None, Some(s)),
            };
            ApiResponse::ok(QueryResponse {
                total_matched: output.total_matched,
                offset: output.offset,
                count,
                jobs,
                summaries,
            })
            .into_response()
        }
        Err(e) => error_response(&e),
    }
}

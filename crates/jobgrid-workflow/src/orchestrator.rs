//! Workflow orchestrator — drives rolling operations over jobs.
//!
//! Initiation is synchronous: the optimistic version check, counter bumps,
//! config write (for Update), supersession of any in-flight workflow, and
//! the workflow record all commit before the call returns with the new
//! resource version and update id. Batch execution then proceeds on a
//! per-job tokio task, consulting SLA admission before every batch and
//! folding task-layer acknowledgements back into runtime state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use jobgrid_runtime::{JobCache, JobError, JobResult, apply_task_stats};
use jobgrid_state::{
    InstanceRange, JobConfig, JobId, JobState, JobType, StateStore, TaskInstance, TaskState,
    UpdateId, WorkflowOp, WorkflowRecord, WorkflowState,
};

use crate::actions::{ActionKind, BatchAction, TaskActions};
use crate::admission::{self, Admission, ResolvedSla};
use crate::batch;

/// Tunables for the batch driver.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Backoff between admission retries while a workflow is stalled.
    pub stall_retry: Duration,
    /// Pause between committed batches.
    pub batch_pause: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stall_retry: Duration::from_secs(5),
            batch_pause: Duration::ZERO,
        }
    }
}

/// In-memory handle to a job's running batch driver.
struct DriverHandle {
    update_id: UpdateId,
    cancel: watch::Sender<bool>,
}

/// Orchestrates Start/Stop/Restart/Update as asynchronous, batched,
/// cancellable workflows. One orchestrator serves all jobs; drivers are
/// per-job tasks, so work on different jobs proceeds independently.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    store: StateStore,
    cache: JobCache,
    tasks: Arc<dyn TaskActions>,
    drivers: Arc<RwLock<HashMap<JobId, DriverHandle>>>,
    config: OrchestratorConfig,
}

impl WorkflowOrchestrator {
    pub fn new(store: StateStore, cache: JobCache, tasks: Arc<dyn TaskActions>) -> Self {
        Self {
            store,
            cache,
            tasks,
            drivers: Arc::new(RwLock::new(HashMap::new())),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    // ── Public operations ──────────────────────────────────────────

    /// Start instances (bring stopped instances up).
    pub async fn start(
        &self,
        job_id: &str,
        ranges: Vec<InstanceRange>,
        resource_version: u64,
        batch_size: u32,
    ) -> JobResult<(u64, UpdateId)> {
        self.initiate(job_id, WorkflowOp::Start, ranges, resource_version, batch_size, None)
            .await
    }

    /// Stop instances. A stop covering the full instance set sets the goal
    /// state to `Killed`.
    pub async fn stop(
        &self,
        job_id: &str,
        ranges: Vec<InstanceRange>,
        resource_version: u64,
        batch_size: u32,
    ) -> JobResult<(u64, UpdateId)> {
        self.initiate(job_id, WorkflowOp::Stop, ranges, resource_version, batch_size, None)
            .await
    }

    /// Restart instances in place (stop-then-start).
    pub async fn restart(
        &self,
        job_id: &str,
        ranges: Vec<InstanceRange>,
        resource_version: u64,
        batch_size: u32,
    ) -> JobResult<(u64, UpdateId)> {
        self.initiate(job_id, WorkflowOp::Restart, ranges, resource_version, batch_size, None)
            .await
    }

    /// Update the job config and roll instances onto the new version.
    ///
    /// Writes config version n+1 before the first batch begins; per-batch
    /// adoption is visible in `task_config_version_stats`.
    pub async fn update(
        &self,
        job_id: &str,
        mut new_config: JobConfig,
        ranges: Vec<InstanceRange>,
        resource_version: u64,
        batch_size: u32,
    ) -> JobResult<(u64, UpdateId)> {
        let latest = self
            .store
            .latest_config(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        admission::validate_sla(&new_config.sla, new_config.instance_count)?;

        new_config.job_id = job_id.to_string();
        new_config.version = latest.version + 1;
        new_config.changelog.version = new_config.version;

        let op = WorkflowOp::Update {
            target_config_version: new_config.version,
        };
        self.initiate(job_id, op, ranges, resource_version, batch_size, Some(new_config))
            .await
    }

    /// Poll a workflow by its update id. A superseded workflow reports
    /// `Superseded`, never progress.
    pub fn workflow_status(&self, job_id: &str, update_id: &str) -> JobResult<WorkflowRecord> {
        self.store
            .get_workflow(job_id, update_id)?
            .ok_or_else(|| JobError::NotFound(format!("{job_id}:{update_id}")))
    }

    // ── Initiation ─────────────────────────────────────────────────

    async fn initiate(
        &self,
        job_id: &str,
        op: WorkflowOp,
        ranges: Vec<InstanceRange>,
        resource_version: u64,
        batch_size: u32,
        new_config: Option<JobConfig>,
    ) -> JobResult<(u64, UpdateId)> {
        let latest = self
            .store
            .latest_config(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let target = new_config.as_ref().unwrap_or(&latest);
        let instance_count = target.instance_count;

        // Validation first: no state is touched on InvalidArgument.
        let indices = batch::resolve_ranges(&ranges, instance_count)?;
        let batches = batch::plan_batches(&indices, batch_size);
        let batches_total = batches.len() as u32;
        let full_set = indices.len() as u32 == instance_count;

        let mut sla = admission::validate_sla(&target.sla, instance_count)?;
        // An explicit stop is allowed to take the job below its floor.
        sla.enforce_min = !matches!(op, WorkflowOp::Stop);

        let goal = match op {
            WorkflowOp::Stop if full_set => Some(JobState::Killed),
            WorkflowOp::Stop => None,
            _ => Some(goal_for(target.job_type)),
        };

        // The atomic admission gate: compare-and-increment on the caller's
        // token, plus the counter bumps, in one transaction.
        let op_for_mutate = op.clone();
        let runtime = self.store.mutate_runtime(job_id, Some(resource_version), |rt| {
            rt.workflow_version += 1;
            // Initiation itself plus one convergence step per batch.
            rt.desired_state_version = rt.state_version + 1 + batches_total as u64;
            if let Some(goal) = goal {
                rt.goal_state = goal;
            }
            if let WorkflowOp::Update {
                target_config_version,
            } = op_for_mutate
            {
                rt.configuration_version = target_config_version;
            }
        })?;

        let now = epoch_secs();

        // The OCC gate above serializes updaters, so the version chain
        // cannot race: only the winner reaches this write.
        if let Some(config) = &new_config {
            self.store.put_config(config)?;

            // Grown jobs get fresh pending instances at the new version;
            // shrunk counts leave surplus records for a later targeted Stop.
            if config.instance_count > latest.instance_count {
                let fresh: Vec<TaskInstance> = (latest.instance_count..config.instance_count)
                    .map(|instance_id| TaskInstance {
                        job_id: job_id.to_string(),
                        instance_id,
                        state: jobgrid_state::TaskState::Pending,
                        config_version: config.version,
                        user_killed: false,
                        updated_at: now,
                    })
                    .collect();
                self.store.put_instances(&fresh)?;
            }
        }

        // Supersede any in-flight workflow: its remaining batches are
        // abandoned; committed batches are not rolled back.
        if let Some(mut prev) = self.store.current_workflow(job_id)?
            && matches!(prev.state, WorkflowState::Running | WorkflowState::Stalled)
        {
            prev.state = WorkflowState::Superseded;
            prev.updated_at = now;
            self.store.put_workflow(&prev)?;
            info!(job = %job_id, superseded = %prev.update_id, "workflow superseded");
        }
        {
            let mut drivers = self.drivers.write().await;
            if let Some(handle) = drivers.remove(job_id) {
                let _ = handle.cancel.send(true);
            }
        }

        let update_id = format!("{job_id}/wf-{}", runtime.workflow_version);
        let record = WorkflowRecord {
            update_id: update_id.clone(),
            job_id: job_id.to_string(),
            workflow_version: runtime.workflow_version,
            op: op.clone(),
            ranges,
            batch_size,
            state: WorkflowState::Running,
            batches_total,
            batches_done: 0,
            instances_done: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.put_workflow(&record)?;
        self.cache.update_runtime(&runtime).await;

        info!(
            job = %job_id,
            update_id = %update_id,
            op = ?op,
            batches = batches_total,
            batch_size,
            "workflow initiated"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut drivers = self.drivers.write().await;
            drivers.insert(
                job_id.to_string(),
                DriverHandle {
                    update_id: update_id.clone(),
                    cancel: cancel_tx,
                },
            );
        }

        let driver = Driver {
            store: self.store.clone(),
            cache: self.cache.clone(),
            tasks: self.tasks.clone(),
            drivers: self.drivers.clone(),
            config: self.config,
            record,
            batches,
            sla,
            total: instance_count,
            kind: action_kind_for(&op),
            config_version: match op {
                WorkflowOp::Update {
                    target_config_version,
                } => target_config_version,
                _ => runtime.configuration_version,
            },
        };
        tokio::spawn(driver.run(cancel_rx));

        Ok((runtime.resource_version, update_id))
    }
}

fn goal_for(job_type: JobType) -> JobState {
    match job_type {
        JobType::Batch => JobState::Succeeded,
        JobType::Service | JobType::Daemon => JobState::Running,
    }
}

fn action_kind_for(op: &WorkflowOp) -> ActionKind {
    match op {
        WorkflowOp::Start => ActionKind::Start,
        WorkflowOp::Stop => ActionKind::Stop,
        // Update is reconfigure-then-restart at the instance level.
        WorkflowOp::Restart | WorkflowOp::Update { .. } => ActionKind::Restart,
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Batch driver ───────────────────────────────────────────────────

struct Driver {
    store: StateStore,
    cache: JobCache,
    tasks: Arc<dyn TaskActions>,
    drivers: Arc<RwLock<HashMap<JobId, DriverHandle>>>,
    config: OrchestratorConfig,
    record: WorkflowRecord,
    batches: Vec<Vec<u32>>,
    sla: ResolvedSla,
    total: u32,
    kind: ActionKind,
    config_version: u64,
}

impl Driver {
    async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        let job_id = self.record.job_id.clone();
        let batches = std::mem::take(&mut self.batches);

        for batch in batches {
            if self.process_batch(&batch, &mut cancel).await.is_err() {
                self.detach(&job_id).await;
                return;
            }

            self.record.batches_done += 1;
            self.record.updated_at = epoch_secs();
            if self.persist_record().is_err() {
                self.detach(&job_id).await;
                return;
            }

            if !self.config.batch_pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.batch_pause) => {}
                    _ = cancel.changed() => {
                        debug!(update_id = %self.record.update_id, "driver cancelled between batches");
                        self.detach(&job_id).await;
                        return;
                    }
                }
            }
        }

        // Mark success unless a newer workflow already superseded us.
        match self.store.get_workflow(&job_id, &self.record.update_id) {
            Ok(Some(current)) if current.state == WorkflowState::Running => {
                self.record.state = WorkflowState::Succeeded;
                self.record.updated_at = epoch_secs();
                let _ = self.persist_record();
                info!(update_id = %self.record.update_id, "workflow completed");
            }
            _ => {}
        }
        self.detach(&job_id).await;
    }

    /// Process one planned batch, shrinking per admission as needed.
    /// Returns Err when the driver must exit (cancelled or broken).
    async fn process_batch(
        &mut self,
        batch: &[u32],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ()> {
        let job_id = self.record.job_id.clone();
        let mut queue: Vec<u32> = batch.to_vec();
        let mut stalled = false;

        while !queue.is_empty() {
            if *cancel.borrow() {
                debug!(update_id = %self.record.update_id, "driver cancelled");
                return Err(());
            }

            let instances = match self.store.list_instances_for_job(&job_id) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "driver failed to read instances");
                    return Err(());
                }
            };
            let available: BTreeSet<u32> = instances
                .iter()
                .filter(|t| t.state.is_available())
                .map(|t| t.instance_id)
                .collect();
            // Instances stopped on request are down by intent and leave
            // the availability ledger; otherwise a rolling stop would
            // exhaust its own unavailability budget after the first batch.
            let intentionally_down = instances
                .iter()
                .filter(|t| t.user_killed && t.state == TaskState::Killed)
                .count() as u32;
            let expected_up = self.total.saturating_sub(intentionally_down);

            let admitted = match admission::admit_batch(&queue, &available, expected_up, &self.sla)
            {
                Admission::Full => queue.len(),
                Admission::Shrunk(n) => n,
                Admission::Stalled => {
                    if !stalled {
                        stalled = true;
                        self.record.state = WorkflowState::Stalled;
                        self.record.updated_at = epoch_secs();
                        let _ = self.persist_record();
                        warn!(
                            update_id = %self.record.update_id,
                            "batch admission stalled; parking until availability recovers"
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.stall_retry) => continue,
                        _ = cancel.changed() => return Err(()),
                    }
                }
            };

            if stalled {
                stalled = false;
                self.record.state = WorkflowState::Running;
                self.record.updated_at = epoch_secs();
                let _ = self.persist_record();
            }

            let moving: Vec<u32> = queue.drain(..admitted).collect();
            if self.apply_and_fold(&job_id, &moving, &instances).await.is_err() {
                return Err(());
            }
            self.record.instances_done += moving.len() as u32;
        }

        Ok(())
    }

    /// Hand one admitted sub-batch to the task layer and fold the
    /// acknowledgements into instance records and the runtime record.
    async fn apply_and_fold(
        &mut self,
        job_id: &str,
        moving: &[u32],
        instances: &[TaskInstance],
    ) -> Result<(), ()> {
        let action = BatchAction {
            job_id: job_id.to_string(),
            kind: self.kind,
            instances: moving.to_vec(),
            config_version: self.config_version,
        };

        let acks = match self.tasks.apply(action).await {
            Ok(acks) => acks,
            Err(e) => {
                warn!(update_id = %self.record.update_id, error = %e, "task layer rejected batch");
                self.record.state = WorkflowState::Failed;
                self.record.updated_at = epoch_secs();
                let _ = self.persist_record();
                return Err(());
            }
        };

        let now = epoch_secs();
        let by_id: HashMap<u32, &TaskInstance> =
            instances.iter().map(|t| (t.instance_id, t)).collect();
        let updated: Vec<TaskInstance> = acks
            .iter()
            .map(|ack| TaskInstance {
                job_id: job_id.to_string(),
                instance_id: ack.instance_id,
                state: ack.state,
                // Stopped instances keep the version they last ran.
                config_version: match self.kind {
                    ActionKind::Stop => by_id
                        .get(&ack.instance_id)
                        .map(|t| t.config_version)
                        .unwrap_or(self.config_version),
                    _ => self.config_version,
                },
                user_killed: ack.user_killed,
                updated_at: now,
            })
            .collect();

        if let Err(e) = self.store.put_instances(&updated) {
            warn!(error = %e, "driver failed to persist instance acks");
            return Err(());
        }

        // Re-derive job state from the full instance set under the
        // runtime lock, keeping (state, state_version) consistent.
        let all = match self.store.list_instances_for_job(job_id) {
            Ok(v) => v,
            Err(_) => return Err(()),
        };
        match self
            .store
            .mutate_runtime(job_id, None, |rt| apply_task_stats(rt, &all, now))
        {
            Ok(runtime) => self.cache.update_runtime(&runtime).await,
            Err(e) => {
                warn!(error = %e, "driver failed to update runtime");
                return Err(());
            }
        }
        Ok(())
    }

    /// Persist the driver's record, unless a newer workflow already marked
    /// it superseded (the supersession mark must not be clobbered by a
    /// progress write racing the cancel signal).
    fn persist_record(&self) -> Result<(), ()> {
        match self
            .store
            .get_workflow(&self.record.job_id, &self.record.update_id)
        {
            Ok(Some(current)) if current.state == WorkflowState::Superseded => {
                debug!(update_id = %self.record.update_id, "record superseded; dropping progress write");
                Err(())
            }
            _ => self.store.put_workflow(&self.record).map_err(|e| {
                warn!(error = %e, "driver failed to persist workflow record");
            }),
        }
    }

    /// Drop this driver's registry entry if it is still the current one.
    async fn detach(&self, job_id: &str) {
        let mut drivers = self.drivers.write().await;
        if drivers
            .get(job_id)
            .is_some_and(|h| h.update_id == self.record.update_id)
        {
            drivers.remove(job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{BoxFuture, LocalTaskActions, TaskAck};
    use jobgrid_state::{ChangeLogEntry, RuntimeInfo, SlaConfig, TaskConfig, TaskState};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn test_config(job_id: &str, instances: u32, job_type: JobType) -> JobConfig {
        JobConfig {
            job_id: job_id.to_string(),
            version: 1,
            name: job_id.to_string(),
            description: "orchestrator test job".to_string(),
            job_type,
            owner: "alice".to_string(),
            owning_team: "infra".to_string(),
            labels: BTreeMap::new(),
            instance_count: instances,
            sla: SlaConfig {
                // Wide-open by default; individual tests tighten this.
                maximum_unavailable_instances: instances,
                ..Default::default()
            },
            default_task: TaskConfig::default(),
            instance_overrides: BTreeMap::new(),
            resource_pool: "/infra/test".to_string(),
            secrets: Vec::new(),
            changelog: ChangeLogEntry {
                version: 1,
                author: "alice".to_string(),
                updated_at: 1000,
            },
        }
    }

    /// Seed a job whose instances are all running at config v1.
    fn seed_job(store: &StateStore, config: &JobConfig) -> RuntimeInfo {
        store.put_config(config).unwrap();
        let mut runtime = RuntimeInfo::new(&config.job_id, goal_for(config.job_type), 1000);
        let instances: Vec<TaskInstance> = (0..config.instance_count)
            .map(|instance_id| TaskInstance {
                job_id: config.job_id.clone(),
                instance_id,
                state: TaskState::Running,
                config_version: 1,
                user_killed: false,
                updated_at: 1000,
            })
            .collect();
        store.put_instances(&instances).unwrap();
        apply_task_stats(&mut runtime, &instances, 1000);
        store.put_runtime(&runtime).unwrap();
        runtime
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            stall_retry: Duration::from_millis(10),
            batch_pause: Duration::ZERO,
        }
    }

    /// Task layer fake that records every batch it is handed.
    #[derive(Default)]
    struct RecordingActions {
        calls: Mutex<Vec<BatchAction>>,
        delay: Option<Duration>,
    }

    impl RecordingActions {
        fn slow(delay: Duration) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                delay: Some(delay),
            }
        }

        fn recorded(&self) -> Vec<BatchAction> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TaskActions for RecordingActions {
        fn apply(&self, action: BatchAction) -> BoxFuture<anyhow::Result<Vec<TaskAck>>> {
            self.calls.lock().unwrap().push(action.clone());
            let delay = self.delay;
            Box::pin(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                LocalTaskActions.apply(action).await
            })
        }
    }

    async fn wait_for_workflow(
        orch: &WorkflowOrchestrator,
        job_id: &str,
        update_id: &str,
        state: WorkflowState,
    ) {
        for _ in 0..400 {
            if orch.workflow_status(job_id, update_id).unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "workflow {update_id} never reached {state:?}; current: {:?}",
            orch.workflow_status(job_id, update_id).unwrap().state
        );
    }

    fn orchestrator(store: &StateStore, tasks: Arc<dyn TaskActions>) -> WorkflowOrchestrator {
        WorkflowOrchestrator::new(store.clone(), JobCache::new(), tasks)
            .with_config(fast_config())
    }

    #[tokio::test]
    async fn restart_returns_immediately_and_completes() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 5, JobType::Service);
        let runtime = seed_job(&store, &config);

        let recording = Arc::new(RecordingActions::default());
        let orch = orchestrator(&store, recording.clone());

        let (new_version, update_id) = orch
            .restart("j1", vec![InstanceRange::new(0, 5)], runtime.resource_version, 2)
            .await
            .unwrap();
        assert!(new_version > runtime.resource_version);
        assert_eq!(update_id, "j1/wf-1");

        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Succeeded).await;

        // Batches processed strictly in order: [0,2), [2,4), [4,5).
        let calls = recording.recorded();
        let batches: Vec<Vec<u32>> = calls.iter().map(|c| c.instances.clone()).collect();
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert!(calls.iter().all(|c| c.kind == ActionKind::Restart));

        let record = orch.workflow_status("j1", &update_id).unwrap();
        assert_eq!(record.batches_done, 3);
        assert_eq!(record.instances_done, 5);
    }

    #[tokio::test]
    async fn stale_token_conflicts_and_creates_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 3, JobType::Service);
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));

        let err = orch
            .restart("j1", vec![], runtime.resource_version + 7, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Conflict { .. }));

        assert!(store.list_workflows_for_job("j1").unwrap().is_empty());
        let current = store.get_runtime("j1").unwrap().unwrap();
        assert_eq!(current.workflow_version, 0);
    }

    #[tokio::test]
    async fn out_of_range_rejected_before_any_state() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 4, JobType::Service);
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));
        let err = orch
            .restart(
                "j1",
                vec![InstanceRange::new(0, 10)],
                runtime.resource_version,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidArgument(_)));
        assert!(store.list_workflows_for_job("j1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let orch = orchestrator(&store, Arc::new(LocalTaskActions));
        let err = orch.restart("ghost", vec![], 1, 1).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[tokio::test]
    async fn unavailability_ceiling_shrinks_every_batch() {
        let store = StateStore::open_in_memory().unwrap();
        let mut config = test_config("j1", 4, JobType::Service);
        config.sla.maximum_unavailable_instances = 1;
        let runtime = seed_job(&store, &config);

        let recording = Arc::new(RecordingActions::default());
        let orch = orchestrator(&store, recording.clone());

        let (_, update_id) = orch
            .restart("j1", vec![], runtime.resource_version, 2)
            .await
            .unwrap();
        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Succeeded).await;

        // At no point were 2+ instances handed down together.
        let calls = recording.recorded();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|c| c.instances.len() <= 1));
        // Every instance was still processed.
        let touched: BTreeSet<u32> =
            calls.iter().flat_map(|c| c.instances.iter().copied()).collect();
        assert_eq!(touched, (0..4).collect());
    }

    #[tokio::test]
    async fn second_restart_supersedes_first() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 6, JobType::Service);
        let runtime = seed_job(&store, &config);

        let slow = Arc::new(RecordingActions::slow(Duration::from_millis(40)));
        let orch = orchestrator(&store, slow);

        let (v1, first) = orch
            .restart("j1", vec![], runtime.resource_version, 1)
            .await
            .unwrap();
        let (_, second) = orch.restart("j1", vec![], v1, 1).await.unwrap();

        assert_ne!(first, second);
        wait_for_workflow(&orch, "j1", &first, WorkflowState::Superseded).await;
        wait_for_workflow(&orch, "j1", &second, WorkflowState::Succeeded).await;

        // Polling the stale id keeps reporting supersession, not progress.
        let stale = orch.workflow_status("j1", &first).unwrap();
        assert_eq!(stale.state, WorkflowState::Superseded);

        let current = store.get_runtime("j1").unwrap().unwrap();
        assert_eq!(current.workflow_version, 2);
    }

    #[tokio::test]
    async fn convergence_counter_catches_up_to_target() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 4, JobType::Service);
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));
        let (_, update_id) = orch
            .restart("j1", vec![], runtime.resource_version, 2)
            .await
            .unwrap();

        // Initiation re-targets the counter: one bump for initiation
        // itself plus one convergence step per batch.
        let initiated = store.get_runtime("j1").unwrap().unwrap();
        assert_eq!(
            initiated.desired_state_version,
            initiated.state_version + 2
        );
        assert!(!initiated.converged());

        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Succeeded).await;

        // Each batch fold advanced state_version; the target is reached.
        let settled = store.get_runtime("j1").unwrap().unwrap();
        assert_eq!(settled.desired_state_version, initiated.desired_state_version);
        assert!(settled.converged());
    }

    #[tokio::test]
    async fn workflow_version_counts_update_generations() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 2, JobType::Service);
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));

        let (_, first) = orch
            .restart("j1", vec![], runtime.resource_version, 0)
            .await
            .unwrap();
        wait_for_workflow(&orch, "j1", &first, WorkflowState::Succeeded).await;

        let current = store.get_runtime("j1").unwrap().unwrap();
        let (_, second) = orch
            .restart("j1", vec![], current.resource_version, 0)
            .await
            .unwrap();

        assert_eq!(first, "j1/wf-1");
        assert_eq!(second, "j1/wf-2");
        assert_eq!(
            store.get_runtime("j1").unwrap().unwrap().workflow_version,
            2
        );
    }

    #[tokio::test]
    async fn floor_violation_parks_the_workflow() {
        let store = StateStore::open_in_memory().unwrap();
        let mut config = test_config("j1", 3, JobType::Service);
        // Floor equals instance count: no instance may ever go down.
        config.sla.minimum_running_instances = 3;
        config.sla.maximum_running_instances = 3;
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));
        let (v1, update_id) = orch
            .restart("j1", vec![], runtime.resource_version, 1)
            .await
            .unwrap();

        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Stalled).await;

        // A stop supersedes the parked workflow and ignores the floor.
        let (_, stop_id) = orch.stop("j1", vec![], v1, 1).await.unwrap();
        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Superseded).await;
        wait_for_workflow(&orch, "j1", &stop_id, WorkflowState::Succeeded).await;
    }

    #[tokio::test]
    async fn tight_ceiling_stop_still_completes() {
        let store = StateStore::open_in_memory().unwrap();
        let mut config = test_config("j1", 4, JobType::Service);
        // Ceiling of one: each killed instance must leave the ledger or
        // the stop wedges after its first batch.
        config.sla.maximum_unavailable_instances = 1;
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));
        let (_, update_id) = orch
            .stop("j1", vec![], runtime.resource_version, 2)
            .await
            .unwrap();
        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Succeeded).await;

        let current = store.get_runtime("j1").unwrap().unwrap();
        assert_eq!(current.state, JobState::Killed);
        let instances = store.list_instances_for_job("j1").unwrap();
        assert!(instances.iter().all(|t| t.state == TaskState::Killed));
    }

    #[tokio::test]
    async fn full_stop_kills_the_job() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 3, JobType::Service);
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));
        let (_, update_id) = orch
            .stop("j1", vec![], runtime.resource_version, 1)
            .await
            .unwrap();
        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Succeeded).await;

        let current = store.get_runtime("j1").unwrap().unwrap();
        assert_eq!(current.goal_state, JobState::Killed);
        assert_eq!(current.state, JobState::Killed);
        assert!(current.completion_time.is_some());
    }

    #[tokio::test]
    async fn partial_stop_keeps_goal_state() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 4, JobType::Service);
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));
        let (_, update_id) = orch
            .stop(
                "j1",
                vec![InstanceRange::new(0, 2)],
                runtime.resource_version,
                1,
            )
            .await
            .unwrap();
        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Succeeded).await;

        let current = store.get_runtime("j1").unwrap().unwrap();
        assert_eq!(current.goal_state, JobState::Running);
        // Two instances down, two still running: job stays Running.
        assert_eq!(current.state, JobState::Running);
    }

    #[tokio::test]
    async fn update_writes_new_version_and_rolls_fleet() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 4, JobType::Service);
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));

        let mut next = config.clone();
        next.default_task.command = "serve --v2".to_string();
        let (new_version, update_id) = orch
            .update("j1", next, vec![], runtime.resource_version, 2)
            .await
            .unwrap();
        assert!(new_version > runtime.resource_version);

        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Succeeded).await;

        // Config chain: v1 then v2, no gaps, v1 untouched.
        let chain = store.list_config_versions("j1").unwrap();
        let versions: Vec<u64> = chain.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(chain[0].default_task.command, "");
        assert_eq!(chain[1].default_task.command, "serve --v2");

        let current = store.get_runtime("j1").unwrap().unwrap();
        assert_eq!(current.configuration_version, 2);
        // The whole fleet adopted v2.
        assert_eq!(current.task_config_version_stats.get(&2), Some(&4));
        assert_eq!(current.task_config_version_stats.get(&1), None);
    }

    #[tokio::test]
    async fn concurrent_updates_one_wins() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 2, JobType::Service);
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));

        // Both callers observed the same token; exactly one may win.
        let a = orch.update("j1", config.clone(), vec![], runtime.resource_version, 0);
        let b = orch.update("j1", config.clone(), vec![], runtime.resource_version, 0);
        let (ra, rb) = tokio::join!(a, b);

        let results = [ra, rb];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(JobError::Conflict { .. })))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);

        // Version chain has no gaps or duplicates.
        let versions: Vec<u64> = store
            .list_config_versions("j1")
            .unwrap()
            .iter()
            .map(|c| c.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn update_grows_instance_count() {
        let store = StateStore::open_in_memory().unwrap();
        let config = test_config("j1", 2, JobType::Service);
        let runtime = seed_job(&store, &config);

        let orch = orchestrator(&store, Arc::new(LocalTaskActions));
        let mut next = config.clone();
        next.instance_count = 4;
        next.sla.maximum_unavailable_instances = 4;

        let (_, update_id) = orch
            .update("j1", next, vec![], runtime.resource_version, 0)
            .await
            .unwrap();
        wait_for_workflow(&orch, "j1", &update_id, WorkflowState::Succeeded).await;

        let instances = store.list_instances_for_job("j1").unwrap();
        assert_eq!(instances.len(), 4);
        assert!(instances.iter().all(|t| t.config_version == 2));
    }

    #[tokio::test]
    async fn polling_unknown_update_id_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let orch = orchestrator(&store, Arc::new(LocalTaskActions));
        let err = orch.workflow_status("j1", "j1/wf-99").unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }
}

//! StateStore — redb-backed persistence for the jobgrid control plane.
//!
//! Provides typed operations over job configs, runtime records, task
//! instances, and workflows. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Two contracts live here rather than in callers:
//!
//! - Config versions are immutable: writing an existing `{job_id}@{version}`
//!   key fails with `VersionExists`.
//! - Runtime mutation goes through [`StateStore::mutate_runtime`], which
//!   compares the caller's `resource_version` and applies the mutation in
//!   one write transaction. redb serializes write transactions, so the
//!   compare-and-increment is atomic with respect to concurrent callers.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOB_CONFIGS).map_err(map_err!(Table))?;
        txn.open_table(JOB_RUNTIMES).map_err(map_err!(Table))?;
        txn.open_table(TASK_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Job configs (immutable version chain) ──────────────────────

    /// Append a new config version. Fails with `VersionExists` if the
    /// `{job_id}@{version}` key is already present; versions are never
    /// overwritten.
    pub fn put_config(&self, config: &JobConfig) -> StateResult<()> {
        let key = config.table_key();
        let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOB_CONFIGS).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::VersionExists(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "config version stored");
        Ok(())
    }

    /// Get a specific config version.
    pub fn get_config(&self, job_id: &str, version: u64) -> StateResult<Option<JobConfig>> {
        let key = config_key(job_id, version);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_CONFIGS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let config: JobConfig =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// Get the highest config version for a job, if any.
    ///
    /// Keys are zero-padded, so the last key in the prefix scan is the
    /// latest version.
    pub fn latest_config(&self, job_id: &str) -> StateResult<Option<JobConfig>> {
        let prefix = format!("{job_id}@");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_CONFIGS).map_err(map_err!(Table))?;
        let mut latest: Option<JobConfig> = None;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let config: JobConfig =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                latest = Some(config);
            }
        }
        Ok(latest)
    }

    /// List all config versions for a job, in ascending version order.
    pub fn list_config_versions(&self, job_id: &str) -> StateResult<Vec<JobConfig>> {
        let prefix = format!("{job_id}@");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_CONFIGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let config: JobConfig =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(config);
            }
        }
        Ok(results)
    }

    // ── Runtime records ────────────────────────────────────────────

    /// Write a runtime record unconditionally. Used only at job creation;
    /// all later mutation goes through `mutate_runtime`.
    pub fn put_runtime(&self, runtime: &RuntimeInfo) -> StateResult<()> {
        let value = serde_json::to_vec(runtime).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOB_RUNTIMES).map_err(map_err!(Table))?;
            table
                .insert(runtime.job_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a runtime record by job id.
    pub fn get_runtime(&self, job_id: &str) -> StateResult<Option<RuntimeInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_RUNTIMES).map_err(map_err!(Table))?;
        match table.get(job_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let runtime: RuntimeInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(runtime))
            }
            None => Ok(None),
        }
    }

    /// List all runtime records.
    pub fn list_runtimes(&self) -> StateResult<Vec<RuntimeInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_RUNTIMES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let runtime: RuntimeInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(runtime);
        }
        Ok(results)
    }

    /// Mutate a runtime record with an optional optimistic-concurrency
    /// check, all inside one write transaction.
    ///
    /// When `expected` is supplied and does not match the stored
    /// `resource_version`, nothing is applied and `Conflict` is returned.
    /// On success `state_version` and `resource_version` are bumped and the
    /// new record is returned.
    pub fn mutate_runtime<F>(
        &self,
        job_id: &str,
        expected: Option<u64>,
        f: F,
    ) -> StateResult<RuntimeInfo>
    where
        F: FnOnce(&mut RuntimeInfo),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(JOB_RUNTIMES).map_err(map_err!(Table))?;
            let mut runtime: RuntimeInfo = {
                let guard = table
                    .get(job_id)
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(job_id.to_string()))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };

            if let Some(expected) = expected
                && expected != runtime.resource_version
            {
                // Dropping the uncommitted transaction aborts it.
                return Err(StateError::Conflict {
                    job_id: job_id.to_string(),
                    expected,
                    current: runtime.resource_version,
                });
            }

            f(&mut runtime);
            runtime.state_version += 1;
            runtime.resource_version += 1;

            let value = serde_json::to_vec(&runtime).map_err(map_err!(Serialize))?;
            table
                .insert(job_id, value.as_slice())
                .map_err(map_err!(Write))?;
            updated = runtime;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Task instances ─────────────────────────────────────────────

    /// Insert or update a single task instance record.
    pub fn put_instance(&self, instance: &TaskInstance) -> StateResult<()> {
        let key = instance.table_key();
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASK_INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or update many task instances in one transaction.
    pub fn put_instances(&self, instances: &[TaskInstance]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASK_INSTANCES).map_err(map_err!(Table))?;
            for instance in instances {
                let key = instance.table_key();
                let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a single task instance.
    pub fn get_instance(&self, job_id: &str, instance_id: u32) -> StateResult<Option<TaskInstance>> {
        let key = instance_key(job_id, instance_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASK_INSTANCES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let instance: TaskInstance =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// List all task instances for a job, in instance-id order.
    pub fn list_instances_for_job(&self, job_id: &str) -> StateResult<Vec<TaskInstance>> {
        let prefix = format!("{job_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASK_INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let instance: TaskInstance =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(instance);
            }
        }
        Ok(results)
    }

    // ── Workflows ──────────────────────────────────────────────────

    /// Insert or update a workflow record.
    pub fn put_workflow(&self, workflow: &WorkflowRecord) -> StateResult<()> {
        let key = workflow.table_key();
        let value = serde_json::to_vec(workflow).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(update_id = %workflow.update_id, state = ?workflow.state, "workflow stored");
        Ok(())
    }

    /// Get a workflow by job id and update id.
    pub fn get_workflow(
        &self,
        job_id: &str,
        update_id: &str,
    ) -> StateResult<Option<WorkflowRecord>> {
        let key = workflow_key(job_id, update_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let workflow: WorkflowRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    /// List all workflows for a job.
    pub fn list_workflows_for_job(&self, job_id: &str) -> StateResult<Vec<WorkflowRecord>> {
        let prefix = format!("{job_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let workflow: WorkflowRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(workflow);
            }
        }
        Ok(results)
    }

    /// The workflow with the highest generation for a job, if any.
    pub fn current_workflow(&self, job_id: &str) -> StateResult<Option<WorkflowRecord>> {
        let workflows = self.list_workflows_for_job(job_id)?;
        Ok(workflows
            .into_iter()
            .max_by_key(|w| w.workflow_version))
    }

    // ── Job deletion ───────────────────────────────────────────────

    /// Remove a job entirely: config chain, runtime record, instances, and
    /// workflows. Returns true if the runtime record existed.
    pub fn delete_job(&self, job_id: &str) -> StateResult<bool> {
        let config_prefix = format!("{job_id}@");
        let child_prefix = format!("{job_id}:");

        // Collect keys in read transactions first, then delete in one write.
        let config_keys = self.keys_with_prefix(JOB_CONFIGS, &config_prefix)?;
        let instance_keys = self.keys_with_prefix(TASK_INSTANCES, &child_prefix)?;
        let workflow_keys = self.keys_with_prefix(WORKFLOWS, &child_prefix)?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut runtimes = txn.open_table(JOB_RUNTIMES).map_err(map_err!(Table))?;
            existed = runtimes.remove(job_id).map_err(map_err!(Write))?.is_some();

            let mut configs = txn.open_table(JOB_CONFIGS).map_err(map_err!(Table))?;
            for key in &config_keys {
                configs.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let mut instances = txn.open_table(TASK_INSTANCES).map_err(map_err!(Table))?;
            for key in &instance_keys {
                instances.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let mut workflows = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
            for key in &workflow_keys {
                workflows.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%job_id, existed, "job deleted");
        Ok(existed)
    }

    fn keys_with_prefix(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        Ok(table
            .iter()
            .map_err(map_err!(Read))?
            .filter_map(|entry| {
                let (key, _) = entry.ok()?;
                let k = key.value().to_string();
                k.starts_with(prefix).then_some(k)
            })
            .collect())
    }
}

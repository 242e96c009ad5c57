//! JobCache — best-effort in-memory mirror of config + runtime.
//!
//! Exposed only for diagnostics. Entries are refreshed opportunistically
//! by whichever code path last touched the job; there is no freshness
//! guarantee and nothing may use this cache for correctness decisions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use jobgrid_state::{JobConfig, JobId, RuntimeInfo};

/// Cached view of one job.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CachedJob {
    pub config: JobConfig,
    pub runtime: RuntimeInfo,
}

/// Shared best-effort job mirror.
#[derive(Clone, Default)]
pub struct JobCache {
    inner: Arc<RwLock<HashMap<JobId, CachedJob>>>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached entry for a job.
    pub async fn insert(&self, config: JobConfig, runtime: RuntimeInfo) {
        let job_id = config.job_id.clone();
        let mut inner = self.inner.write().await;
        inner.insert(job_id, CachedJob { config, runtime });
    }

    /// Update only the runtime half of an entry, if present.
    pub async fn update_runtime(&self, runtime: &RuntimeInfo) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(&runtime.job_id) {
            entry.runtime = runtime.clone();
        }
    }

    /// Snapshot of the cached entry, if any.
    pub async fn get(&self, job_id: &str) -> Option<CachedJob> {
        let inner = self.inner.read().await;
        inner.get(job_id).cloned()
    }

    pub async fn remove(&self, job_id: &str) {
        let mut inner = self.inner.write().await;
        inner.remove(job_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgrid_state::{ChangeLogEntry, JobState, JobType, SlaConfig, TaskConfig};
    use std::collections::BTreeMap;

    fn test_config(job_id: &str) -> JobConfig {
        JobConfig {
            job_id: job_id.to_string(),
            version: 1,
            name: job_id.to_string(),
            description: String::new(),
            job_type: JobType::Service,
            owner: "alice".to_string(),
            owning_team: "infra".to_string(),
            labels: BTreeMap::new(),
            instance_count: 2,
            sla: SlaConfig::default(),
            default_task: TaskConfig::default(),
            instance_overrides: BTreeMap::new(),
            resource_pool: "/infra".to_string(),
            secrets: Vec::new(),
            changelog: ChangeLogEntry {
                version: 1,
                author: "alice".to_string(),
                updated_at: 1000,
            },
        }
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let cache = JobCache::new();
        assert!(cache.is_empty().await);

        let rt = RuntimeInfo::new("j1", JobState::Running, 1000);
        cache.insert(test_config("j1"), rt.clone()).await;

        let cached = cache.get("j1").await.unwrap();
        assert_eq!(cached.runtime, rt);
        assert_eq!(cache.len().await, 1);

        cache.remove("j1").await;
        assert!(cache.get("j1").await.is_none());
    }

    #[tokio::test]
    async fn update_runtime_only_touches_existing() {
        let cache = JobCache::new();
        let mut rt = RuntimeInfo::new("j1", JobState::Running, 1000);
        cache.insert(test_config("j1"), rt.clone()).await;

        rt.state = JobState::Running;
        rt.state_version += 1;
        cache.update_runtime(&rt).await;
        assert_eq!(cache.get("j1").await.unwrap().runtime.state_version, rt.state_version);

        // Unknown job: silently ignored, it's best-effort.
        let other = RuntimeInfo::new("j2", JobState::Running, 1000);
        cache.update_runtime(&other).await;
        assert!(cache.get("j2").await.is_none());
    }
}

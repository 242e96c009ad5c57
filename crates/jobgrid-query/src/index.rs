//! The refreshable job index.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use jobgrid_runtime::JobResult;
use jobgrid_state::{JobInfo, JobSummary, StateStore};

use crate::spec::QuerySpec;

/// Query results in the representation the caller asked for.
#[derive(Debug, Clone)]
pub enum QueryResults {
    Full(Vec<JobInfo>),
    Summaries(Vec<JobSummary>),
}

impl QueryResults {
    pub fn len(&self) -> usize {
        match self {
            QueryResults::Full(v) => v.len(),
            QueryResults::Summaries(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One page of query results plus pagination metadata.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub results: QueryResults,
    /// Matches across all pages.
    pub total_matched: usize,
    pub offset: usize,
}

/// In-memory snapshot of all jobs, queried without touching the store.
///
/// `refresh` rebuilds the snapshot from the durable store; between
/// refreshes reads may lag authoritative state. That lag is the contract,
/// not a bug: queries are non-blocking and never hold up writers.
#[derive(Clone, Default)]
pub struct QueryIndex {
    snapshot: Arc<RwLock<Vec<JobInfo>>>,
}

impl QueryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the snapshot from the store. Returns the number of jobs
    /// indexed. Jobs whose config chain is missing are skipped with a
    /// warning rather than failing the whole refresh.
    pub async fn refresh(&self, store: &StateStore) -> JobResult<usize> {
        let runtimes = store.list_runtimes()?;
        let mut jobs = Vec::with_capacity(runtimes.len());
        for runtime in runtimes {
            match store.latest_config(&runtime.job_id)? {
                Some(config) => jobs.push(JobInfo { config, runtime }),
                None => {
                    warn!(job = %runtime.job_id, "runtime record without config; skipping");
                }
            }
        }
        // Deterministic listing order: newest first, id as tiebreak.
        jobs.sort_by(|a, b| {
            b.runtime
                .creation_time
                .cmp(&a.runtime.creation_time)
                .then_with(|| a.config.job_id.cmp(&b.config.job_id))
        });

        let count = jobs.len();
        *self.snapshot.write().await = jobs;
        debug!(jobs = count, "query index refreshed");
        Ok(count)
    }

    /// Evaluate a query against the current snapshot.
    pub async fn query(&self, spec: &QuerySpec) -> JobResult<QueryOutput> {
        let compiled = spec.compile()?;
        let snapshot = self.snapshot.read().await;

        let matched: Vec<&JobInfo> = snapshot.iter().filter(|j| compiled.matches(j)).collect();
        let total_matched = matched.len();

        let page: Vec<&JobInfo> = if spec.limit == 0 {
            matched.into_iter().skip(spec.offset).collect()
        } else {
            matched
                .into_iter()
                .skip(spec.offset)
                .take(spec.limit)
                .collect()
        };

        let results = if spec.summary_only {
            QueryResults::Summaries(
                page.iter()
                    .map(|j| JobSummary::project(&j.config, &j.runtime))
                    .collect(),
            )
        } else {
            QueryResults::Full(page.into_iter().cloned().collect())
        };

        Ok(QueryOutput {
            results,
            total_matched,
            offset: spec.offset,
        })
    }
}

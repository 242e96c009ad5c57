//! Query predicates and their matching semantics.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use jobgrid_runtime::{JobError, JobResult};
use jobgrid_state::{JobInfo, JobState};

/// A multi-predicate job query. Every field is optional; an empty spec
/// matches all jobs.
///
/// Predicate semantics:
/// - `labels`: AND, every pair must be present on the job
/// - `keywords`: OR across owner, name, description and labels, with `*`
///   as a wildcard; a bare keyword is a substring match
/// - `job_states`: membership against the current derived state
/// - `resource_pool`: path-prefix scope (`/infra` covers `/infra/batch`
///   but not `/infrastructure`)
/// - `owner`: exact, case-sensitive
/// - `name`: case-sensitive substring
/// - time ranges: inclusive bounds, unset side unbounded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct QuerySpec {
    pub labels: BTreeMap<String, String>,
    pub keywords: Vec<String>,
    pub job_states: Vec<JobState>,
    pub resource_pool: Option<String>,
    pub owner: Option<String>,
    pub name: Option<String>,
    pub created_after: Option<u64>,
    pub created_before: Option<u64>,
    pub completed_after: Option<u64>,
    pub completed_before: Option<u64>,
    /// Pagination: number of matches to skip.
    pub offset: usize,
    /// Pagination: page size. 0 = unlimited.
    pub limit: usize,
    /// Return `JobSummary` projections instead of full `JobInfo` records.
    pub summary_only: bool,
}

impl QuerySpec {
    /// Validate and pre-compile the spec into a matcher.
    pub fn compile(&self) -> JobResult<CompiledQuery<'_>> {
        if let Some(pool) = &self.resource_pool
            && !pool.starts_with('/')
        {
            return Err(JobError::InvalidArgument(format!(
                "resource pool must be an absolute path, got {pool:?}"
            )));
        }

        let keywords = self
            .keywords
            .iter()
            .map(|kw| keyword_pattern(kw))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| JobError::InvalidArgument(format!("bad keyword: {e}")))?;

        Ok(CompiledQuery {
            spec: self,
            keywords,
        })
    }
}

/// Translate a keyword into an unanchored regex: `*` is a wildcard,
/// everything else is literal.
fn keyword_pattern(keyword: &str) -> Result<Regex, regex::Error> {
    let pattern: String = keyword
        .split('*')
        .map(|literal| regex::escape(literal))
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&pattern)
}

/// A validated query with its keyword regexes built once.
#[derive(Debug)]
pub struct CompiledQuery<'a> {
    spec: &'a QuerySpec,
    keywords: Vec<Regex>,
}

impl CompiledQuery<'_> {
    pub fn matches(&self, job: &JobInfo) -> bool {
        let spec = self.spec;
        let config = &job.config;
        let runtime = &job.runtime;

        if !spec
            .labels
            .iter()
            .all(|(k, v)| config.labels.get(k) == Some(v))
        {
            return false;
        }

        if !spec.job_states.is_empty() && !spec.job_states.contains(&runtime.state) {
            return false;
        }

        if let Some(pool) = &spec.resource_pool
            && !pool_in_scope(pool, &config.resource_pool)
        {
            return false;
        }

        if let Some(owner) = &spec.owner
            && owner != &config.owner
        {
            return false;
        }

        if let Some(name) = &spec.name
            && !config.name.contains(name.as_str())
        {
            return false;
        }

        if !in_range(
            Some(runtime.creation_time),
            spec.created_after,
            spec.created_before,
        ) {
            return false;
        }
        if !in_range(
            runtime.completion_time,
            spec.completed_after,
            spec.completed_before,
        ) {
            return false;
        }

        if !self.keywords.is_empty() {
            let haystacks = keyword_haystacks(config);
            let hit = self
                .keywords
                .iter()
                .any(|re| haystacks.iter().any(|h| re.is_match(h)));
            if !hit {
                return false;
            }
        }

        true
    }
}

/// Keyword search fields: owner, name, description and label pairs.
fn keyword_haystacks(config: &jobgrid_state::JobConfig) -> Vec<String> {
    let mut fields = vec![
        config.owner.clone(),
        config.name.clone(),
        config.description.clone(),
    ];
    for (k, v) in &config.labels {
        fields.push(format!("{k}={v}"));
    }
    fields
}

/// Path-prefix scope: the scope pool covers itself and its sub-pools,
/// never a sibling sharing a name prefix.
fn pool_in_scope(scope: &str, pool: &str) -> bool {
    let scope = scope.trim_end_matches('/');
    pool == scope || pool.starts_with(&format!("{scope}/"))
}

/// Inclusive range check. An unset value (a job with no completion time)
/// fails any bounded completion filter.
fn in_range(value: Option<u64>, after: Option<u64>, before: Option<u64>) -> bool {
    match value {
        Some(v) => after.is_none_or(|a| v >= a) && before.is_none_or(|b| v <= b),
        None => after.is_none() && before.is_none(),
    }
}

//! SLA admission control.
//!
//! Validates SLA constraints when a config is admitted (Create/Update)
//! and gates every rolling batch: a batch that would drop available
//! instances below `minimum_running_instances` or push concurrently
//! unavailable instances above `maximum_unavailable_instances` is shrunk
//! (never expanded) to the largest feasible prefix, down to one instance.
//! When not even one instance can move, the workflow stalls.

use std::collections::BTreeSet;

use tracing::debug;

use jobgrid_runtime::{JobError, JobResult};
use jobgrid_state::SlaConfig;

/// SLA constraints with defaults resolved against a concrete instance count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSla {
    pub min_running: u32,
    pub max_running: u32,
    pub max_unavailable: u32,
    /// False for Stop workflows: an explicit stop is allowed to take the
    /// job below its running floor (that is the point of stopping it).
    pub enforce_min: bool,
}

/// Validate the SLA invariant `1 <= min <= max <= instance_count` and
/// resolve unset fields.
///
/// A zero `maximum_running_instances` resolves to `instance_count`.
/// Violations are rejected with `InvalidConfig`, never clamped.
pub fn validate_sla(sla: &SlaConfig, instance_count: u32) -> JobResult<ResolvedSla> {
    let min = sla.minimum_running_instances;
    let max = if sla.maximum_running_instances == 0 {
        instance_count
    } else {
        sla.maximum_running_instances
    };

    if min < 1 {
        return Err(JobError::InvalidConfig(
            "minimum_running_instances must be at least 1".to_string(),
        ));
    }
    if min > max {
        return Err(JobError::InvalidConfig(format!(
            "minimum_running_instances {min} exceeds maximum_running_instances {max}"
        )));
    }
    if max > instance_count {
        return Err(JobError::InvalidConfig(format!(
            "maximum_running_instances {max} exceeds instance_count {instance_count}"
        )));
    }

    Ok(ResolvedSla {
        min_running: min,
        max_running: max,
        max_unavailable: sla.maximum_unavailable_instances,
        enforce_min: true,
    })
}

/// Outcome of the per-batch admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The whole batch may proceed.
    Full,
    /// Only the first `n` instances of the batch may proceed.
    Shrunk(usize),
    /// Not even one instance can move without violating constraints.
    /// Retryable; the workflow parks until availability recovers.
    Stalled,
}

/// Gate one batch against current availability.
///
/// `available` is the set of instance ids currently counting toward the
/// running floor (non-stopped, non-failed); `total` is the number of
/// instances expected to be up (the caller excludes instances that are
/// down by request). Only batch members that are currently available
/// change the availability arithmetic: moving an already-down instance
/// neither drops the floor nor adds to the unavailable ceiling.
pub fn admit_batch(
    batch: &[u32],
    available: &BTreeSet<u32>,
    total: u32,
    sla: &ResolvedSla,
) -> Admission {
    let available_count = available.len() as u32;
    let unavailable_count = total.saturating_sub(available_count);

    let feasible = |prefix: &[u32]| {
        let overlap = prefix.iter().filter(|i| available.contains(i)).count() as u32;
        let available_after = available_count.saturating_sub(overlap);
        let unavailable_after = unavailable_count + overlap;

        (!sla.enforce_min || available_after >= sla.min_running)
            && unavailable_after <= sla.max_unavailable
    };

    if feasible(batch) {
        return Admission::Full;
    }

    // Shrink to the largest feasible prefix, never below one instance.
    for n in (1..batch.len()).rev() {
        if feasible(&batch[..n]) {
            debug!(requested = batch.len(), admitted = n, "batch shrunk by admission");
            return Admission::Shrunk(n);
        }
    }

    Admission::Stalled
}

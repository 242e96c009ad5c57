//! Instance-range resolution and batch planning.
//!
//! A request carries zero or more half-open `[from, to)` ranges; an empty
//! list targets the full instance set. The resolved target set is
//! partitioned into an ordered sequence of batches of `batch_size`
//! instances (final batch may be smaller; size 0 means one batch).

use jobgrid_runtime::{JobError, JobResult};
use jobgrid_state::InstanceRange;

/// Resolve request ranges to a sorted, deduplicated list of instance ids.
///
/// Empty or absent ranges default to `[0, instance_count)`. Any range
/// reaching outside `[0, instance_count)` is an `InvalidArgument`.
pub fn resolve_ranges(ranges: &[InstanceRange], instance_count: u32) -> JobResult<Vec<u32>> {
    if ranges.is_empty() {
        return Ok((0..instance_count).collect());
    }

    let mut indices = Vec::new();
    for range in ranges {
        if range.from > range.to || range.to > instance_count {
            return Err(JobError::InvalidArgument(format!(
                "instance range [{}, {}) outside [0, {})",
                range.from, range.to, instance_count
            )));
        }
        indices.extend(range.from..range.to);
    }

    indices.sort_unstable();
    indices.dedup();
    if indices.is_empty() {
        return Err(JobError::InvalidArgument(
            "instance ranges select no instances".to_string(),
        ));
    }
    Ok(indices)
}

/// Partition a target set into ordered batches.
///
/// `batch_size == 0` treats the entire set as one batch.
pub fn plan_batches(indices: &[u32], batch_size: u32) -> Vec<Vec<u32>> {
    if indices.is_empty() {
        return Vec::new();
    }
    if batch_size == 0 {
        return vec![indices.to_vec()];
    }
    indices
        .chunks(batch_size as usize)
        .map(|chunk| chunk.to_vec())
        .collect()
}

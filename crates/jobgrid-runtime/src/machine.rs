//! Job state derivation — turns per-instance task state into job state.
//!
//! The derivation is re-applied whenever the task stats change:
//!
//! - any task running ⇒ job `Running`
//! - all tasks terminal, all succeeded ⇒ `Succeeded`
//! - all tasks terminal, none killed, at least one failed ⇒ `Failed`
//! - all tasks terminal, at least one killed ⇒ `Killed`
//! - kill requested but tasks not yet all terminal ⇒ `Killing`
//!   (overrides the Running/Pending derivation until convergence)
//!
//! Entering a terminal state sets `completion_time`; leaving `Initialized`
//! sets `start_time` exactly once.

use std::collections::BTreeMap;

use tracing::debug;

use jobgrid_state::{JobState, RuntimeInfo, TaskInstance, TaskState};

/// Histogram of task instances per task state.
pub fn task_stats_of(instances: &[TaskInstance]) -> BTreeMap<TaskState, u32> {
    let mut stats = BTreeMap::new();
    for instance in instances {
        *stats.entry(instance.state).or_insert(0) += 1;
    }
    stats
}

/// Histogram of task instances per adopted config version.
pub fn config_version_stats_of(instances: &[TaskInstance]) -> BTreeMap<u64, u32> {
    let mut stats = BTreeMap::new();
    for instance in instances {
        *stats.entry(instance.config_version).or_insert(0) += 1;
    }
    stats
}

/// Derive the job state from a task-state histogram.
///
/// `kill_requested` is true when the job's goal state is `Killed` (a stop
/// over the full instance set); it overrides the Pending/Running derivation
/// until every task is terminal.
pub fn derive_state(stats: &BTreeMap<TaskState, u32>, kill_requested: bool) -> JobState {
    let count = |s: TaskState| stats.get(&s).copied().unwrap_or(0);

    let total: u32 = stats.values().sum();
    if total == 0 {
        return JobState::Initialized;
    }

    let succeeded = count(TaskState::Succeeded);
    let failed = count(TaskState::Failed);
    let killed = count(TaskState::Killed);
    let terminal = succeeded + failed + killed;

    if terminal == total {
        if killed > 0 {
            return JobState::Killed;
        }
        if failed > 0 {
            return JobState::Failed;
        }
        return JobState::Succeeded;
    }

    if kill_requested {
        return JobState::Killing;
    }
    if count(TaskState::Running) > 0 {
        return JobState::Running;
    }
    JobState::Pending
}

/// Recompute a runtime record's derived fields from its task instances.
///
/// Updates `task_stats`, `task_config_version_stats`, and `state`, and
/// applies the timestamp rules. Version-counter bumps are the store's job
/// (the caller runs this inside `mutate_runtime`), keeping the (state,
/// state_version) pair untorn for readers.
pub fn apply_task_stats(runtime: &mut RuntimeInfo, instances: &[TaskInstance], now: u64) {
    runtime.task_stats = task_stats_of(instances);
    runtime.task_config_version_stats = config_version_stats_of(instances);

    let kill_requested = runtime.goal_state == JobState::Killed;
    let next = derive_state(&runtime.task_stats, kill_requested);

    if next != runtime.state {
        debug!(
            job = %runtime.job_id,
            from = ?runtime.state,
            to = ?next,
            "job state derived"
        );
    }

    // startTime: set exactly once, on leaving Initialized.
    if runtime.start_time.is_none()
        && runtime.state == JobState::Initialized
        && next != JobState::Initialized
    {
        runtime.start_time = Some(now);
    }

    // completionTime: set on entering a terminal state.
    if next.is_terminal() && runtime.completion_time.is_none() {
        runtime.completion_time = Some(now);
    }

    runtime.state = next;
}

/// Fold a resource-usage sample into the runtime accumulator.
pub fn accumulate_usage(runtime: &mut RuntimeInfo, kind: &str, unit_seconds: f64) {
    *runtime.resource_usage.entry(kind.to_string()).or_insert(0.0) += unit_seconds;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: u32, state: TaskState) -> TaskInstance {
        TaskInstance {
            job_id: "j1".to_string(),
            instance_id: id,
            state,
            config_version: 1,
            user_killed: state == TaskState::Killed,
            updated_at: 1000,
        }
    }

    fn stats(pairs: &[(TaskState, u32)]) -> BTreeMap<TaskState, u32> {
        pairs.iter().copied().collect()
    }

    // ── Derivation table ───────────────────────────────────────────

    #[test]
    fn empty_stats_is_initialized() {
        assert_eq!(derive_state(&BTreeMap::new(), false), JobState::Initialized);
    }

    #[test]
    fn any_running_task_means_running() {
        let s = stats(&[
            (TaskState::Running, 1),
            (TaskState::Pending, 3),
            (TaskState::Succeeded, 2),
        ]);
        assert_eq!(derive_state(&s, false), JobState::Running);
    }

    #[test]
    fn all_pending_means_pending() {
        let s = stats(&[(TaskState::Pending, 4)]);
        assert_eq!(derive_state(&s, false), JobState::Pending);
    }

    #[test]
    fn all_succeeded_means_succeeded() {
        let s = stats(&[(TaskState::Succeeded, 4)]);
        assert_eq!(derive_state(&s, false), JobState::Succeeded);
    }

    #[test]
    fn failure_without_kill_means_failed() {
        let s = stats(&[(TaskState::Succeeded, 3), (TaskState::Failed, 1)]);
        assert_eq!(derive_state(&s, false), JobState::Failed);
    }

    #[test]
    fn any_killed_task_means_killed() {
        let s = stats(&[
            (TaskState::Succeeded, 2),
            (TaskState::Failed, 1),
            (TaskState::Killed, 1),
        ]);
        assert_eq!(derive_state(&s, false), JobState::Killed);
    }

    #[test]
    fn kill_requested_overrides_until_convergence() {
        let s = stats(&[(TaskState::Running, 2), (TaskState::Killed, 2)]);
        assert_eq!(derive_state(&s, true), JobState::Killing);

        // Without a kill request the same histogram is just Running.
        assert_eq!(derive_state(&s, false), JobState::Running);

        // Once everything is terminal the kill wins.
        let done = stats(&[(TaskState::Killed, 4)]);
        assert_eq!(derive_state(&done, true), JobState::Killed);
    }

    // ── apply_task_stats ───────────────────────────────────────────

    #[test]
    fn start_time_set_exactly_once() {
        let mut rt = RuntimeInfo::new("j1", JobState::Running, 1000);
        assert!(rt.start_time.is_none());

        let pending: Vec<TaskInstance> =
            (0..3).map(|i| instance(i, TaskState::Pending)).collect();
        apply_task_stats(&mut rt, &pending, 1001);
        assert_eq!(rt.state, JobState::Pending);
        assert_eq!(rt.start_time, Some(1001));

        let running: Vec<TaskInstance> =
            (0..3).map(|i| instance(i, TaskState::Running)).collect();
        apply_task_stats(&mut rt, &running, 1005);
        assert_eq!(rt.state, JobState::Running);
        // Not moved by later transitions.
        assert_eq!(rt.start_time, Some(1001));
    }

    #[test]
    fn completion_time_set_on_terminal_entry() {
        let mut rt = RuntimeInfo::new("j1", JobState::Succeeded, 1000);

        let running: Vec<TaskInstance> =
            (0..2).map(|i| instance(i, TaskState::Running)).collect();
        apply_task_stats(&mut rt, &running, 1001);
        assert!(rt.completion_time.is_none());

        let done: Vec<TaskInstance> =
            (0..2).map(|i| instance(i, TaskState::Succeeded)).collect();
        apply_task_stats(&mut rt, &done, 1010);
        assert_eq!(rt.state, JobState::Succeeded);
        assert_eq!(rt.completion_time, Some(1010));
    }

    #[test]
    fn no_initialized_to_succeeded_shortcut() {
        // A job whose tasks all succeed still passes through an observable
        // non-terminal state first when stats arrive incrementally.
        let mut rt = RuntimeInfo::new("j1", JobState::Succeeded, 1000);

        let mut tasks: Vec<TaskInstance> =
            (0..2).map(|i| instance(i, TaskState::Pending)).collect();
        apply_task_stats(&mut rt, &tasks, 1001);
        let mid = rt.state;
        assert!(!mid.is_terminal());

        tasks[0].state = TaskState::Running;
        apply_task_stats(&mut rt, &tasks, 1002);

        tasks[0].state = TaskState::Succeeded;
        tasks[1].state = TaskState::Succeeded;
        apply_task_stats(&mut rt, &tasks, 1003);
        assert_eq!(rt.state, JobState::Succeeded);

        // Every observed hop was legal under the lifecycle table.
        assert!(JobState::Initialized.can_transition_to(mid));
    }

    #[test]
    fn goal_killed_reports_killing_mid_stop() {
        let mut rt = RuntimeInfo::new("j1", JobState::Running, 1000);
        rt.goal_state = JobState::Killed;

        let tasks = vec![
            instance(0, TaskState::Killed),
            instance(1, TaskState::Running),
        ];
        apply_task_stats(&mut rt, &tasks, 1001);
        assert_eq!(rt.state, JobState::Killing);

        let tasks = vec![
            instance(0, TaskState::Killed),
            instance(1, TaskState::Killed),
        ];
        apply_task_stats(&mut rt, &tasks, 1002);
        assert_eq!(rt.state, JobState::Killed);
        assert_eq!(rt.completion_time, Some(1002));
    }

    #[test]
    fn config_version_histogram_tracks_mixed_fleet() {
        let mut tasks: Vec<TaskInstance> =
            (0..4).map(|i| instance(i, TaskState::Running)).collect();
        tasks[0].config_version = 2;
        tasks[1].config_version = 2;

        let stats = config_version_stats_of(&tasks);
        assert_eq!(stats.get(&1), Some(&2));
        assert_eq!(stats.get(&2), Some(&2));
    }

    #[test]
    fn usage_accumulates() {
        let mut rt = RuntimeInfo::new("j1", JobState::Running, 1000);
        accumulate_usage(&mut rt, "cpu", 1.5);
        accumulate_usage(&mut rt, "cpu", 2.5);
        accumulate_usage(&mut rt, "memory", 8.0);
        assert_eq!(rt.resource_usage.get("cpu"), Some(&4.0));
        assert_eq!(rt.resource_usage.get("memory"), Some(&8.0));
    }
}

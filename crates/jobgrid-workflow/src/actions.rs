//! Seam to the external task supervisor.
//!
//! The orchestrator never places or supervises tasks itself; it hands a
//! batch of instance-level actions to a `TaskActions` implementation and
//! folds the acknowledgements back into runtime state. The daemon wires a
//! local immediately-acknowledging implementation; tests use recording
//! fakes.

use std::future::Future;
use std::pin::Pin;

use jobgrid_state::TaskState;

/// Boxed future type for dyn-compatible async trait methods.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Instance-level action kinds a batch can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Bring stopped instances up.
    Start,
    /// Take instances down (kill).
    Stop,
    /// Stop-then-start in place.
    Restart,
}

/// One batch of instance-level work handed to the task layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAction {
    pub job_id: String,
    pub kind: ActionKind,
    pub instances: Vec<u32>,
    /// Config version the instances should run after the action.
    pub config_version: u64,
}

/// Acknowledgement for one instance: the terminal-or-running state the
/// task layer reached for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskAck {
    pub instance_id: u32,
    pub state: TaskState,
    pub user_killed: bool,
}

/// The task supervisor interface.
pub trait TaskActions: Send + Sync {
    /// Apply a batch action and return one acknowledgement per instance.
    fn apply(&self, action: BatchAction) -> BoxFuture<anyhow::Result<Vec<TaskAck>>>;
}

/// Immediately-acknowledging task layer for standalone operation.
///
/// Start/Restart acknowledge `Running`, Stop acknowledges a user `Killed`.
/// Real placement and supervision live outside this control plane.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTaskActions;

impl TaskActions for LocalTaskActions {
    fn apply(&self, action: BatchAction) -> BoxFuture<anyhow::Result<Vec<TaskAck>>> {
        Box::pin(async move {
            let acks = action
                .instances
                .iter()
                .map(|&instance_id| match action.kind {
                    ActionKind::Start | ActionKind::Restart => TaskAck {
                        instance_id,
                        state: TaskState::Running,
                        user_killed: false,
                    },
                    ActionKind::Stop => TaskAck {
                        instance_id,
                        state: TaskState::Killed,
                        user_killed: true,
                    },
                })
                .collect();
            Ok(acks)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_actions_acknowledge_by_kind() {
        let actions = LocalTaskActions;

        let acks = actions
            .apply(BatchAction {
                job_id: "j1".to_string(),
                kind: ActionKind::Restart,
                instances: vec![0, 1],
                config_version: 2,
            })
            .await
            .unwrap();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|a| a.state == TaskState::Running));

        let acks = actions
            .apply(BatchAction {
                job_id: "j1".to_string(),
                kind: ActionKind::Stop,
                instances: vec![3],
                config_version: 1,
            })
            .await
            .unwrap();
        assert_eq!(acks[0].state, TaskState::Killed);
        assert!(acks[0].user_killed);
    }
}

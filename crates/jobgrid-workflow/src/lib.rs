//! jobgrid-workflow — rolling lifecycle operations for jobs.
//!
//! Start/Stop/Restart/Update run as asynchronous, batched, cancellable
//! workflows over instance ranges. Initiation is synchronous and gated by
//! the optimistic resource-version check; batch execution proceeds in the
//! background, consulting SLA admission before every batch and shrinking
//! batches that would breach availability constraints.
//!
//! # Components
//!
//! - **`batch`** — instance-range resolution and ordered batch planning
//! - **`admission`** — SLA validation and per-batch availability gating
//! - **`actions`** — seam to the external task supervisor
//! - **`orchestrator`** — workflow initiation, supersession, async driver

pub mod actions;
pub mod admission;
pub mod batch;
pub mod orchestrator;

pub use actions::{ActionKind, BatchAction, LocalTaskActions, TaskAck, TaskActions};
pub use admission::{Admission, ResolvedSla};
pub use orchestrator::{OrchestratorConfig, WorkflowOrchestrator};

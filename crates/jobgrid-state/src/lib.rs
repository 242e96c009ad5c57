//! jobgrid-state — embedded state store for the jobgrid control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for job configurations, runtime records, per-instance task state,
//! and workflow records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{job_id}@{version}`, `{job_id}:{instance_id}`) enable
//! prefix scans for a job's config chain, instances, and workflows.
//!
//! Job configurations are append-only: a `{job_id}@{version}` key is written
//! once and never overwritten. The runtime record is mutated in place, but
//! only through [`StateStore::mutate_runtime`], which performs the
//! compare-and-increment on `resource_version` inside a single write
//! transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

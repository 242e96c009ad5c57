//! jobgrid-query — multi-predicate job search.
//!
//! Queries run against an in-memory snapshot rebuilt from the durable
//! store on a refresh interval. The index is read-only and eventually
//! consistent: a job created or mutated after the last refresh is not
//! visible until the next one. Callers needing authoritative state read
//! the store directly.

pub mod index;
pub mod spec;

pub use index::{QueryIndex, QueryOutput, QueryResults};
pub use spec::QuerySpec;

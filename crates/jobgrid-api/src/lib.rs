//! jobgrid-api — REST API for jobgrid.
//!
//! Axum route handlers for the job control plane: lifecycle, rolling
//! operations, queries, and diagnostics.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/jobs` | Create a job |
//! | GET | `/api/v1/jobs/active` | List active job ids |
//! | POST | `/api/v1/jobs/query` | Multi-predicate job query |
//! | GET | `/api/v1/jobs/{id}` | Get config + runtime |
//! | PUT | `/api/v1/jobs/{id}` | Rolling config update |
//! | DELETE | `/api/v1/jobs/{id}` | Delete a terminal job |
//! | POST | `/api/v1/jobs/{id}/start` | Rolling start |
//! | POST | `/api/v1/jobs/{id}/stop` | Rolling stop |
//! | POST | `/api/v1/jobs/{id}/restart` | Rolling restart |
//! | POST | `/api/v1/jobs/{id}/refresh` | Reload runtime from the store |
//! | GET | `/api/v1/jobs/{id}/cache` | Best-effort cached view |
//! | GET | `/api/v1/jobs/{id}/workflows/{update_id}` | Poll a workflow |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use jobgrid_query::QueryIndex;
use jobgrid_runtime::JobCache;
use jobgrid_state::StateStore;
use jobgrid_workflow::WorkflowOrchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub cache: JobCache,
    pub index: QueryIndex,
    pub orchestrator: WorkflowOrchestrator,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/jobs", post(handlers::create_job))
        .route("/jobs/active", get(handlers::active_jobs))
        .route("/jobs/query", post(handlers::query_jobs))
        .route(
            "/jobs/{id}",
            get(handlers::get_job)
                .put(handlers::update_job)
                .delete(handlers::delete_job),
        )
        .route("/jobs/{id}/start", post(handlers::start_job))
        .route("/jobs/{id}/stop", post(handlers::stop_job))
        .route("/jobs/{id}/restart", post(handlers::restart_job))
        .route("/jobs/{id}/refresh", post(handlers::refresh_job))
        .route("/jobs/{id}/cache", get(handlers::get_cached_job))
        .route(
            "/jobs/{id}/workflows/{update_id}",
            get(handlers::get_workflow),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

//! Route table.

use crate::api::handlers::{health, jobs, pulp_servers};
use crate::api::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// Build the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/v1/jobs", get(jobs::list_jobs))
        .route("/api/v1/jobs/:id", get(jobs::get_job))
        .route("/api/v1/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/api/v1/pulp_servers", get(pulp_servers::list_servers))
        .route(
            "/api/v1/pulp_servers/:name/sync_repos",
            post(pulp_servers::sync_repos),
        )
        .route(
            "/api/v1/pulp_servers/:name/snapshot_repos",
            post(pulp_servers::snapshot_repos),
        )
        .route(
            "/api/v1/pulp_servers/:name/register_repos",
            post(pulp_servers::register_repos),
        )
        .with_state(state)
}

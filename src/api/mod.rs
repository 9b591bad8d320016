//! HTTP API layer.
//!
//! Thin surface over the engine: job enqueue, job inspection, cancel, and
//! fleet listing. Authentication is handled by the fronting layer and is
//! not part of this service.

pub mod handlers;
pub mod routes;

use crate::config::Config;
use crate::services::job_store::JobStore;
use crate::services::scheduler::Scheduler;
use sqlx::PgPool;

/// Shared application state for handlers.
pub struct AppState {
    pub config: Config,
    pub db: PgPool,
    pub job_store: JobStore,
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(config: Config, db: PgPool) -> Self {
        Self {
            job_store: JobStore::new(db.clone()),
            scheduler: Scheduler::new(db.clone()),
            config,
            db,
        }
    }
}

//! Job inspection and cancellation.

use crate::api::AppState;
use crate::error::Result;
use crate::models::{Job, RepoTaskResult};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

/// A job with its per-repo outcomes.
#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub repo_results: Vec<RepoTaskResult>,
}

/// GET /api/v1/jobs
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Job>>> {
    let limit = query
        .limit
        .unwrap_or(state.config.app.paging.default_page_size)
        .min(state.config.app.paging.max_page_size);
    let jobs = state.job_store.list_recent(limit).await?;
    Ok(Json(jobs))
}

/// GET /api/v1/jobs/:id
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetail>> {
    let job = state.job_store.get(id).await?;
    let repo_results = state.job_store.repo_results(id).await?;
    Ok(Json(JobDetail { job, repo_results }))
}

/// POST /api/v1/jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    state.job_store.request_cancel(id).await?;
    let job = state.job_store.get(id).await?;
    Ok(Json(job))
}

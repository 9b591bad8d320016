//! Fleet listing and ad-hoc job enqueue.

use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::fleet::deserialize_opt_max_runtime;
use crate::models::{JobKind, PulpServer};
use crate::services::fleet_loader::FleetLoader;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Body for POST .../sync_repos.
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub regex_include: Option<String>,
    #[serde(default)]
    pub regex_exclude: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_max_runtime")]
    pub max_runtime: Option<Duration>,
    pub max_concurrent_syncs: i32,
    #[serde(default)]
    pub source_pulp_server_name: Option<String>,
}

/// Body for POST .../snapshot_repos.
#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub snapshot_prefix: String,
    #[serde(default)]
    pub allow_snapshot_reuse: bool,
    #[serde(default)]
    pub regex_include: Option<String>,
    #[serde(default)]
    pub regex_exclude: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_max_runtime")]
    pub max_runtime: Option<Duration>,
}

/// Body for POST .../register_repos.
#[derive(Debug, Deserialize, Default)]
pub struct RegisterRequest {
    #[serde(default)]
    pub regex_include: Option<String>,
    #[serde(default)]
    pub regex_exclude: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_max_runtime")]
    pub max_runtime: Option<Duration>,
}

/// GET /api/v1/pulp_servers
pub async fn list_servers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PulpServer>>> {
    let servers = FleetLoader::new(state.db.clone()).active_servers().await?;
    Ok(Json(servers))
}

/// POST /api/v1/pulp_servers/:name/sync_repos
pub async fn sync_repos(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<SyncRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    if request.max_concurrent_syncs <= 0 {
        return Err(AppError::Validation(
            "max_concurrent_syncs cannot be less than or equal to 0".into(),
        ));
    }

    let job_id = state
        .scheduler
        .enqueue(
            JobKind::Sync,
            &name,
            json!({
                "regex_include": request.regex_include,
                "regex_exclude": request.regex_exclude,
                "max_runtime_secs": request.max_runtime.map(|d| d.as_secs()),
                "max_concurrent_syncs": request.max_concurrent_syncs,
                "source_pulp_server_name": request.source_pulp_server_name,
            }),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(json!({"job_id": job_id}))))
}

/// POST /api/v1/pulp_servers/:name/snapshot_repos
pub async fn snapshot_repos(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<SnapshotRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let job_id = state
        .scheduler
        .enqueue(
            JobKind::Snapshot,
            &name,
            json!({
                "snapshot_prefix": request.snapshot_prefix,
                "allow_snapshot_reuse": request.allow_snapshot_reuse,
                "regex_include": request.regex_include,
                "regex_exclude": request.regex_exclude,
                "max_runtime_secs": request.max_runtime.map(|d| d.as_secs()),
            }),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(json!({"job_id": job_id}))))
}

/// POST /api/v1/pulp_servers/:name/register_repos
pub async fn register_repos(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let job_id = state
        .scheduler
        .enqueue(
            JobKind::RepoConfigRegistration,
            &name,
            json!({
                "regex_include": request.regex_include,
                "regex_exclude": request.regex_exclude,
                "max_runtime_secs": request.max_runtime.map(|d| d.as_secs()),
            }),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(json!({"job_id": job_id}))))
}

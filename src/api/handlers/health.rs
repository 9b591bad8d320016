//! Liveness endpoint.

use crate::api::AppState;
use crate::error::Result;
use axum::extract::State;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// Basic liveness check: the process is up and the database answers.
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    sqlx::query("SELECT 1").execute(&state.db).await?;
    Ok(Json(json!({"status": "ok"})))
}

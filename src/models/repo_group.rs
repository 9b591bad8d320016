//! Repo group models.
//!
//! A repo group is a named (include/exclude) regex pair over repository
//! names. Servers bind groups with a cron schedule and concurrency caps.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A named regex pair over repository names.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RepoGroup {
    pub id: Uuid,
    pub name: String,
    pub regex_include: Option<String>,
    pub regex_exclude: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Binding of a repo group to a server: schedule plus runtime caps.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ServerRepoGroup {
    pub id: Uuid,
    pub pulp_server_id: Uuid,
    pub repo_group_id: Uuid,
    pub schedule: String,
    pub max_concurrent_syncs: i32,
    pub max_runtime_secs: i64,
    pub source_pulp_server_name: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

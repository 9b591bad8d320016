//! Job scheduler.
//!
//! Owns the clock: one timer per (server, repo-group) binding and one per
//! repo-config-registration schedule. Timers are kept as `next_run_at`
//! columns computed from the cron expression; a periodic sweep enqueues
//! jobs whose time has come and rolls the column forward. Next-run times
//! are recomputed from `now` at startup and on reload, so firings missed
//! while the process was down are not replayed.

use crate::error::{AppError, Result};
use crate::fleet::{parse_schedule, FleetConfig};
use crate::models::JobKind;
use crate::services::fleet_loader::FleetLoader;
use crate::services::job_store::JobStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::interval;
use uuid::Uuid;

/// How often due timers are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Next firing of a cron expression strictly after `now`.
pub fn next_fire(schedule: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_schedule(schedule)?
        .after(&now)
        .next()
        .ok_or_else(|| {
            AppError::ConfigInvalid(format!("cron expression '{schedule}' never fires"))
        })
}

/// Spawn the scheduler sweep loop as a background task.
pub fn spawn_scheduler(db: PgPool) {
    tokio::spawn(async move {
        let scheduler = Scheduler::new(db);
        let mut tick = interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            if let Err(e) = scheduler.run_due().await {
                tracing::error!(error = %e, "scheduler sweep failed");
            }
        }
    });
}

/// Evaluates cron timers and enqueues jobs.
#[derive(Clone)]
pub struct Scheduler {
    db: PgPool,
    job_store: JobStore,
    fleet: FleetLoader,
}

impl Scheduler {
    pub fn new(db: PgPool) -> Self {
        Self {
            job_store: JobStore::new(db.clone()),
            fleet: FleetLoader::new(db.clone()),
            db,
        }
    }

    /// Apply a (re)loaded fleet config and recompute every timer forward
    /// from now.
    pub async fn reload(&self, config: &FleetConfig) -> Result<()> {
        let servers = self.fleet.apply(config).await?;
        self.reset_timers().await?;
        tracing::info!(servers, "fleet config applied and timers registered");
        Ok(())
    }

    /// Recompute `next_run_at` for every active binding. Missed firings are
    /// skipped, not replayed.
    pub async fn reset_timers(&self) -> Result<()> {
        let now = Utc::now();

        #[derive(sqlx::FromRow)]
        struct BindingRow {
            id: Uuid,
            schedule: String,
        }

        let bindings: Vec<BindingRow> = sqlx::query_as(
            "SELECT id, schedule FROM pulp_server_repo_groups WHERE is_active = TRUE",
        )
        .fetch_all(&self.db)
        .await?;

        for binding in bindings {
            let next = next_fire(&binding.schedule, now)?;
            sqlx::query("UPDATE pulp_server_repo_groups SET next_run_at = $2 WHERE id = $1")
                .bind(binding.id)
                .bind(next)
                .execute(&self.db)
                .await?;
        }

        #[derive(sqlx::FromRow)]
        struct ServerRow {
            id: Uuid,
            repo_config_registration_schedule: Option<String>,
        }

        let servers: Vec<ServerRow> = sqlx::query_as(
            r#"
            SELECT id, repo_config_registration_schedule
            FROM pulp_servers
            WHERE is_active = TRUE AND repo_config_registration_schedule IS NOT NULL
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        for server in servers {
            let Some(schedule) = &server.repo_config_registration_schedule else {
                continue;
            };
            let next = next_fire(schedule, now)?;
            sqlx::query(
                "UPDATE pulp_servers SET repo_config_registration_next_run_at = $2 WHERE id = $1",
            )
            .bind(server.id)
            .bind(next)
            .execute(&self.db)
            .await?;
        }

        Ok(())
    }

    /// Enqueue jobs for every timer whose time has come and roll the timers
    /// forward.
    pub async fn run_due(&self) -> Result<()> {
        let now = Utc::now();
        self.run_due_group_syncs(now).await?;
        self.run_due_registrations(now).await?;
        Ok(())
    }

    async fn run_due_group_syncs(&self, now: DateTime<Utc>) -> Result<()> {
        #[derive(sqlx::FromRow)]
        struct DueBinding {
            id: Uuid,
            schedule: String,
            max_concurrent_syncs: i32,
            max_runtime_secs: i64,
            source_pulp_server_name: Option<String>,
            server_name: String,
            group_name: String,
            regex_include: Option<String>,
            regex_exclude: Option<String>,
        }

        let due: Vec<DueBinding> = sqlx::query_as(
            r#"
            SELECT b.id, b.schedule, b.max_concurrent_syncs, b.max_runtime_secs,
                   b.source_pulp_server_name,
                   s.name AS server_name,
                   g.name AS group_name, g.regex_include, g.regex_exclude
            FROM pulp_server_repo_groups b
            JOIN pulp_servers s ON s.id = b.pulp_server_id
            JOIN repo_groups g ON g.id = b.repo_group_id
            WHERE b.is_active = TRUE AND s.is_active = TRUE
              AND b.next_run_at IS NOT NULL AND b.next_run_at <= $1
            ORDER BY b.next_run_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        for binding in due {
            tracing::info!(
                server = %binding.server_name,
                group = %binding.group_name,
                "repo group sync due"
            );

            let job_id = self
                .enqueue(
                    JobKind::Sync,
                    &binding.server_name,
                    json!({
                        "repo_group": binding.group_name,
                        "regex_include": binding.regex_include,
                        "regex_exclude": binding.regex_exclude,
                        "max_concurrent_syncs": binding.max_concurrent_syncs,
                        "max_runtime_secs": binding.max_runtime_secs,
                        "source_pulp_server_name": binding.source_pulp_server_name,
                    }),
                )
                .await?;

            tracing::debug!(job_id = %job_id, "scheduled sync enqueued");

            let next = next_fire(&binding.schedule, now)?;
            sqlx::query("UPDATE pulp_server_repo_groups SET next_run_at = $2 WHERE id = $1")
                .bind(binding.id)
                .bind(next)
                .execute(&self.db)
                .await?;
        }

        Ok(())
    }

    async fn run_due_registrations(&self, now: DateTime<Utc>) -> Result<()> {
        #[derive(sqlx::FromRow)]
        struct DueServer {
            id: Uuid,
            name: String,
            repo_config_registration_schedule: Option<String>,
            repo_config_registration_max_runtime_secs: Option<i64>,
        }

        let due: Vec<DueServer> = sqlx::query_as(
            r#"
            SELECT id, name, repo_config_registration_schedule,
                   repo_config_registration_max_runtime_secs
            FROM pulp_servers
            WHERE is_active = TRUE
              AND repo_config_registration_next_run_at IS NOT NULL
              AND repo_config_registration_next_run_at <= $1
            ORDER BY repo_config_registration_next_run_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        for server in due {
            let Some(schedule) = server.repo_config_registration_schedule.clone() else {
                continue;
            };

            tracing::info!(server = %server.name, "repo config registration due");

            let job_id = self
                .enqueue(
                    JobKind::RepoConfigRegistration,
                    &server.name,
                    json!({
                        "max_runtime_secs": server.repo_config_registration_max_runtime_secs,
                    }),
                )
                .await?;

            tracing::debug!(job_id = %job_id, "scheduled registration enqueued");

            let next = next_fire(&schedule, now)?;
            sqlx::query(
                "UPDATE pulp_servers SET repo_config_registration_next_run_at = $2 WHERE id = $1",
            )
            .bind(server.id)
            .bind(next)
            .execute(&self.db)
            .await?;
        }

        Ok(())
    }

    /// Ad-hoc enqueue used by the API layer. Validates the server is part
    /// of the fleet, then creates a queued job.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        server: &str,
        params: serde_json::Value,
    ) -> Result<Uuid> {
        let known = self.fleet.server_by_name(server).await?;
        if known.is_none() {
            return Err(AppError::NotFound(format!(
                "pulp server {server} is not in the fleet"
            )));
        }

        self.job_store.create(None, kind, server, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_fire_daily() {
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap();
        let next = next_fire("0 4 * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 8, 4, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_same_day() {
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 2, 0, 0).unwrap();
        let next = next_fire("0 4 * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 7, 4, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_comma_list() {
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 9, 0, 0).unwrap();
        let next = next_fire("0 8,20 * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 7, 20, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_skips_missed_firings() {
        // A week of downtime: the next fire is computed forward from now,
        // not from the last recorded run.
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 5, 0, 0).unwrap();
        let next = next_fire("0 4 * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 15, 4, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_invalid_expression() {
        let now = Utc::now();
        assert!(next_fire("not cron", now).is_err());
    }
}

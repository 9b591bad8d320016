//! Fleet config application.
//!
//! Upserts the parsed fleet config into the catalog tables by natural key
//! (server name, group name). Entries that disappear from the config are
//! marked inactive rather than deleted so historical job records stay
//! attributable.

use crate::error::Result;
use crate::fleet::FleetConfig;
use crate::models::{PulpServer, PulpServerRepo, RepoGroup, ServerRepoGroup};
use sqlx::PgPool;
use uuid::Uuid;

/// Applies fleet config to the catalog tables.
#[derive(Clone)]
pub struct FleetLoader {
    db: PgPool,
}

impl FleetLoader {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Upsert the whole config. Returns the number of active servers.
    pub async fn apply(&self, config: &FleetConfig) -> Result<usize> {
        let mut tx = self.db.begin().await?;

        // Everything starts inactive; entries present in the config are
        // flipped back on as they are upserted.
        sqlx::query("UPDATE pulp_servers SET is_active = FALSE")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE repo_groups SET is_active = FALSE")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE pulp_server_repo_groups SET is_active = FALSE")
            .execute(&mut *tx)
            .await?;

        for (name, group) in &config.repo_groups {
            sqlx::query(
                r#"
                INSERT INTO repo_groups (name, regex_include, regex_exclude, is_active)
                VALUES ($1, $2, $3, TRUE)
                ON CONFLICT (name) DO UPDATE
                SET regex_include = EXCLUDED.regex_include,
                    regex_exclude = EXCLUDED.regex_exclude,
                    is_active = TRUE,
                    updated_at = NOW()
                "#,
            )
            .bind(name)
            .bind(&group.regex_include)
            .bind(&group.regex_exclude)
            .execute(&mut *tx)
            .await?;
        }

        for (name, server) in &config.pulp_servers {
            let credentials = &config.credentials[&server.credentials];
            let (registration_schedule, registration_max_runtime) =
                match &server.repo_config_registration {
                    Some(r) => (Some(r.schedule.clone()), Some(r.max_runtime.as_secs() as i64)),
                    None => (None, None),
                };

            let (server_id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO pulp_servers
                    (name, base_url, username, vault_service_account_mount,
                     snapshot_supported, max_concurrent_snapshots,
                     repo_config_registration_schedule,
                     repo_config_registration_max_runtime_secs, is_active)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE)
                ON CONFLICT (name) DO UPDATE
                SET base_url = EXCLUDED.base_url,
                    username = EXCLUDED.username,
                    vault_service_account_mount = EXCLUDED.vault_service_account_mount,
                    snapshot_supported = EXCLUDED.snapshot_supported,
                    max_concurrent_snapshots = EXCLUDED.max_concurrent_snapshots,
                    repo_config_registration_schedule = EXCLUDED.repo_config_registration_schedule,
                    repo_config_registration_max_runtime_secs =
                        EXCLUDED.repo_config_registration_max_runtime_secs,
                    is_active = TRUE,
                    updated_at = NOW()
                RETURNING id
                "#,
            )
            .bind(name)
            .bind(format!("https://{name}"))
            .bind(&credentials.username)
            .bind(&credentials.vault_service_account_mount)
            .bind(server.snapshot_support.is_some())
            .bind(
                server
                    .snapshot_support
                    .as_ref()
                    .map(|s| s.max_concurrent_snapshots as i32),
            )
            .bind(registration_schedule)
            .bind(registration_max_runtime)
            .fetch_one(&mut *tx)
            .await?;

            for (group_name, binding) in &server.repo_groups {
                sqlx::query(
                    r#"
                    INSERT INTO pulp_server_repo_groups
                        (pulp_server_id, repo_group_id, schedule, max_concurrent_syncs,
                         max_runtime_secs, source_pulp_server_name, is_active)
                    SELECT $1, rg.id, $3, $4, $5, $6, TRUE
                    FROM repo_groups rg WHERE rg.name = $2
                    ON CONFLICT (pulp_server_id, repo_group_id) DO UPDATE
                    SET schedule = EXCLUDED.schedule,
                        max_concurrent_syncs = EXCLUDED.max_concurrent_syncs,
                        max_runtime_secs = EXCLUDED.max_runtime_secs,
                        source_pulp_server_name = EXCLUDED.source_pulp_server_name,
                        is_active = TRUE,
                        updated_at = NOW()
                    "#,
                )
                .bind(server_id)
                .bind(group_name)
                .bind(&binding.schedule)
                .bind(binding.max_concurrent_sync as i32)
                .bind(binding.max_runtime.as_secs() as i64)
                .bind(&binding.pulp_master)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(config.pulp_servers.len())
    }

    pub async fn server_by_name(&self, name: &str) -> Result<Option<PulpServer>> {
        let server = sqlx::query_as(
            r#"
            SELECT id, name, base_url, username, vault_service_account_mount,
                   snapshot_supported, max_concurrent_snapshots,
                   repo_config_registration_schedule,
                   repo_config_registration_max_runtime_secs,
                   is_active, created_at, updated_at
            FROM pulp_servers
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        Ok(server)
    }

    pub async fn active_servers(&self) -> Result<Vec<PulpServer>> {
        let servers = sqlx::query_as(
            r#"
            SELECT id, name, base_url, username, vault_service_account_mount,
                   snapshot_supported, max_concurrent_snapshots,
                   repo_config_registration_schedule,
                   repo_config_registration_max_runtime_secs,
                   is_active, created_at, updated_at
            FROM pulp_servers
            WHERE is_active = TRUE
            ORDER BY name
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(servers)
    }

    /// Active group bindings for a server joined to their group regexes.
    pub async fn server_bindings(
        &self,
        server_id: Uuid,
    ) -> Result<Vec<(ServerRepoGroup, RepoGroup)>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            // binding
            id: Uuid,
            pulp_server_id: Uuid,
            repo_group_id: Uuid,
            schedule: String,
            max_concurrent_syncs: i32,
            max_runtime_secs: i64,
            source_pulp_server_name: Option<String>,
            next_run_at: Option<chrono::DateTime<chrono::Utc>>,
            is_active: bool,
            created_at: chrono::DateTime<chrono::Utc>,
            updated_at: chrono::DateTime<chrono::Utc>,
            // group
            group_name: String,
            regex_include: Option<String>,
            regex_exclude: Option<String>,
            group_is_active: bool,
            group_created_at: chrono::DateTime<chrono::Utc>,
            group_updated_at: chrono::DateTime<chrono::Utc>,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT b.id, b.pulp_server_id, b.repo_group_id, b.schedule,
                   b.max_concurrent_syncs, b.max_runtime_secs,
                   b.source_pulp_server_name, b.next_run_at, b.is_active,
                   b.created_at, b.updated_at,
                   g.name AS group_name, g.regex_include, g.regex_exclude,
                   g.is_active AS group_is_active,
                   g.created_at AS group_created_at,
                   g.updated_at AS group_updated_at
            FROM pulp_server_repo_groups b
            JOIN repo_groups g ON g.id = b.repo_group_id
            WHERE b.pulp_server_id = $1 AND b.is_active = TRUE AND g.is_active = TRUE
            ORDER BY g.name
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    ServerRepoGroup {
                        id: r.id,
                        pulp_server_id: r.pulp_server_id,
                        repo_group_id: r.repo_group_id,
                        schedule: r.schedule,
                        max_concurrent_syncs: r.max_concurrent_syncs,
                        max_runtime_secs: r.max_runtime_secs,
                        source_pulp_server_name: r.source_pulp_server_name,
                        next_run_at: r.next_run_at,
                        is_active: r.is_active,
                        created_at: r.created_at,
                        updated_at: r.updated_at,
                    },
                    RepoGroup {
                        id: r.repo_group_id,
                        name: r.group_name,
                        regex_include: r.regex_include,
                        regex_exclude: r.regex_exclude,
                        is_active: r.group_is_active,
                        created_at: r.group_created_at,
                        updated_at: r.group_updated_at,
                    },
                )
            })
            .collect())
    }

    /// Known repositories on a server, lexicographic by name.
    pub async fn server_repos(&self, server_id: Uuid) -> Result<Vec<PulpServerRepo>> {
        let repos = sqlx::query_as(
            r#"
            SELECT id, pulp_server_id, name, kind, repo_href, remote_href,
                   remote_feed, distribution_href, created_at, updated_at
            FROM pulp_server_repos
            WHERE pulp_server_id = $1
            ORDER BY name
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.db)
        .await?;

        Ok(repos)
    }
}

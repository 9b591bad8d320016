//! Dated snapshot publication.
//!
//! A snapshot is an immutable dated copy of a repository's published
//! content: publish the latest repository version (Pulp signs deb content
//! during publish when the repository references a signing service), then
//! bind the publication under a dated distribution base path. Repositories
//! are processed with bounded concurrency; each aborts on its first failed
//! step without affecting the rest.

use crate::config::AppSettings;
use crate::error::{AppError, Result};
use crate::models::{
    Job, JobKind, JobParams, JobState, PulpServerRepo, RepoTaskState,
};
use crate::pulp::{resources, PulpClient, Publication, Repository};
use crate::services::credentials::CredentialsResolver;
use crate::services::fleet_loader::FleetLoader;
use crate::services::inventory::ServerInventory;
use crate::services::job_store::JobStore;
use crate::services::matcher::RepoMatcher;
use crate::services::repo_syncher::{aggregate_state, RepoOutcome};
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Extra polling time granted past the deadline, matching the sync driver.
const DEADLINE_GRACE: Duration = Duration::from_secs(30);

const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(4 * 3600);

/// Which steps of the snapshot pipeline a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Publish then distribute (a full snapshot).
    Full,
    /// Publish only.
    PublishOnly,
    /// Distribute the newest existing publication only.
    DistributeOnly,
}

impl SnapshotMode {
    pub fn from_kind(kind: JobKind) -> Option<Self> {
        match kind {
            JobKind::Snapshot => Some(Self::Full),
            JobKind::Publish => Some(Self::PublishOnly),
            JobKind::Distribute => Some(Self::DistributeOnly),
            _ => None,
        }
    }

    fn publishes(&self) -> bool {
        matches!(self, Self::Full | Self::PublishOnly)
    }

    fn distributes(&self) -> bool {
        matches!(self, Self::Full | Self::DistributeOnly)
    }
}

/// Snapshot distribution name: prefix + repo name, with the `snap-` marker
/// enforced on the prefix.
pub fn snapshot_name(prefix: &str, repo_name: &str) -> String {
    let prefix = if prefix.starts_with("snap-") {
        prefix.to_string()
    } else {
        format!("snap-{prefix}")
    };
    format!("{prefix}-{repo_name}")
}

/// Snapshot base path: `<repo name>/<YYYY-MM-DD>`.
pub fn snapshot_base_path(repo_name: &str, date: NaiveDate) -> String {
    format!("{repo_name}/{}", date.format("%Y-%m-%d"))
}

struct SnapshotContext {
    client: PulpClient,
    job_store: JobStore,
    job_id: uuid::Uuid,
    mode: SnapshotMode,
    prefix: String,
    date: NaiveDate,
    allow_reuse: bool,
    signing_service_href: Option<String>,
    deadline: Instant,
    cancel: CancellationToken,
}

/// Drives snapshot, publish, and distribute jobs for one Pulp server.
pub struct Snapshotter {
    db: sqlx::PgPool,
    job_store: JobStore,
    fleet: FleetLoader,
    resolver: CredentialsResolver,
    settings: AppSettings,
}

impl Snapshotter {
    pub fn new(
        db: sqlx::PgPool,
        resolver: CredentialsResolver,
        settings: AppSettings,
    ) -> Self {
        Self {
            job_store: JobStore::new(db.clone()),
            fleet: FleetLoader::new(db.clone()),
            db,
            resolver,
            settings,
        }
    }

    /// Execute a snapshot-family job and return the aggregate state.
    pub async fn run(&self, job: &Job, cancel: CancellationToken) -> Result<JobState> {
        let mode = SnapshotMode::from_kind(job.kind).ok_or_else(|| {
            AppError::Internal(format!("job kind {} is not a snapshot operation", job.kind))
        })?;
        let params = JobParams::from_value(&job.params);

        let server = self
            .fleet
            .server_by_name(&job.pulp_server)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("pulp server {} not found", job.pulp_server))
            })?;

        if mode == SnapshotMode::Full && !server.snapshot_supported {
            return Err(AppError::Validation(format!(
                "pulp server {} does not have snapshot support enabled",
                server.name
            )));
        }

        let credentials = self
            .resolver
            .resolve(&server.username, &server.vault_service_account_mount)
            .await?;
        let client = PulpClient::new(
            &server.base_url,
            &credentials.username,
            &credentials.password,
            &self.settings.remotes,
        )?;

        let inventory = ServerInventory::fetch(&client).await?;
        inventory.persist(&self.db, server.id).await?;

        let matcher = RepoMatcher::new(
            params.regex_include.as_deref(),
            params.regex_exclude.as_deref(),
        )?;
        let repos = self.fleet.server_repos(server.id).await?;
        let targets = matcher.filter(repos, |r| r.name.as_str());

        let signing_service_href = self.deb_signing_service_href(&client).await?;

        let max_runtime = match params.max_runtime_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => DEFAULT_MAX_RUNTIME,
        };
        let deadline = Instant::now() + max_runtime;

        let date = Utc::now().date_naive();
        let concurrency = server.max_concurrent_snapshots.unwrap_or(1).max(1) as usize;
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let context = Arc::new(SnapshotContext {
            client,
            job_store: self.job_store.clone(),
            job_id: job.id,
            mode,
            prefix: params
                .snapshot_prefix
                .unwrap_or_else(|| format!("snap-{}", date.format("%Y-%m-%d"))),
            date,
            allow_reuse: params.allow_snapshot_reuse.unwrap_or(false),
            signing_service_href,
            deadline,
            cancel: cancel.clone(),
        });

        tracing::info!(
            job_id = %job.id,
            server = %server.name,
            mode = ?mode,
            targets = targets.len(),
            concurrency,
            "starting snapshot batch"
        );

        let mut outcomes: Vec<RepoOutcome> = Vec::with_capacity(targets.len());
        let mut in_flight: JoinSet<RepoOutcome> = JoinSet::new();

        for repo in targets {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore closed"),
                _ = cancel.cancelled() => {
                    self.record_unstarted(job.id, &repo.name, RepoOutcome::Canceled).await?;
                    outcomes.push(RepoOutcome::Canceled);
                    continue;
                }
            };

            if Instant::now() >= deadline {
                drop(permit);
                self.record_unstarted(job.id, &repo.name, RepoOutcome::TimedOut)
                    .await?;
                outcomes.push(RepoOutcome::TimedOut);
                continue;
            }
            if cancel.is_cancelled() {
                drop(permit);
                self.record_unstarted(job.id, &repo.name, RepoOutcome::Canceled)
                    .await?;
                outcomes.push(RepoOutcome::Canceled);
                continue;
            }

            let context = context.clone();
            in_flight.spawn(async move {
                let outcome = snapshot_one_repo(&context, &repo).await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "snapshot task panicked");
                    outcomes.push(RepoOutcome::Failed);
                }
            }
        }

        let state = aggregate_state(&outcomes, cancel.is_cancelled());
        tracing::info!(job_id = %job.id, state = %state, "snapshot batch finished");
        Ok(state)
    }

    async fn deb_signing_service_href(&self, client: &PulpClient) -> Result<Option<String>> {
        let Some(name) = &self.settings.pulp.deb_signing_service else {
            return Ok(None);
        };

        let services: Vec<serde_json::Value> = client
            .list_all(
                "/pulp/api/v3/signing-services/",
                &[("name", name.clone())],
            )
            .await?;

        let href = services
            .first()
            .and_then(|s| s.get("pulp_href"))
            .and_then(|h| h.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::ConfigInvalid(format!("could not find signing service {name}"))
            })?;

        Ok(Some(href))
    }

    async fn record_unstarted(
        &self,
        job_id: uuid::Uuid,
        repo: &str,
        outcome: RepoOutcome,
    ) -> Result<()> {
        let state = match outcome {
            RepoOutcome::TimedOut => RepoTaskState::TimedOut,
            _ => RepoTaskState::Canceled,
        };
        let reason = match outcome {
            RepoOutcome::TimedOut => "deadline expired before the snapshot was started",
            _ => "canceled before the snapshot was started",
        };
        self.job_store
            .record_repo_result(job_id, repo, state, None, Some(json!({"msg": reason})), None)
            .await
    }
}

/// Run one repository through publish and distribute, recording the
/// terminal outcome.
async fn snapshot_one_repo(context: &SnapshotContext, repo: &PulpServerRepo) -> RepoOutcome {
    let started_at = Utc::now();

    let (outcome, error) = match drive_snapshot(context, repo).await {
        Ok(()) => (RepoOutcome::Completed, None),
        Err(e) => {
            let outcome = match &e {
                AppError::Deadline(_) => RepoOutcome::TimedOut,
                AppError::Canceled(_) => RepoOutcome::Canceled,
                _ => RepoOutcome::Failed,
            };
            (outcome, Some(e.to_job_error()))
        }
    };

    let state = match outcome {
        RepoOutcome::Completed => RepoTaskState::Completed,
        RepoOutcome::TimedOut => RepoTaskState::TimedOut,
        RepoOutcome::Canceled => RepoTaskState::Canceled,
        _ => RepoTaskState::Failed,
    };

    if let Err(e) = context
        .job_store
        .record_repo_result(
            context.job_id,
            &repo.name,
            state,
            None,
            error,
            Some(started_at),
        )
        .await
    {
        tracing::error!(
            job_id = %context.job_id,
            repo = %repo.name,
            error = %e,
            "failed to record snapshot result"
        );
    }

    outcome
}

/// Per-repo snapshot steps, aborting on the first failure.
async fn drive_snapshot(context: &SnapshotContext, repo: &PulpServerRepo) -> Result<()> {
    let client = &context.client;
    let deadline = Some(context.deadline + DEADLINE_GRACE);

    let live: Repository = client.get(&repo.repo_href).await?;
    let version_href = live.latest_version_href.clone().ok_or_else(|| {
        AppError::Validation(format!(
            "repository {} has no version to snapshot",
            repo.name
        ))
    })?;

    // Signing happens inside publish; the repository has to reference the
    // service before the publication is created.
    if context.mode.publishes() {
        if let Some(signing) = &context.signing_service_href {
            if repo.kind == crate::models::RepoKind::Deb
                && live.signing_service.as_deref() != Some(signing)
            {
                let task = client
                    .patch_task(&repo.repo_href, &json!({"signing_service": signing}))
                    .await?;
                client.wait_task(&task, deadline, &context.cancel).await?;
            }
        }
    }

    let Some(publications_path) = resources::publications_path(repo.kind) else {
        // Content types without publications (container) serve straight
        // from the repository; only the distribution step applies.
        if context.mode.distributes() {
            return ensure_snapshot_distribution(context, repo, None).await;
        }
        return Ok(());
    };

    let publication_href = if context.mode.publishes() {
        let body = resources::publication_body(repo.kind, &version_href, false);
        let task_href = client.post_task(publications_path, &body).await?;
        let task = client
            .wait_task(&task_href, deadline, &context.cancel)
            .await?;
        task.created_resource("/publications/")
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "publish of {} created no publication",
                    repo.name
                ))
            })?
    } else {
        // Distribute-only reuses the newest publication for the version.
        let publications: Vec<Publication> = client
            .list_all(
                publications_path,
                &[("repository_version", version_href.clone())],
            )
            .await?;
        publications
            .first()
            .and_then(|p| p.pulp_href.clone())
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "repository {} has no publication to distribute",
                    repo.name
                ))
            })?
    };

    if context.mode.distributes() {
        ensure_snapshot_distribution(context, repo, Some(&publication_href)).await?;
    }

    Ok(())
}

/// Create the dated snapshot distribution, or update it when reuse is
/// allowed.
async fn ensure_snapshot_distribution(
    context: &SnapshotContext,
    repo: &PulpServerRepo,
    publication_href: Option<&str>,
) -> Result<()> {
    let client = &context.client;
    let deadline = Some(context.deadline + DEADLINE_GRACE);
    let name = snapshot_name(&context.prefix, &repo.name);
    let base_path = snapshot_base_path(&repo.name, context.date);

    let distributions_path = resources::distributions_path(repo.kind);
    let existing: Vec<serde_json::Value> = client
        .list_all(distributions_path, &[("name", name.clone())])
        .await?;

    let mut body = json!({
        "name": name,
        "base_path": base_path,
    });
    match publication_href {
        Some(href) => body["publication"] = json!(href),
        // No publication step for this content type: bind the repository.
        None => body["repository"] = json!(repo.repo_href),
    }

    match existing.first() {
        None => {
            let task = client.post_task(distributions_path, &body).await?;
            client.wait_task(&task, deadline, &context.cancel).await?;
        }
        Some(distribution) if context.allow_reuse => {
            let href = distribution
                .get("pulp_href")
                .and_then(|h| h.as_str())
                .ok_or_else(|| {
                    AppError::Internal(format!("distribution {name} has no href"))
                })?;
            let task = client.patch_task(href, &body).await?;
            client.wait_task(&task, deadline, &context.cancel).await?;
        }
        Some(_) => {
            return Err(AppError::Conflict(format!(
                "snapshot distribution {name} already exists"
            )));
        }
    }

    Ok(())
}

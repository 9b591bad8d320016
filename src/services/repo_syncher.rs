//! Bounded-concurrency sync driver.
//!
//! Given a sync job, drives Pulp syncs for every matched repository to a
//! terminal state: a worker pool of exactly `max_concurrent_syncs` in-flight
//! submissions, a wall-clock deadline over the whole batch, per-repo outcome
//! records as each repo finishes, and a cancellation context that stops
//! submissions and asks Pulp to cancel whatever is still running.
//!
//! Submissions are issued in lexicographic target order; completions land in
//! whatever order Pulp finishes them.

use crate::config::AppSettings;
use crate::error::{AppError, Result};
use crate::models::{
    Job, JobKind, JobParams, JobState, PulpServer, PulpServerRepo, RepoTaskState,
};
use crate::pulp::{resources, PulpClient};
use crate::services::credentials::CredentialsResolver;
use crate::services::fleet_loader::FleetLoader;
use crate::services::inventory::ServerInventory;
use crate::services::job_store::JobStore;
use crate::services::matcher::RepoMatcher;
use chrono::Utc;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Extra polling time granted to in-flight syncs after the deadline fires.
const DEADLINE_GRACE: Duration = Duration::from_secs(30);

/// Fallback wall-clock budget when a job carries none.
const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(6 * 3600);

/// Terminal outcome of one repository inside a sync batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoOutcome {
    Completed,
    Failed,
    TimedOut,
    Canceled,
    SkippedConflict,
    SkippedMissingOnSource,
}

impl RepoOutcome {
    fn task_state(&self) -> RepoTaskState {
        match self {
            Self::Completed => RepoTaskState::Completed,
            Self::Failed => RepoTaskState::Failed,
            Self::TimedOut => RepoTaskState::TimedOut,
            Self::Canceled => RepoTaskState::Canceled,
            Self::SkippedConflict => RepoTaskState::SkippedConflict,
            Self::SkippedMissingOnSource => RepoTaskState::SkippedMissingOnSource,
        }
    }
}

/// Fold per-repo outcomes into the aggregate job state.
///
/// Cancellation dominates, then the deadline, then failure. Skipped repos
/// are neutral: a batch where every attempted repo completed succeeds.
pub fn aggregate_state(outcomes: &[RepoOutcome], cancel_observed: bool) -> JobState {
    if cancel_observed || outcomes.iter().any(|o| *o == RepoOutcome::Canceled) {
        return JobState::Canceled;
    }
    if outcomes.iter().any(|o| *o == RepoOutcome::TimedOut) {
        return JobState::TimedOut;
    }
    if outcomes.iter().any(|o| *o == RepoOutcome::Failed) {
        return JobState::Failed;
    }
    JobState::Succeeded
}

/// Package content hrefs whose name matches the banned regex.
pub fn banned_package_hrefs(packages: &[serde_json::Value], banned: &Regex) -> Vec<String> {
    packages
        .iter()
        .filter_map(|package| {
            // Deb content calls the field "package"; rpm calls it "name".
            let name = package
                .get("name")
                .or_else(|| package.get("package"))?
                .as_str()?;
            if banned.is_match(name) {
                package.get("pulp_href")?.as_str().map(str::to_string)
            } else {
                None
            }
        })
        .collect()
}

struct SyncContext {
    client: PulpClient,
    job_store: JobStore,
    job_id: uuid::Uuid,
    settings: AppSettings,
    deadline: Instant,
    cancel: CancellationToken,
}

/// Drives sync jobs for one Pulp server.
pub struct RepoSyncher {
    db: sqlx::PgPool,
    job_store: JobStore,
    fleet: FleetLoader,
    resolver: CredentialsResolver,
    settings: AppSettings,
}

impl RepoSyncher {
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

    /// Execute a sync job to completion and return the aggregate state.
    pub async fn run(&self, job: &Job, cancel: CancellationToken) -> Result<JobState> {
        let params = JobParams::from_value(&job.params);
        let server = self
            .fleet
            .server_by_name(&job.pulp_server)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("pulp server {} not found", job.pulp_server))
            })?;

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

        // Pre-scan: refresh the repo cache from the live server so matching
        // runs against what actually exists.
        let inventory = ServerInventory::fetch(&client).await?;
        inventory.persist(&self.db, server.id).await?;

        let matcher = RepoMatcher::new(
            params.regex_include.as_deref(),
            params.regex_exclude.as_deref(),
        )?;
        let repos = self.fleet.server_repos(server.id).await?;
        // Only repositories with an upstream remote can sync.
        let syncable: Vec<PulpServerRepo> = repos
            .into_iter()
            .filter(|r| r.remote_href.is_some())
            .collect();
        let targets = matcher.filter(syncable, |r| r.name.as_str());

        let conflicts = self.conflicting_repos(job, &server).await?;
        let source_repos = match &params.source_pulp_server_name {
            Some(source) => Some(self.source_repo_names(source).await?),
            None => None,
        };

        let max_runtime = match params.max_runtime_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => DEFAULT_MAX_RUNTIME,
        };
        let deadline = Instant::now() + max_runtime;

        let concurrency = params.max_concurrent_syncs.unwrap_or(1).max(1) as usize;
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let context = Arc::new(SyncContext {
            client,
            job_store: self.job_store.clone(),
            job_id: job.id,
            settings: self.settings.clone(),
            deadline,
            cancel: cancel.clone(),
        });

        tracing::info!(
            job_id = %job.id,
            server = %server.name,
            targets = targets.len(),
            concurrency,
            max_runtime_secs = max_runtime.as_secs(),
            "starting repo sync batch"
        );

        let mut outcomes: Vec<RepoOutcome> = Vec::with_capacity(targets.len());
        let mut in_flight: JoinSet<RepoOutcome> = JoinSet::new();

        for repo in targets {
            // Skips are recorded up front, before any submission.
            if conflicts.contains(&repo.name) {
                self.record_skip(job.id, &repo.name, RepoTaskState::SkippedConflict)
                    .await?;
                outcomes.push(RepoOutcome::SkippedConflict);
                continue;
            }
            if let Some(source_names) = &source_repos {
                if !source_names.contains(&repo.name) {
                    self.record_skip(
                        job.id,
                        &repo.name,
                        RepoTaskState::SkippedMissingOnSource,
                    )
                    .await?;
                    outcomes.push(RepoOutcome::SkippedMissingOnSource);
                    continue;
                }
            }

            // The permit is taken here, in lexicographic order, so at most
            // `concurrency` syncs are ever in flight and submissions are
            // issued in order.
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("semaphore closed")
                }
                _ = cancel.cancelled() => {
                    self.record_unstarted(job.id, &repo.name, RepoOutcome::Canceled).await?;
                    outcomes.push(RepoOutcome::Canceled);
                    continue;
                }
            };

            if Instant::now() >= deadline {
                // Deadline fired: nothing new gets submitted.
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
                let outcome = sync_one_repo(&context, &repo).await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "sync task panicked");
                    outcomes.push(RepoOutcome::Failed);
                }
            }
        }

        let state = aggregate_state(&outcomes, cancel.is_cancelled());
        tracing::info!(job_id = %job.id, state = %state, "repo sync batch finished");
        Ok(state)
    }

    /// Names covered by other active sync jobs on the same server.
    async fn conflicting_repos(
        &self,
        job: &Job,
        server: &PulpServer,
    ) -> Result<BTreeSet<String>> {
        let mut conflicts = BTreeSet::new();
        let active = self.job_store.list_active(&server.name, JobKind::Sync).await?;
        let repos = self.fleet.server_repos(server.id).await?;

        for other in active.iter().filter(|j| j.id != job.id && j.state == JobState::Running) {
            let other_params = JobParams::from_value(&other.params);
            let Ok(matcher) = RepoMatcher::new(
                other_params.regex_include.as_deref(),
                other_params.regex_exclude.as_deref(),
            ) else {
                continue;
            };
            for repo in &repos {
                if matcher.matches(&repo.name) {
                    conflicts.insert(repo.name.clone());
                }
            }
        }

        Ok(conflicts)
    }

    /// Repo names known on the source server, for the secondary cross-check.
    async fn source_repo_names(&self, source: &str) -> Result<BTreeSet<String>> {
        let server = self.fleet.server_by_name(source).await?.ok_or_else(|| {
            AppError::NotFound(format!("source pulp server {source} not found"))
        })?;
        let repos = self.fleet.server_repos(server.id).await?;
        Ok(repos.into_iter().map(|r| r.name).collect())
    }

    async fn record_skip(
        &self,
        job_id: uuid::Uuid,
        repo: &str,
        state: RepoTaskState,
    ) -> Result<()> {
        self.job_store
            .record_repo_result(job_id, repo, state, None, None, None)
            .await
    }

    async fn record_unstarted(
        &self,
        job_id: uuid::Uuid,
        repo: &str,
        outcome: RepoOutcome,
    ) -> Result<()> {
        let reason = match outcome {
            RepoOutcome::TimedOut => "deadline expired before the sync was submitted",
            _ => "canceled before the sync was submitted",
        };
        self.job_store
            .record_repo_result(
                job_id,
                repo,
                outcome.task_state(),
                None,
                Some(json!({"msg": reason})),
                None,
            )
            .await
    }
}

/// Run one repository through sync and its post-sync stages, recording the
/// terminal outcome. Never propagates per-repo errors to the batch.
async fn sync_one_repo(context: &SyncContext, repo: &PulpServerRepo) -> RepoOutcome {
    let started_at = Utc::now();
    let result = drive_repo_pipeline(context, repo).await;

    let (outcome, task_href, error) = match result {
        Ok(task_href) => (RepoOutcome::Completed, task_href, None),
        Err(PipelineError { error, task_href }) => {
            let outcome = match &error {
                AppError::Deadline(_) => RepoOutcome::TimedOut,
                AppError::Canceled(_) => RepoOutcome::Canceled,
                _ => RepoOutcome::Failed,
            };
            (outcome, task_href, Some(error.to_job_error()))
        }
    };

    if let Err(e) = context
        .job_store
        .record_repo_result(
            context.job_id,
            &repo.name,
            outcome.task_state(),
            task_href.as_deref(),
            error,
            Some(started_at),
        )
        .await
    {
        tracing::error!(
            job_id = %context.job_id,
            repo = %repo.name,
            error = %e,
            "failed to record repo result"
        );
    }

    outcome
}

struct PipelineError {
    error: AppError,
    task_href: Option<String>,
}

/// Sync, then strip banned packages, then publish. Returns the sync task
/// href for the result record.
async fn drive_repo_pipeline(
    context: &SyncContext,
    repo: &PulpServerRepo,
) -> std::result::Result<Option<String>, PipelineError> {
    let client = &context.client;
    let deadline = Some(context.deadline + DEADLINE_GRACE);

    let sync_body = json!({ "remote": repo.remote_href });
    let sync_url = format!("{}sync/", repo.repo_href);

    let task_href = client
        .post_task(&sync_url, &sync_body)
        .await
        .map_err(|error| PipelineError { error, task_href: None })?;

    tracing::debug!(repo = %repo.name, task = %task_href, "sync submitted");

    let wrap_href = task_href.clone();
    let wrap = move |error: AppError| PipelineError {
        error,
        task_href: Some(wrap_href.clone()),
    };

    let task = match client
        .wait_task(&task_href, deadline, &context.cancel)
        .await
    {
        Ok(task) => task,
        Err(error) => {
            if matches!(error, AppError::Canceled(_)) {
                client.cancel_task(&task_href).await;
            }
            return Err(wrap(error));
        }
    };

    // No new repository version means the sync was a no-op; nothing to
    // publish.
    let Some(version_href) = task.created_resource("/versions/").map(str::to_string) else {
        return Ok(Some(task_href));
    };

    let mut publish_version = version_href.clone();

    if let Some(banned) = banned_regex(context, repo) {
        match remove_banned_packages(context, repo, &version_href, &banned).await {
            Ok(Some(new_version)) => publish_version = new_version,
            Ok(None) => {}
            Err(error) => return Err(wrap(error)),
        }
    }

    if let Err(error) = ensure_publication(context, repo, &publish_version).await {
        return Err(wrap(error));
    }

    Ok(Some(task_href))
}

/// Banned-package regex applying to this repo: configured, supported
/// content type, and an external feed. Internal feeds are trusted.
fn banned_regex(context: &SyncContext, repo: &PulpServerRepo) -> Option<Regex> {
    let pattern = context.settings.pulp.banned_package_regex.as_deref()?;
    resources::packages_path(repo.kind)?;
    if let Some(feed) = &repo.remote_feed {
        if context.settings.pulp.is_internal_url(feed) {
            return None;
        }
    }
    Regex::new(pattern).ok()
}

/// Remove banned packages from the new version via the repo modify
/// endpoint. Returns the version created by the modification, if any.
async fn remove_banned_packages(
    context: &SyncContext,
    repo: &PulpServerRepo,
    version_href: &str,
    banned: &Regex,
) -> Result<Option<String>> {
    let client = &context.client;
    let packages_path = resources::packages_path(repo.kind)
        .expect("banned_regex checked the content type");

    let packages: Vec<serde_json::Value> = client
        .list_all(
            packages_path,
            &[
                ("repository_version", version_href.to_string()),
                ("fields", "pulp_href,name,package".to_string()),
            ],
        )
        .await?;

    let hrefs = banned_package_hrefs(&packages, banned);
    if hrefs.is_empty() {
        return Ok(None);
    }

    tracing::info!(
        repo = %repo.name,
        count = hrefs.len(),
        "removing banned packages"
    );

    let modify_url = format!("{}modify/", repo.repo_href);
    let body = json!({
        "base_version": version_href,
        "remove_content_units": hrefs,
    });
    let task_href = client.post_task(&modify_url, &body).await?;
    let task = client
        .wait_task(
            &task_href,
            Some(context.deadline + DEADLINE_GRACE),
            &context.cancel,
        )
        .await?;

    Ok(task.created_resource("/versions/").map(str::to_string))
}

/// Publish the version unless a publication for it already exists.
async fn ensure_publication(
    context: &SyncContext,
    repo: &PulpServerRepo,
    version_href: &str,
) -> Result<()> {
    let Some(publications_path) = resources::publications_path(repo.kind) else {
        return Ok(());
    };
    let client = &context.client;

    let existing: Vec<serde_json::Value> = client
        .list_all(
            publications_path,
            &[("repository_version", version_href.to_string())],
        )
        .await?;
    if !existing.is_empty() {
        return Ok(());
    }

    let body = resources::publication_body(repo.kind, version_href, false);
    let task_href = client.post_task(publications_path, &body).await?;
    client
        .wait_task(
            &task_href,
            Some(context.deadline + DEADLINE_GRACE),
            &context.cancel,
        )
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── aggregate_state ─────────────────────────────────────────────────

    #[test]
    fn test_aggregate_all_completed() {
        let outcomes = vec![RepoOutcome::Completed; 10];
        assert_eq!(aggregate_state(&outcomes, false), JobState::Succeeded);
    }

    #[test]
    fn test_aggregate_partial_failure() {
        let outcomes = vec![
            RepoOutcome::Completed,
            RepoOutcome::Failed,
            RepoOutcome::Completed,
        ];
        assert_eq!(aggregate_state(&outcomes, false), JobState::Failed);
    }

    #[test]
    fn test_aggregate_timeout_beats_failure() {
        let outcomes = vec![
            RepoOutcome::Failed,
            RepoOutcome::TimedOut,
            RepoOutcome::Completed,
        ];
        assert_eq!(aggregate_state(&outcomes, false), JobState::TimedOut);
    }

    #[test]
    fn test_aggregate_cancel_dominates() {
        let outcomes = vec![
            RepoOutcome::TimedOut,
            RepoOutcome::Canceled,
            RepoOutcome::Failed,
        ];
        assert_eq!(aggregate_state(&outcomes, false), JobState::Canceled);
        assert_eq!(
            aggregate_state(&[RepoOutcome::Completed], true),
            JobState::Canceled
        );
    }

    #[test]
    fn test_aggregate_skips_are_neutral() {
        let outcomes = vec![
            RepoOutcome::Completed,
            RepoOutcome::SkippedConflict,
            RepoOutcome::SkippedMissingOnSource,
        ];
        assert_eq!(aggregate_state(&outcomes, false), JobState::Succeeded);
    }

    #[test]
    fn test_aggregate_empty_batch_succeeds() {
        assert_eq!(aggregate_state(&[], false), JobState::Succeeded);
    }

    // ── banned_package_hrefs ────────────────────────────────────────────

    #[test]
    fn test_banned_packages_rpm_field() {
        let packages = vec![
            json!({"pulp_href": "/content/rpm/packages/1/", "name": "package1"}),
            json!({"pulp_href": "/content/rpm/packages/2/", "name": "pp-skipfish-1"}),
            json!({"pulp_href": "/content/rpm/packages/3/", "name": "pp-nmap"}),
            json!({"pulp_href": "/content/rpm/packages/4/", "name": "sslstrip"}),
            json!({"pulp_href": "/content/rpm/packages/5/", "name": "package5"}),
        ];
        let banned = Regex::new("pp-skipfish-1|pp-nmap|sslstrip").unwrap();
        let hrefs = banned_package_hrefs(&packages, &banned);
        assert_eq!(
            hrefs,
            vec![
                "/content/rpm/packages/2/",
                "/content/rpm/packages/3/",
                "/content/rpm/packages/4/"
            ]
        );
    }

    #[test]
    fn test_banned_packages_deb_field() {
        let packages = vec![
            json!({"pulp_href": "/content/deb/packages/1/", "package": "sslstrip"}),
            json!({"pulp_href": "/content/deb/packages/2/", "package": "vim"}),
        ];
        let banned = Regex::new("sslstrip").unwrap();
        assert_eq!(
            banned_package_hrefs(&packages, &banned),
            vec!["/content/deb/packages/1/"]
        );
    }

    #[test]
    fn test_banned_packages_no_matches() {
        let packages = vec![json!({"pulp_href": "/p/1/", "name": "vim"})];
        let banned = Regex::new("nmap").unwrap();
        assert!(banned_package_hrefs(&packages, &banned).is_empty());
    }

    #[test]
    fn test_banned_packages_malformed_entries_ignored() {
        let packages = vec![
            json!({"name": "nmap"}),
            json!({"pulp_href": "/p/1/"}),
            json!("not an object"),
        ];
        let banned = Regex::new("nmap").unwrap();
        assert!(banned_package_hrefs(&packages, &banned).is_empty());
    }

    // ── outcome mapping ─────────────────────────────────────────────────

    #[test]
    fn test_outcome_to_task_state() {
        assert_eq!(
            RepoOutcome::Completed.task_state(),
            RepoTaskState::Completed
        );
        assert_eq!(RepoOutcome::TimedOut.task_state(), RepoTaskState::TimedOut);
        assert_eq!(
            RepoOutcome::SkippedConflict.task_state(),
            RepoTaskState::SkippedConflict
        );
        assert_eq!(
            RepoOutcome::SkippedMissingOnSource.task_state(),
            RepoTaskState::SkippedMissingOnSource
        );
    }
}

//! Job worker.
//!
//! Long-lived loop that dequeues jobs in FIFO order, claims them through
//! the job store (the claim is what makes concurrent workers safe),
//! short-circuits duplicates, and dispatches to the syncher, reconciler, or
//! snapshotter under a per-job cancellation context. Claimed jobs execute
//! concurrently up to a cap, so a second request overlapping a running
//! job's scope is observed as a duplicate rather than queued behind it. On
//! startup any job left in `running` belonged to a dead worker and is
//! failed; such jobs are not auto-resumed.

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Job, JobKind, JobParams, JobState};
use crate::services::credentials::CredentialsResolver;
use crate::services::job_store::JobStore;
use crate::services::reconciler::Reconciler;
use crate::services::repo_syncher::RepoSyncher;
use crate::services::snapshotter::Snapshotter;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// How often a running job's cancel flag is re-read from the store.
const CANCEL_POLL: Duration = Duration::from_secs(2);

/// Jobs one worker process executes at a time.
const MAX_CONCURRENT_JOBS: usize = 4;

/// Two jobs cover the same work when they share server, kind, and matching
/// scope. The enqueue-time parameter blob is the scope: the regex pair plus
/// the optional source server.
pub fn same_scope(a: &Job, b: &Job) -> bool {
    if a.kind != b.kind || a.pulp_server != b.pulp_server {
        return false;
    }
    let pa = JobParams::from_value(&a.params);
    let pb = JobParams::from_value(&b.params);
    pa.regex_include == pb.regex_include
        && pa.regex_exclude == pb.regex_exclude
        && pa.source_pulp_server_name == pb.source_pulp_server_name
}

/// Spawn the worker loop as a background task.
pub fn spawn_worker(db: PgPool, config: Config, resolver: CredentialsResolver) {
    tokio::spawn(async move {
        let worker = Arc::new(Worker::new(db, config, resolver));

        match worker.job_store.recover_orphaned().await {
            Ok(0) => {}
            Ok(recovered) => {
                tracing::warn!(recovered, "failed orphaned running jobs from a previous worker");
            }
            Err(e) => tracing::error!(error = %e, "orphan recovery failed"),
        }

        let mut tick = interval(Duration::from_secs(worker.poll_secs));
        loop {
            tick.tick().await;
            if let Err(e) = worker.clone().drain_queue().await {
                tracing::error!(error = %e, "worker queue drain failed");
            }
        }
    });
}

/// Dispatches queued jobs to the engine components.
pub struct Worker {
    job_store: JobStore,
    syncher: RepoSyncher,
    reconciler: Reconciler,
    snapshotter: Snapshotter,
    slots: Arc<Semaphore>,
    worker_name: String,
    poll_secs: u64,
}

impl Worker {
    pub fn new(db: PgPool, config: Config, resolver: CredentialsResolver) -> Self {
        let worker_name = format!(
            "{}:{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "pulp-manager".into()),
            std::process::id()
        );

        Self {
            job_store: JobStore::new(db.clone()),
            syncher: RepoSyncher::new(db.clone(), resolver.clone(), config.app.clone()),
            reconciler: Reconciler::new(db.clone(), resolver.clone(), config.app.clone()),
            snapshotter: Snapshotter::new(db, resolver, config.app.clone()),
            slots: Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS)),
            worker_name,
            poll_secs: config.worker_poll_secs,
        }
    }

    /// Claim queued jobs and spawn their execution until the queue is
    /// empty. Claiming happens here, synchronously, so the next loop
    /// iteration never sees the same job again.
    pub async fn drain_queue(self: Arc<Self>) -> Result<()> {
        loop {
            let permit = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .expect("worker slots closed");

            let Some(job) = self.job_store.find_next_queued().await? else {
                return Ok(());
            };

            if self.is_duplicate(&job).await? {
                if self.job_store.mark_skipped_duplicate(job.id).await? {
                    tracing::info!(
                        job_id = %job.id,
                        kind = %job.kind,
                        server = %job.pulp_server,
                        "skipped duplicate job"
                    );
                }
                continue;
            }

            if !self.job_store.claim(job.id, &self.worker_name).await? {
                // Another worker won the claim.
                continue;
            }

            let worker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.execute(job).await {
                    tracing::error!(error = %e, "job execution failed");
                }
                drop(permit);
            });
        }
    }

    /// Run one claimed job through dispatch and the terminal transition.
    async fn execute(&self, job: Job) -> Result<()> {
        tracing::info!(
            job_id = %job.id,
            kind = %job.kind,
            server = %job.pulp_server,
            "job started"
        );

        // Per-job cancellation context, fed from the durable cancel flag so
        // cancel requests reach jobs owned by any worker process.
        let cancel = CancellationToken::new();
        let watcher = self.spawn_cancel_watcher(job.id, cancel.clone());

        let outcome = self.dispatch(&job, cancel.clone()).await;
        watcher.abort();

        let (state, error) = match outcome {
            Ok(state) => (state, None),
            Err(e) => {
                let state = match &e {
                    AppError::Deadline(_) => JobState::TimedOut,
                    AppError::Canceled(_) => JobState::Canceled,
                    _ => JobState::Failed,
                };
                (state, Some(e.to_job_error()))
            }
        };

        self.job_store.mark_terminal(job.id, state, error).await?;
        tracing::info!(job_id = %job.id, state = %state, "job finished");
        Ok(())
    }

    async fn dispatch(&self, job: &Job, cancel: CancellationToken) -> Result<JobState> {
        if self.job_store.cancel_requested(job.id).await? {
            return Ok(JobState::Canceled);
        }

        match job.kind {
            JobKind::Sync => self.syncher.run(job, cancel).await,
            JobKind::Snapshot | JobKind::Publish | JobKind::Distribute => {
                self.snapshotter.run(job, cancel).await
            }
            JobKind::Reconcile | JobKind::RepoConfigRegistration => {
                self.reconciler.run(job, cancel).await
            }
        }
    }

    /// A job is a duplicate when another active job already covers the same
    /// (server, kind, scope). Ties go to the earlier enqueue.
    async fn is_duplicate(&self, job: &Job) -> Result<bool> {
        let active = self
            .job_store
            .list_active(&job.pulp_server, job.kind)
            .await?;

        Ok(active.iter().any(|other| {
            other.id != job.id
                && same_scope(job, other)
                && (other.state == JobState::Running || other.enqueued_at < job.enqueued_at)
        }))
    }

    fn spawn_cancel_watcher(
        &self,
        job_id: uuid::Uuid,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let job_store = self.job_store.clone();
        tokio::spawn(async move {
            let mut tick = interval(CANCEL_POLL);
            loop {
                tick.tick().await;
                match job_store.cancel_requested(job_id).await {
                    Ok(true) => {
                        tracing::info!(job_id = %job_id, "cancel requested");
                        cancel.cancel();
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "cancel flag check failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn job(kind: JobKind, server: &str, params: serde_json::Value) -> Job {
        Job {
            id: Uuid::new_v4(),
            parent_id: None,
            kind,
            pulp_server: server.to_string(),
            state: JobState::Queued,
            params,
            error: None,
            cancel_requested: false,
            worker_name: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_same_scope_identical_params() {
        let a = job(
            JobKind::Sync,
            "pulp1.example.com",
            json!({"regex_include": "^ext-", "max_concurrent_syncs": 2}),
        );
        let b = job(
            JobKind::Sync,
            "pulp1.example.com",
            json!({"regex_include": "^ext-", "max_concurrent_syncs": 4}),
        );
        // Concurrency caps are not part of the scope.
        assert!(same_scope(&a, &b));
    }

    #[test]
    fn test_same_scope_different_regex() {
        let a = job(JobKind::Sync, "pulp1", json!({"regex_include": "^ext-"}));
        let b = job(JobKind::Sync, "pulp1", json!({"regex_include": "^corp-"}));
        assert!(!same_scope(&a, &b));
    }

    #[test]
    fn test_same_scope_different_kind_or_server() {
        let a = job(JobKind::Sync, "pulp1", json!({}));
        let b = job(JobKind::Snapshot, "pulp1", json!({}));
        let c = job(JobKind::Sync, "pulp2", json!({}));
        assert!(!same_scope(&a, &b));
        assert!(!same_scope(&a, &c));
    }

    #[test]
    fn test_same_scope_source_server_counts() {
        let a = job(
            JobKind::Sync,
            "pulp2",
            json!({"source_pulp_server_name": "pulp1"}),
        );
        let b = job(JobKind::Sync, "pulp2", json!({}));
        assert!(!same_scope(&a, &b));
    }
}

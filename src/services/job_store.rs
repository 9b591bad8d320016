//! Durable job records.
//!
//! Narrow query functions over the `jobs` and `repo_task_results` tables.
//! State transitions use the claim pattern: a conditional UPDATE whose
//! affected-row count decides the winner, which is what enforces the
//! at-most-one-running invariant across workers. Every transition is
//! committed before the caller makes any Pulp call that depends on it.

use crate::error::{AppError, Result};
use crate::models::{Job, JobKind, JobState, RepoTaskResult, RepoTaskState};
use sqlx::PgPool;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, parent_id, kind, pulp_server, state, params, error, \
     cancel_requested, worker_name, enqueued_at, started_at, finished_at";

/// Store for job lifecycle records.
#[derive(Clone)]
pub struct JobStore {
    db: PgPool,
}

impl JobStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Create a job in `queued`. Atomic; returns the new job id.
    pub async fn create(
        &self,
        parent_id: Option<Uuid>,
        kind: JobKind,
        pulp_server: &str,
        params: serde_json::Value,
    ) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO jobs (parent_id, kind, pulp_server, params)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(parent_id)
        .bind(kind)
        .bind(pulp_server)
        .bind(params)
        .fetch_one(&self.db)
        .await?;

        Ok(id)
    }

    /// Transition `queued -> running` iff the job is still queued. Returns
    /// false when another worker won the claim or the job left `queued`.
    pub async fn claim(&self, job_id: Uuid, worker_name: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'running', started_at = NOW(), worker_name = $2
            WHERE id = $1 AND state = 'queued'
            "#,
        )
        .bind(job_id)
        .bind(worker_name)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition `running -> terminal`, setting `finished_at` exactly once.
    /// Re-marking an identical terminal state is a no-op; any other
    /// transition out of a terminal state is rejected.
    pub async fn mark_terminal(
        &self,
        job_id: Uuid,
        state: JobState,
        error: Option<serde_json::Value>,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(AppError::Internal(format!(
                "mark_terminal called with non-terminal state {state}"
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2, error = $3, finished_at = NOW()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(state)
        .bind(&error)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Idempotence: already in the requested terminal state is fine.
        let current = self.get(job_id).await?;
        if current.state == state {
            Ok(())
        } else {
            Err(AppError::Conflict(format!(
                "job {job_id} is {} and cannot move to {state}",
                current.state
            )))
        }
    }

    /// Transition `queued -> skipped_duplicate` for a job whose scope is
    /// already covered by an active job.
    pub async fn mark_skipped_duplicate(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'skipped_duplicate', finished_at = NOW()
            WHERE id = $1 AND state = 'queued'
            "#,
        )
        .bind(job_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Append one repository's terminal outcome under a job.
    pub async fn record_repo_result(
        &self,
        job_id: Uuid,
        repo_name: &str,
        state: RepoTaskState,
        task_href: Option<&str>,
        error: Option<serde_json::Value>,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repo_task_results
                (job_id, repo_name, state, task_href, error, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(job_id)
        .bind(repo_name)
        .bind(state)
        .bind(task_href)
        .bind(&error)
        .bind(started_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Jobs in `queued` or `running` for a (server, kind), used for
    /// de-duplication.
    pub async fn list_active(&self, pulp_server: &str, kind: JobKind) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE pulp_server = $1 AND kind = $2 AND state IN ('queued', 'running')
            ORDER BY enqueued_at ASC
            "#
        ))
        .bind(pulp_server)
        .bind(kind)
        .fetch_all(&self.db)
        .await?;

        Ok(jobs)
    }

    /// Oldest queued job, FIFO over enqueue time.
    pub async fn find_next_queued(&self) -> Result<Option<Job>> {
        let job = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE state = 'queued'
            ORDER BY enqueued_at ASC
            LIMIT 1
            "#
        ))
        .fetch_optional(&self.db)
        .await?;

        Ok(job)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job> {
        let job: Option<Job> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.db)
        .await?;

        job.ok_or_else(|| AppError::NotFound(format!("job {job_id} not found")))
    }

    /// All repo outcomes recorded under a job, oldest first.
    pub async fn repo_results(&self, job_id: Uuid) -> Result<Vec<RepoTaskResult>> {
        let results = sqlx::query_as(
            r#"
            SELECT id, job_id, repo_name, state, task_href, error, started_at, finished_at
            FROM repo_task_results
            WHERE job_id = $1
            ORDER BY finished_at ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.db)
        .await?;

        Ok(results)
    }

    /// Flag a queued or running job for cancellation. The worker forwards
    /// the flag into the job's cancellation context.
    pub async fn request_cancel(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET cancel_requested = TRUE
            WHERE id = $1 AND state IN ('queued', 'running')
            "#,
        )
        .bind(job_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get(job_id).await?;
            return Err(AppError::Conflict(format!(
                "job {job_id} is {} and cannot be canceled",
                current.state
            )));
        }

        Ok(())
    }

    pub async fn cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let (flag,): (bool,) =
            sqlx::query_as("SELECT cancel_requested FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_one(&self.db)
                .await?;
        Ok(flag)
    }

    /// Startup crash recovery: any job still marked `running` has no live
    /// owner and is failed with a `worker_crashed` reason. Such jobs are not
    /// auto-resumed.
    pub async fn recover_orphaned(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed', finished_at = NOW(),
                error = '{"code": "WORKER_CRASHED", "msg": "worker_crashed"}'::JSONB
            WHERE state = 'running'
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Recent jobs for the reporting API.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            ORDER BY enqueued_at DESC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(jobs)
    }
}

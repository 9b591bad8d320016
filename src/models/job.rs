//! Job and per-repo task result models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Operation kinds the engine executes. Closed set; the worker rejects
/// anything else at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Snapshot,
    Publish,
    Distribute,
    Reconcile,
    RepoConfigRegistration,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Snapshot => "snapshot",
            Self::Publish => "publish",
            Self::Distribute => "distribute",
            Self::Reconcile => "reconcile",
            Self::RepoConfigRegistration => "repo_config_registration",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle states.
///
/// Transitions are monotonic: `queued -> running -> terminal`. A queued job
/// found to duplicate an active one short-circuits to `skipped_duplicate`
/// without ever running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
    SkippedDuplicate,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Whether moving from `self` to `next` respects the state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            Self::Queued => matches!(
                next,
                Self::Running | Self::Canceled | Self::SkippedDuplicate
            ),
            Self::Running => {
                matches!(
                    next,
                    Self::Succeeded | Self::Failed | Self::Canceled | Self::TimedOut
                )
            }
            // Terminal states never move.
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
            Self::SkippedDuplicate => "skipped_duplicate",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable job record. Mutated only by the worker after creation; never
/// deleted.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub kind: JobKind,
    pub pulp_server: String,
    pub state: JobState,
    pub params: serde_json::Value,
    pub error: Option<serde_json::Value>,
    pub cancel_requested: bool,
    pub worker_name: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Terminal outcome of one repository within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "repo_task_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RepoTaskState {
    Completed,
    Failed,
    TimedOut,
    Canceled,
    SkippedConflict,
    SkippedMissingOnSource,
}

impl RepoTaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
            Self::SkippedConflict => "skipped_conflict",
            Self::SkippedMissingOnSource => "skipped_missing_on_source",
        }
    }
}

/// Append-only per-repo outcome under a job.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RepoTaskResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub repo_name: String,
    pub state: RepoTaskState,
    pub task_href: Option<String>,
    pub error: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Parameter blob carried by sync/snapshot/publish/distribute jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobParams {
    #[serde(default)]
    pub regex_include: Option<String>,
    #[serde(default)]
    pub regex_exclude: Option<String>,
    #[serde(default)]
    pub max_runtime_secs: Option<i64>,
    #[serde(default)]
    pub max_concurrent_syncs: Option<i32>,
    #[serde(default)]
    pub source_pulp_server_name: Option<String>,
    #[serde(default)]
    pub snapshot_prefix: Option<String>,
    #[serde(default)]
    pub allow_snapshot_reuse: Option<bool>,
}

impl JobParams {
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queued_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Canceled));
        assert!(JobState::Queued.can_transition_to(JobState::SkippedDuplicate));
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Queued.can_transition_to(JobState::Failed));
        assert!(!JobState::Queued.can_transition_to(JobState::TimedOut));
    }

    #[test]
    fn test_running_transitions() {
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(JobState::Running.can_transition_to(JobState::Canceled));
        assert!(JobState::Running.can_transition_to(JobState::TimedOut));
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Running.can_transition_to(JobState::SkippedDuplicate));
    }

    #[test]
    fn test_terminal_states_never_move() {
        let terminals = [
            JobState::Succeeded,
            JobState::Failed,
            JobState::Canceled,
            JobState::TimedOut,
            JobState::SkippedDuplicate,
        ];
        let all = [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Canceled,
            JobState::TimedOut,
            JobState::SkippedDuplicate,
        ];
        for from in terminals {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn test_non_terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_job_kind_serde() {
        assert_eq!(
            serde_json::to_string(&JobKind::RepoConfigRegistration).unwrap(),
            "\"repo_config_registration\""
        );
        let kind: JobKind = serde_json::from_str("\"sync\"").unwrap();
        assert_eq!(kind, JobKind::Sync);
    }

    #[test]
    fn test_job_params_from_value_lenient() {
        let params = JobParams::from_value(&serde_json::json!({
            "regex_include": "^ext-",
            "max_concurrent_syncs": 4,
            "unknown_key": true
        }));
        assert_eq!(params.regex_include.as_deref(), Some("^ext-"));
        assert_eq!(params.max_concurrent_syncs, Some(4));
        assert!(params.regex_exclude.is_none());

        // A malformed blob degrades to defaults instead of failing dispatch.
        let params = JobParams::from_value(&serde_json::json!("not an object"));
        assert!(params.regex_include.is_none());
    }
}

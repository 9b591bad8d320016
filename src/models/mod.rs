//! Database entity models.

pub mod job;
pub mod pulp_server;
pub mod repo_group;

pub use job::{Job, JobKind, JobParams, JobState, RepoTaskResult, RepoTaskState};
pub use pulp_server::{PulpServer, PulpServerRepo, RepoKind};
pub use repo_group::{RepoGroup, ServerRepoGroup};

//! Pulp resource types and endpoint layout.
//!
//! Unknown fields are captured in `extra` maps and sent back verbatim so
//! descriptor options the engine does not model still reach Pulp.

use crate::models::RepoKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Task states reported by Pulp's task API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Running,
    Canceling,
    Completed,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// A Pulp task record, polled until terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulpTask {
    pub pulp_href: String,
    pub state: TaskState,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub created_resources: Vec<String>,
}

impl PulpTask {
    /// Created resource href matching a path fragment, e.g. `"/versions/"`
    /// for a new repository version or `"/publications/"` for a publication.
    pub fn created_resource(&self, fragment: &str) -> Option<&str> {
        self.created_resources
            .iter()
            .map(String::as_str)
            .find(|href| href.contains(fragment))
    }
}

/// One page of a Pulp collection listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub count: i64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// A Pulp repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulp_href: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version_href: Option<String>,
    /// Deb-only: signing service href applied at publish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_service: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A Pulp remote describing an upstream feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Remote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulp_href: Option<String>,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub tls_validation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sock_connect_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sock_read_timeout: Option<f64>,
    /// Deb-only: whitespace separated release names to sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributions: Option<String>,
    /// Deb-only: whitespace separated components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<String>,
    /// Deb-only: whitespace separated architectures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architectures: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_missing_package_indices: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A Pulp distribution: a base-path binding a publication or repository is
/// served under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulp_href: Option<String>,
    pub name: String,
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A Pulp publication: an immutable rendered repository version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Publication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulp_href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ── Endpoint layout ─────────────────────────────────────────────────────────

/// Collection path for repositories of a kind.
pub fn repositories_path(kind: RepoKind) -> &'static str {
    match kind {
        RepoKind::Deb => "/pulp/api/v3/repositories/deb/apt/",
        RepoKind::Rpm => "/pulp/api/v3/repositories/rpm/rpm/",
        RepoKind::File => "/pulp/api/v3/repositories/file/file/",
        RepoKind::Python => "/pulp/api/v3/repositories/python/python/",
        RepoKind::Container => "/pulp/api/v3/repositories/container/container/",
    }
}

/// Collection path for remotes of a kind.
pub fn remotes_path(kind: RepoKind) -> &'static str {
    match kind {
        RepoKind::Deb => "/pulp/api/v3/remotes/deb/apt/",
        RepoKind::Rpm => "/pulp/api/v3/remotes/rpm/rpm/",
        RepoKind::File => "/pulp/api/v3/remotes/file/file/",
        RepoKind::Python => "/pulp/api/v3/remotes/python/python/",
        RepoKind::Container => "/pulp/api/v3/remotes/container/container/",
    }
}

/// Collection path for distributions of a kind.
pub fn distributions_path(kind: RepoKind) -> &'static str {
    match kind {
        RepoKind::Deb => "/pulp/api/v3/distributions/deb/apt/",
        RepoKind::Rpm => "/pulp/api/v3/distributions/rpm/rpm/",
        RepoKind::File => "/pulp/api/v3/distributions/file/file/",
        RepoKind::Python => "/pulp/api/v3/distributions/python/pypi/",
        RepoKind::Container => "/pulp/api/v3/distributions/container/container/",
    }
}

/// Collection path for publications of a kind. Container content is served
/// straight from the repository and has no publication step.
pub fn publications_path(kind: RepoKind) -> Option<&'static str> {
    match kind {
        RepoKind::Deb => Some("/pulp/api/v3/publications/deb/apt/"),
        RepoKind::Rpm => Some("/pulp/api/v3/publications/rpm/rpm/"),
        RepoKind::File => Some("/pulp/api/v3/publications/file/file/"),
        RepoKind::Python => Some("/pulp/api/v3/publications/python/pypi/"),
        RepoKind::Container => None,
    }
}

/// Content listing path for packages of a kind, used by the banned-package
/// sweep.
pub fn packages_path(kind: RepoKind) -> Option<&'static str> {
    match kind {
        RepoKind::Deb => Some("/pulp/api/v3/content/deb/packages/"),
        RepoKind::Rpm => Some("/pulp/api/v3/content/rpm/packages/"),
        _ => None,
    }
}

/// Body options for a publication of the given kind.
///
/// Rpm publications pin sha256 checksums; deb publications are structured
/// unless the repository was synced as a flat archive.
pub fn publication_body(
    kind: RepoKind,
    repo_version_href: &str,
    deb_flat_repo: bool,
) -> serde_json::Value {
    let mut body = serde_json::json!({ "repository_version": repo_version_href });
    match kind {
        RepoKind::Rpm => {
            body["metadata_checksum_type"] = "sha256".into();
            body["package_checksum_type"] = "sha256".into();
        }
        RepoKind::Deb if deb_flat_repo => {
            body["structured"] = false.into();
            body["simple"] = true.into();
        }
        RepoKind::Deb => {
            body["structured"] = true.into();
        }
        _ => {}
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_terminal() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Canceling.is_terminal());
    }

    #[test]
    fn test_task_state_unknown_variant() {
        let state: TaskState = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(state, TaskState::Unknown);
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_task_deserialization() {
        let task: PulpTask = serde_json::from_value(serde_json::json!({
            "pulp_href": "/pulp/api/v3/tasks/0190aaaa/",
            "state": "completed",
            "created_resources": [
                "/pulp/api/v3/repositories/rpm/rpm/0190bbbb/versions/3/",
                "/pulp/api/v3/publications/rpm/rpm/0190cccc/"
            ]
        }))
        .unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(
            task.created_resource("/versions/"),
            Some("/pulp/api/v3/repositories/rpm/rpm/0190bbbb/versions/3/")
        );
        assert_eq!(
            task.created_resource("/publications/"),
            Some("/pulp/api/v3/publications/rpm/rpm/0190cccc/")
        );
        assert_eq!(task.created_resource("/distributions/"), None);
    }

    #[test]
    fn test_task_error_payload() {
        let task: PulpTask = serde_json::from_value(serde_json::json!({
            "pulp_href": "/pulp/api/v3/tasks/0190aaaa/",
            "state": "failed",
            "error": {"description": "bad remote"}
        }))
        .unwrap();
        assert_eq!(task.error.unwrap()["description"], "bad remote");
        assert!(task.created_resources.is_empty());
    }

    #[test]
    fn test_remote_roundtrip_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "name": "ext-nginx",
            "url": "https://nginx.org/packages/ubuntu",
            "tls_validation": true,
            "rate_limit": 5,
            "max_retries": 3
        });
        let remote: Remote = serde_json::from_value(raw).unwrap();
        assert_eq!(remote.extra["rate_limit"], 5);

        let back = serde_json::to_value(&remote).unwrap();
        assert_eq!(back["rate_limit"], 5);
        assert_eq!(back["max_retries"], 3);
        // Unset options are omitted entirely rather than sent as null.
        assert!(back.get("proxy_url").is_none());
    }

    #[test]
    fn test_paths_per_kind() {
        assert_eq!(
            repositories_path(RepoKind::Deb),
            "/pulp/api/v3/repositories/deb/apt/"
        );
        assert_eq!(remotes_path(RepoKind::Rpm), "/pulp/api/v3/remotes/rpm/rpm/");
        assert_eq!(
            distributions_path(RepoKind::Python),
            "/pulp/api/v3/distributions/python/pypi/"
        );
        assert_eq!(publications_path(RepoKind::Container), None);
        assert!(publications_path(RepoKind::Deb).is_some());
        assert!(packages_path(RepoKind::File).is_none());
    }

    #[test]
    fn test_publication_body_rpm() {
        let body = publication_body(RepoKind::Rpm, "/v/1/", false);
        assert_eq!(body["metadata_checksum_type"], "sha256");
        assert_eq!(body["package_checksum_type"], "sha256");
    }

    #[test]
    fn test_publication_body_deb_structured() {
        let body = publication_body(RepoKind::Deb, "/v/1/", false);
        assert_eq!(body["structured"], true);
        assert!(body.get("simple").is_none());
    }

    #[test]
    fn test_publication_body_deb_flat() {
        let body = publication_body(RepoKind::Deb, "/v/1/", true);
        assert_eq!(body["structured"], false);
        assert_eq!(body["simple"], true);
    }

    #[test]
    fn test_publication_body_file_plain() {
        let body = publication_body(RepoKind::File, "/v/1/", false);
        assert_eq!(body["repository_version"], "/v/1/");
        assert!(body.get("structured").is_none());
    }
}

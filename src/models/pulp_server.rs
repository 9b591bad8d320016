//! Pulp server and per-server repository models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Content types a repository can hold. Matches Pulp's plugin set that the
/// manager drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "repo_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    Deb,
    Rpm,
    File,
    Python,
    Container,
}

impl RepoKind {
    pub const ALL: [RepoKind; 5] = [
        RepoKind::Deb,
        RepoKind::Rpm,
        RepoKind::File,
        RepoKind::Python,
        RepoKind::Container,
    ];

    /// Parse the content type from a descriptor value. The legacy catalog
    /// uses "iso" for file repositories.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deb" => Some(Self::Deb),
            "rpm" => Some(Self::Rpm),
            "file" | "iso" => Some(Self::File),
            "python" => Some(Self::Python),
            "container" => Some(Self::Container),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deb => "deb",
            Self::Rpm => "rpm",
            Self::File => "file",
            Self::Python => "python",
            Self::Container => "container",
        }
    }

    /// Extract the repo kind from a Pulp href such as
    /// `/pulp/api/v3/repositories/deb/apt/0190.../`.
    pub fn from_href(href: &str) -> Option<Self> {
        let rest = href.strip_prefix("/pulp/api/v3/")?;
        let mut parts = rest.split('/');
        let _collection = parts.next()?;
        Self::parse(parts.next()?)
    }
}

impl std::fmt::Display for RepoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed Pulp server from the fleet config.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PulpServer {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub vault_service_account_mount: String,
    pub snapshot_supported: bool,
    pub max_concurrent_snapshots: Option<i32>,
    pub repo_config_registration_schedule: Option<String>,
    pub repo_config_registration_max_runtime_secs: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A repository known to exist on a Pulp server, discovered by the
/// reconciler or the syncher pre-scan.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PulpServerRepo {
    pub id: Uuid,
    pub pulp_server_id: Uuid,
    pub name: String,
    pub kind: RepoKind,
    pub repo_href: String,
    pub remote_href: Option<String>,
    pub remote_feed: Option<String>,
    pub distribution_href: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_kind_parse() {
        assert_eq!(RepoKind::parse("deb"), Some(RepoKind::Deb));
        assert_eq!(RepoKind::parse("rpm"), Some(RepoKind::Rpm));
        assert_eq!(RepoKind::parse("file"), Some(RepoKind::File));
        assert_eq!(RepoKind::parse("iso"), Some(RepoKind::File));
        assert_eq!(RepoKind::parse("python"), Some(RepoKind::Python));
        assert_eq!(RepoKind::parse("container"), Some(RepoKind::Container));
        assert_eq!(RepoKind::parse("gem"), None);
    }

    #[test]
    fn test_repo_kind_from_href() {
        assert_eq!(
            RepoKind::from_href("/pulp/api/v3/repositories/deb/apt/0190a1b2/"),
            Some(RepoKind::Deb)
        );
        assert_eq!(
            RepoKind::from_href("/pulp/api/v3/remotes/rpm/rpm/0190a1b2/"),
            Some(RepoKind::Rpm)
        );
        assert_eq!(
            RepoKind::from_href("/pulp/api/v3/distributions/file/file/0190a1b2/"),
            Some(RepoKind::File)
        );
        assert_eq!(RepoKind::from_href("/pulp/api/v3/tasks/0190a1b2/"), None);
        assert_eq!(RepoKind::from_href("not-an-href"), None);
    }

    #[test]
    fn test_repo_kind_display_roundtrip() {
        for kind in RepoKind::ALL {
            assert_eq!(RepoKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_repo_kind_serde_lowercase() {
        let json = serde_json::to_string(&RepoKind::Deb).unwrap();
        assert_eq!(json, "\"deb\"");
        let parsed: RepoKind = serde_json::from_str("\"container\"").unwrap();
        assert_eq!(parsed, RepoKind::Container);
    }
}

//! Live server inventory.
//!
//! Fetches every repository, remote, and distribution a Pulp server holds
//! and mirrors the result into `pulp_server_repos`. Pulp is authoritative:
//! local rows are refreshed to match and rows for repositories Pulp no
//! longer reports are removed.

use crate::error::Result;
use crate::models::RepoKind;
use crate::pulp::{resources, Distribution, PulpClient, Remote, Repository};
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Snapshot of one server's repositories with their linked remotes and
/// distributions, keyed by repository name.
#[derive(Debug, Default)]
pub struct ServerInventory {
    pub repos: BTreeMap<String, Repository>,
    pub remotes_by_name: BTreeMap<String, Remote>,
    pub remotes_by_href: BTreeMap<String, Remote>,
    pub distributions: BTreeMap<String, Distribution>,
}

impl ServerInventory {
    /// Fetch the full inventory across all supported content types.
    pub async fn fetch(client: &PulpClient) -> Result<Self> {
        let mut inventory = Self::default();

        for kind in RepoKind::ALL {
            let repos: Vec<Repository> = client
                .list_all(resources::repositories_path(kind), &[])
                .await?;
            for repo in repos {
                inventory.repos.insert(repo.name.clone(), repo);
            }

            let remotes: Vec<Remote> =
                client.list_all(resources::remotes_path(kind), &[]).await?;
            for remote in remotes {
                if let Some(href) = &remote.pulp_href {
                    inventory
                        .remotes_by_href
                        .insert(href.clone(), remote.clone());
                }
                inventory.remotes_by_name.insert(remote.name.clone(), remote);
            }

            let distributions: Vec<Distribution> = client
                .list_all(resources::distributions_path(kind), &[])
                .await?;
            for distribution in distributions {
                inventory
                    .distributions
                    .insert(distribution.name.clone(), distribution);
            }
        }

        Ok(inventory)
    }

    /// Remote linked to a repository: the repo's `remote` href wins, with a
    /// fall back to name matching for repositories created before the link
    /// was recorded.
    pub fn remote_for(&self, repo: &Repository) -> Option<&Remote> {
        if let Some(href) = &repo.remote {
            if let Some(remote) = self.remotes_by_href.get(href) {
                return Some(remote);
            }
        }
        self.remotes_by_name.get(&repo.name)
    }

    /// Mirror this inventory into `pulp_server_repos` for the given server.
    /// Rows for repositories Pulp no longer reports are deleted.
    pub async fn persist(&self, db: &PgPool, server_id: Uuid) -> Result<()> {
        let mut tx = db.begin().await?;

        let names: Vec<String> = self.repos.keys().cloned().collect();
        sqlx::query(
            "DELETE FROM pulp_server_repos WHERE pulp_server_id = $1 AND name != ALL($2)",
        )
        .bind(server_id)
        .bind(&names)
        .execute(&mut *tx)
        .await?;

        for (name, repo) in &self.repos {
            let Some(href) = &repo.pulp_href else { continue };
            let Some(kind) = RepoKind::from_href(href) else {
                tracing::warn!(repo = %name, href = %href, "skipping repo with unrecognized href");
                continue;
            };

            let remote = self.remote_for(repo);
            let distribution_href = self
                .distributions
                .get(name)
                .and_then(|d| d.pulp_href.clone());

            sqlx::query(
                r#"
                INSERT INTO pulp_server_repos
                    (pulp_server_id, name, kind, repo_href, remote_href,
                     remote_feed, distribution_href)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (pulp_server_id, name) DO UPDATE
                SET kind = EXCLUDED.kind,
                    repo_href = EXCLUDED.repo_href,
                    remote_href = EXCLUDED.remote_href,
                    remote_feed = EXCLUDED.remote_feed,
                    distribution_href = EXCLUDED.distribution_href,
                    updated_at = NOW()
                "#,
            )
            .bind(server_id)
            .bind(name)
            .bind(kind)
            .bind(href)
            .bind(remote.and_then(|r| r.pulp_href.clone()))
            .bind(remote.map(|r| r.url.clone()))
            .bind(distribution_href)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str, remote: Option<&str>) -> Repository {
        Repository {
            pulp_href: Some(format!("/pulp/api/v3/repositories/rpm/rpm/{name}/")),
            name: name.to_string(),
            remote: remote.map(str::to_string),
            ..Default::default()
        }
    }

    fn remote(name: &str, href: &str) -> Remote {
        Remote {
            pulp_href: Some(href.to_string()),
            name: name.to_string(),
            url: format!("https://feed.example.com/{name}"),
            ..Default::default()
        }
    }

    #[test]
    fn test_remote_for_prefers_href_link() {
        let mut inventory = ServerInventory::default();
        let linked = remote("other-name", "/pulp/api/v3/remotes/rpm/rpm/1/");
        inventory
            .remotes_by_href
            .insert("/pulp/api/v3/remotes/rpm/rpm/1/".into(), linked);
        inventory.remotes_by_name.insert(
            "repo-a".into(),
            remote("repo-a", "/pulp/api/v3/remotes/rpm/rpm/2/"),
        );

        let r = repo("repo-a", Some("/pulp/api/v3/remotes/rpm/rpm/1/"));
        assert_eq!(
            inventory.remote_for(&r).unwrap().name,
            "other-name",
            "href link must beat name match"
        );
    }

    #[test]
    fn test_remote_for_falls_back_to_name() {
        let mut inventory = ServerInventory::default();
        inventory.remotes_by_name.insert(
            "repo-a".into(),
            remote("repo-a", "/pulp/api/v3/remotes/rpm/rpm/2/"),
        );

        let r = repo("repo-a", None);
        assert_eq!(
            inventory.remote_for(&r).unwrap().pulp_href.as_deref(),
            Some("/pulp/api/v3/remotes/rpm/rpm/2/")
        );
    }

    #[test]
    fn test_remote_for_none() {
        let inventory = ServerInventory::default();
        assert!(inventory.remote_for(&repo("repo-a", None)).is_none());
    }
}

//! Declarative catalog reconciliation.
//!
//! Converges a Pulp primary against a directory of JSON repo descriptors
//! held in git: for each descriptor the remote, repository, signing service
//! reference, and distribution are diffed against live state and the
//! minimum set of Pulp operations is issued. Descriptors are applied
//! independently; one failure never aborts the batch, and a second run over
//! unchanged input issues zero mutations.

use crate::config::AppSettings;
use crate::error::{AppError, Result};
use crate::models::{Job, JobParams, JobState, RepoKind, RepoTaskState};
use crate::pulp::{resources, Distribution, PulpClient, Remote, Repository};
use crate::services::credentials::CredentialsResolver;
use crate::services::fleet_loader::FleetLoader;
use crate::services::inventory::ServerInventory;
use crate::services::job_store::JobStore;
use crate::services::matcher::RepoMatcher;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Marker embedded in repository descriptions linking them back to their
/// descriptor, so renames can be told apart from create+delete.
const CATALOG_ID_TAG: &str = "catalog_id:";

/// Fallback wall-clock budget when the job carries none.
const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(2 * 3600);

/// One JSON repo descriptor from the catalog checkout.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoDescriptor {
    pub name: String,
    pub content_repo_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Presence classifies the repo as external.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub tls_validation: Option<bool>,
    /// Deb release names to sync. The legacy catalog calls these releases.
    #[serde(default, alias = "releases")]
    pub distributions: Option<String>,
    #[serde(default)]
    pub components: Option<String>,
    #[serde(default)]
    pub architectures: Option<String>,
    #[serde(default)]
    pub sync_sources: Option<bool>,
    #[serde(default)]
    pub sync_udebs: Option<bool>,
    #[serde(default)]
    pub sync_installer: Option<bool>,
    /// Unknown fields ride along and are forwarded to Pulp verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RepoDescriptor {
    pub fn is_external(&self) -> bool {
        self.url.is_some()
    }

    pub fn kind(&self) -> Result<RepoKind> {
        RepoKind::parse(&self.content_repo_type).ok_or_else(|| {
            AppError::Validation(format!(
                "descriptor '{}' has unsupported content_repo_type '{}'",
                self.name, self.content_repo_type
            ))
        })
    }
}

/// Naming rules applied to descriptors.
#[derive(Debug, Clone)]
pub struct NamingRules {
    pub internal_prefix: String,
    pub replacement_pattern: Option<Regex>,
    pub replacement_rule: Option<String>,
}

impl NamingRules {
    pub fn from_settings(settings: &AppSettings) -> Result<Self> {
        let replacement_pattern = match &settings.pulp.package_name_replacement_pattern {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern).map_err(|e| {
                AppError::ConfigInvalid(format!(
                    "invalid package_name_replacement_pattern '{pattern}': {e}"
                ))
            })?),
            _ => None,
        };

        Ok(Self {
            internal_prefix: settings.pulp.internal_package_prefix.clone(),
            replacement_pattern,
            replacement_rule: settings.pulp.package_name_replacement_rule.clone(),
        })
    }

    /// Canonical repository name: classification prefix plus the optional
    /// configured rewrite.
    pub fn canonical_name(&self, descriptor: &RepoDescriptor) -> String {
        let prefixed = if descriptor.is_external() {
            apply_prefix(&descriptor.name, "ext-")
        } else {
            apply_prefix(&descriptor.name, &self.internal_prefix)
        };

        match (&self.replacement_pattern, &self.replacement_rule) {
            (Some(pattern), Some(rule)) => rewrite_name(&prefixed, pattern, rule),
            _ => prefixed,
        }
    }
}

/// Prepend `prefix` unless the name already carries it.
pub fn apply_prefix(name: &str, prefix: &str) -> String {
    if prefix.is_empty() || name.starts_with(prefix) {
        name.to_string()
    } else {
        format!("{prefix}{name}")
    }
}

/// Rewrite a name through the replacement rule: when the pattern matches,
/// `{group}` placeholders in the rule are filled from the pattern's named
/// captures. A non-matching name passes through untouched.
pub fn rewrite_name(name: &str, pattern: &Regex, rule: &str) -> String {
    let Some(captures) = pattern.captures(name) else {
        return name.to_string();
    };

    let mut rewritten = rule.to_string();
    for group in pattern.capture_names().flatten() {
        if let Some(value) = captures.name(group) {
            rewritten = rewritten.replace(&format!("{{{group}}}"), value.as_str());
        }
    }
    rewritten
}

/// Description written onto managed repositories. Carries the owner, the
/// serving base url, and the stable catalog identifier.
pub fn build_description(descriptor: &RepoDescriptor) -> String {
    format!(
        "{} - {} - base_url:{} - {}{}",
        descriptor.description.as_deref().unwrap_or(""),
        descriptor.owner.as_deref().unwrap_or("unowned"),
        descriptor.base_url.as_deref().unwrap_or(""),
        CATALOG_ID_TAG,
        descriptor.name,
    )
}

/// Extract the catalog identifier from a repository description.
pub fn catalog_id(description: &str) -> Option<&str> {
    let start = description.rfind(CATALOG_ID_TAG)? + CATALOG_ID_TAG.len();
    let id = description[start..].split_whitespace().next()?;
    (!id.is_empty()).then_some(id)
}

/// Walk a descriptor directory, parsing every `*.json` except `global.json`.
/// Returns descriptors sorted by file name for a stable apply order.
pub fn load_descriptors(dir: &Path) -> Result<Vec<RepoDescriptor>> {
    let mut descriptors = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    let mut files: Vec<PathBuf> = Vec::new();

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|e| e == "json")
                && path.file_name().is_some_and(|n| n != "global.json")
            {
                files.push(path);
            }
        }
    }

    files.sort();
    for path in files {
        let raw = std::fs::read_to_string(&path)?;
        let descriptor: RepoDescriptor = serde_json::from_str(&raw).map_err(|e| {
            AppError::Validation(format!(
                "invalid repo descriptor {}: {e}",
                path.display()
            ))
        })?;
        descriptors.push(descriptor);
    }

    Ok(descriptors)
}

/// Summary of one descriptor's application.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppliedRepo {
    pub mutations: usize,
}

/// Drives reconcile jobs for one Pulp server.
pub struct Reconciler {
    db: sqlx::PgPool,
    job_store: JobStore,
    fleet: FleetLoader,
    resolver: CredentialsResolver,
    settings: AppSettings,
}

impl Reconciler {
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

    /// Execute a reconcile job and return the aggregate state.
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

        // `_checkout` keeps a cloned scratch directory alive for the run.
        let (config_dir, _checkout) = self.descriptor_dir().await?;
        let descriptors = load_descriptors(&config_dir)?;

        let rules = NamingRules::from_settings(&self.settings)?;
        let matcher = RepoMatcher::new(
            params.regex_include.as_deref(),
            params.regex_exclude.as_deref(),
        )?;

        let max_runtime = match params.max_runtime_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => DEFAULT_MAX_RUNTIME,
        };
        let deadline = Instant::now() + max_runtime;

        let signing_service_href = self.deb_signing_service_href(&client).await?;
        let root_ca = self.settings.root_ca()?;
        let mut inventory = ServerInventory::fetch(&client).await?;

        let mut targets: Vec<(String, RepoDescriptor)> = descriptors
            .into_iter()
            .map(|d| (rules.canonical_name(&d), d))
            .filter(|(name, _)| matcher.matches(name))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::info!(
            job_id = %job.id,
            server = %server.name,
            descriptors = targets.len(),
            "starting catalog reconciliation"
        );

        let mut any_failed = false;
        let mut canceled = false;
        let mut timed_out = false;

        for (canonical, descriptor) in targets {
            if cancel.is_cancelled() {
                canceled = true;
                self.record(job, &canonical, RepoTaskState::Canceled, None)
                    .await?;
                continue;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                self.record(
                    job,
                    &canonical,
                    RepoTaskState::TimedOut,
                    Some(json!({"msg": "deadline expired before descriptor was applied"})),
                )
                .await?;
                continue;
            }

            let applied = apply_descriptor(
                &client,
                &mut inventory,
                &self.settings,
                &descriptor,
                &canonical,
                signing_service_href.as_deref(),
                root_ca.as_deref(),
                &cancel,
            )
            .await;

            match applied {
                Ok(applied) => {
                    tracing::debug!(
                        repo = %canonical,
                        mutations = applied.mutations,
                        "descriptor applied"
                    );
                    self.record(job, &canonical, RepoTaskState::Completed, None)
                        .await?;
                }
                Err(e) => {
                    tracing::error!(repo = %canonical, error = %e, "descriptor failed");
                    any_failed = true;
                    self.record(
                        job,
                        &canonical,
                        RepoTaskState::Failed,
                        Some(e.to_job_error()),
                    )
                    .await?;
                }
            }
        }

        report_orphans(&server.name, &inventory);

        // Refresh the local mirror from live state; Pulp is authoritative.
        let inventory = ServerInventory::fetch(&client).await?;
        inventory.persist(&self.db, server.id).await?;

        let state = if canceled {
            JobState::Canceled
        } else if timed_out {
            JobState::TimedOut
        } else if any_failed {
            JobState::Failed
        } else {
            JobState::Succeeded
        };

        tracing::info!(job_id = %job.id, state = %state, "catalog reconciliation finished");
        Ok(state)
    }

    /// Locate the descriptor directory: a configured local directory, or a
    /// fresh clone of the catalog git repository.
    async fn descriptor_dir(&self) -> Result<(PathBuf, Option<tempfile::TempDir>)> {
        if let Some(local) = &self.settings.pulp.local_repo_config_dir {
            return Ok((PathBuf::from(local), None));
        }

        let git_url = self.settings.pulp.git_repo_config.clone().ok_or_else(|| {
            AppError::ConfigInvalid(
                "neither pulp.git_repo_config nor pulp.local_repo_config_dir is set".into(),
            )
        })?;

        let checkout = tempfile::Builder::new().prefix("pulp-manager").tempdir()?;
        let clone_path = checkout.path().to_path_buf();
        tracing::info!(url = %git_url, path = %clone_path.display(), "cloning repo config");

        tokio::task::spawn_blocking(move || git2::Repository::clone(&git_url, &clone_path))
            .await
            .map_err(|e| AppError::Internal(format!("clone task failed: {e}")))??;

        let dir = checkout.path().join(&self.settings.pulp.git_repo_config_dir);
        Ok((dir, Some(checkout)))
    }

    /// Resolve the configured deb signing service to an href, if any.
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

    async fn record(
        &self,
        job: &Job,
        repo: &str,
        state: RepoTaskState,
        error: Option<serde_json::Value>,
    ) -> Result<()> {
        self.job_store
            .record_repo_result(job.id, repo, state, None, error, None)
            .await
    }
}

/// Repositories on the server that no descriptor produced and that carry no
/// catalog identifier. They are left untouched.
fn report_orphans(server: &str, inventory: &ServerInventory) {
    for (name, repo) in &inventory.repos {
        let tagged = repo
            .description
            .as_deref()
            .and_then(catalog_id)
            .is_some();
        if !tagged {
            tracing::warn!(server = %server, repo = %name, "orphan repository not managed by catalog");
        }
    }
}

/// Desired remote state for an external descriptor.
fn desired_remote(
    settings: &AppSettings,
    descriptor: &RepoDescriptor,
    canonical: &str,
    kind: RepoKind,
    root_ca: Option<&str>,
) -> Remote {
    let url = descriptor.url.clone().unwrap_or_default();
    let internal = settings.pulp.is_internal_url(&url);

    let mut tls_validation = descriptor
        .tls_validation
        .unwrap_or(settings.pulp.remote_tls_validation);
    let mut ca_cert = None;
    // Proxies sit between us and the internet; internal feeds bypass them
    // and get the corporate root CA instead.
    let proxy_url = if internal {
        ca_cert = root_ca.map(str::to_string);
        tls_validation = true;
        None
    } else {
        descriptor.proxy.clone()
    };

    let mut remote = Remote {
        name: canonical.to_string(),
        url,
        proxy_url,
        tls_validation,
        ca_cert,
        policy: Some("immediate".to_string()),
        sock_connect_timeout: Some(settings.remotes.sock_connect_timeout),
        sock_read_timeout: Some(settings.remotes.sock_read_timeout),
        ..Default::default()
    };

    if kind == RepoKind::Deb {
        remote.distributions = Some(
            descriptor
                .distributions
                .clone()
                .unwrap_or_else(|| "stable".to_string()),
        );
        remote.architectures = descriptor.architectures.clone();
        if let Some(components) = &descriptor.components {
            remote.components = Some(components.clone());
            // Partial mirrors that list components rarely publish every
            // index they declare.
            remote.ignore_missing_package_indices = Some(true);
        }
        if let Some(sync_sources) = descriptor.sync_sources {
            remote.extra.insert("sync_sources".into(), json!(sync_sources));
        }
        if let Some(sync_udebs) = descriptor.sync_udebs {
            remote.extra.insert("sync_udebs".into(), json!(sync_udebs));
        }
        if let Some(sync_installer) = descriptor.sync_installer {
            remote
                .extra
                .insert("sync_installer".into(), json!(sync_installer));
        }
    }

    remote
}

/// Field-by-field comparison of the live remote against the desired one.
/// Only fields the catalog manages participate.
pub fn remote_needs_update(current: &Remote, desired: &Remote) -> bool {
    fn trimmed(value: &Option<String>) -> Option<&str> {
        value.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    current.url.trim() != desired.url.trim()
        || trimmed(&current.proxy_url) != trimmed(&desired.proxy_url)
        || current.tls_validation != desired.tls_validation
        || trimmed(&current.distributions) != trimmed(&desired.distributions)
        || trimmed(&current.components) != trimmed(&desired.components)
        || trimmed(&current.architectures) != trimmed(&desired.architectures)
        || current.ignore_missing_package_indices.unwrap_or(false)
            != desired.ignore_missing_package_indices.unwrap_or(false)
}

/// Converge one descriptor: remote, repository, signing, distribution.
#[allow(clippy::too_many_arguments)]
async fn apply_descriptor(
    client: &PulpClient,
    inventory: &mut ServerInventory,
    settings: &AppSettings,
    descriptor: &RepoDescriptor,
    canonical: &str,
    signing_service_href: Option<&str>,
    root_ca: Option<&str>,
    cancel: &CancellationToken,
) -> Result<AppliedRepo> {
    let kind = descriptor.kind()?;
    let mut applied = AppliedRepo::default();
    let description = build_description(descriptor);

    // ── Remote ──────────────────────────────────────────────────────────
    let remote_href = if descriptor.is_external() {
        let desired = desired_remote(settings, descriptor, canonical, kind, root_ca);

        match inventory.remotes_by_name.get(canonical).cloned() {
            None => {
                let body = serde_json::to_value(&desired)?;
                let created: Remote =
                    client.create(resources::remotes_path(kind), &body).await?;
                applied.mutations += 1;
                let href = created.pulp_href.clone();
                if let Some(h) = &href {
                    inventory.remotes_by_href.insert(h.clone(), created.clone());
                }
                inventory
                    .remotes_by_name
                    .insert(canonical.to_string(), created);
                href
            }
            Some(current) => {
                let href = current.pulp_href.clone();
                if remote_needs_update(&current, &desired) {
                    let href = href.clone().ok_or_else(|| {
                        AppError::Internal(format!("remote {canonical} has no href"))
                    })?;
                    let body = serde_json::to_value(&desired)?;
                    let task = client.patch_task(&href, &body).await?;
                    client.wait_task(&task, None, cancel).await?;
                    applied.mutations += 1;
                    inventory
                        .remotes_by_name
                        .insert(canonical.to_string(), desired.clone());
                }
                href
            }
        }
    } else {
        None
    };

    // ── Repository (including rename detection) ─────────────────────────
    let existing = find_repo(inventory, canonical, &descriptor.name);

    let repo_href = match existing {
        None => {
            let mut body = json!({
                "name": canonical,
                "description": description,
            });
            if let Some(remote_href) = &remote_href {
                body["remote"] = json!(remote_href);
            }
            if kind == RepoKind::Deb {
                if let Some(signing) = signing_service_href {
                    body["signing_service"] = json!(signing);
                }
            }

            let created: Repository = client
                .create(resources::repositories_path(kind), &body)
                .await?;
            applied.mutations += 1;
            let href = created
                .pulp_href
                .clone()
                .ok_or_else(|| AppError::Internal("created repo has no href".into()))?;
            inventory.repos.insert(canonical.to_string(), created);
            href
        }
        Some((existing_name, repo)) => {
            let href = repo.pulp_href.clone().ok_or_else(|| {
                AppError::Internal(format!("repository {existing_name} has no href"))
            })?;

            let mut patch = serde_json::Map::new();
            if existing_name != canonical {
                tracing::info!(from = %existing_name, to = %canonical, "renaming repository");
                patch.insert("name".into(), json!(canonical));
            }
            if repo.description.as_deref().map(str::trim) != Some(description.trim()) {
                patch.insert("description".into(), json!(description));
            }
            // Internal repositories must carry no remote.
            if repo.remote.as_deref() != remote_href.as_deref() {
                patch.insert("remote".into(), json!(remote_href));
            }
            if kind == RepoKind::Deb {
                if let Some(signing) = signing_service_href {
                    if repo.signing_service.as_deref() != Some(signing) {
                        patch.insert("signing_service".into(), json!(signing));
                    }
                }
            }

            if !patch.is_empty() {
                let task = client
                    .patch_task(&href, &serde_json::Value::Object(patch))
                    .await?;
                client.wait_task(&task, None, cancel).await?;
                applied.mutations += 1;

                let old_name = existing_name.clone();
                if let Some(mut repo) = inventory.repos.remove(&old_name) {
                    repo.name = canonical.to_string();
                    repo.description = Some(description.clone());
                    repo.remote = remote_href.clone();
                    inventory.repos.insert(canonical.to_string(), repo);
                }
            }
            href
        }
    };

    // ── Distribution ────────────────────────────────────────────────────
    match inventory.distributions.get(canonical).cloned() {
        None => {
            let body = json!({
                "name": canonical,
                "base_path": canonical,
                "repository": repo_href,
            });
            let task = client
                .post_task(resources::distributions_path(kind), &body)
                .await?;
            client.wait_task(&task, None, cancel).await?;
            applied.mutations += 1;
            inventory.distributions.insert(
                canonical.to_string(),
                Distribution {
                    name: canonical.to_string(),
                    base_path: canonical.to_string(),
                    repository: Some(repo_href.clone()),
                    ..Default::default()
                },
            );
        }
        Some(current) => {
            let mut patch = serde_json::Map::new();
            if current.base_path != canonical {
                patch.insert("base_path".into(), json!(canonical));
            }
            if current.repository.as_deref() != Some(repo_href.as_str()) {
                patch.insert("repository".into(), json!(repo_href));
            }

            if !patch.is_empty() {
                let href = current.pulp_href.clone().ok_or_else(|| {
                    AppError::Internal(format!("distribution {canonical} has no href"))
                })?;
                let task = client
                    .patch_task(&href, &serde_json::Value::Object(patch))
                    .await?;
                client.wait_task(&task, None, cancel).await?;
                applied.mutations += 1;
                if let Some(dist) = inventory.distributions.get_mut(canonical) {
                    dist.base_path = canonical.to_string();
                    dist.repository = Some(repo_href.clone());
                }
            }
        }
    }

    Ok(applied)
}

/// Find the live repository backing a descriptor: an exact canonical-name
/// match first, then any repository whose description carries this
/// descriptor's catalog identifier (a pending rename).
fn find_repo(
    inventory: &ServerInventory,
    canonical: &str,
    descriptor_name: &str,
) -> Option<(String, Repository)> {
    let name = if inventory.repos.contains_key(canonical) {
        canonical.to_string()
    } else {
        inventory
            .repos
            .iter()
            .find(|(_, repo)| {
                repo.description
                    .as_deref()
                    .and_then(catalog_id)
                    .is_some_and(|id| id == descriptor_name)
            })
            .map(|(name, _)| name.clone())?
    };

    let repo = inventory.repos.get(&name)?.clone();
    Some((name, repo))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(raw: serde_json::Value) -> RepoDescriptor {
        serde_json::from_value(raw).unwrap()
    }

    fn default_settings() -> AppSettings {
        AppSettings::parse("").unwrap()
    }

    // ── classification & naming ─────────────────────────────────────────

    #[test]
    fn test_external_classification() {
        let ext = descriptor(json!({
            "name": "nginx",
            "content_repo_type": "rpm",
            "url": "https://nginx.org/packages/centos"
        }));
        assert!(ext.is_external());

        let int = descriptor(json!({"name": "myapp", "content_repo_type": "rpm"}));
        assert!(!int.is_external());
    }

    #[test]
    fn test_canonical_name_prefixes() {
        let rules = NamingRules {
            internal_prefix: "corp-".into(),
            replacement_pattern: None,
            replacement_rule: None,
        };

        let ext = descriptor(json!({
            "name": "nginx", "content_repo_type": "rpm", "url": "https://x"
        }));
        assert_eq!(rules.canonical_name(&ext), "ext-nginx");

        let int = descriptor(json!({"name": "myapp", "content_repo_type": "rpm"}));
        assert_eq!(rules.canonical_name(&int), "corp-myapp");
    }

    #[test]
    fn test_prefix_not_doubled() {
        assert_eq!(apply_prefix("ext-nginx", "ext-"), "ext-nginx");
        assert_eq!(apply_prefix("nginx", "ext-"), "ext-nginx");
        assert_eq!(apply_prefix("nginx", ""), "nginx");
    }

    #[test]
    fn test_rewrite_name_with_named_groups() {
        let pattern = Regex::new(r"^ext-(?P<os>[a-z]+)(?P<version>\d+)$").unwrap();
        assert_eq!(
            rewrite_name("ext-centos7", &pattern, "ext-{os}-el{version}"),
            "ext-centos-el7"
        );
    }

    #[test]
    fn test_rewrite_name_no_match_passthrough() {
        let pattern = Regex::new(r"^ext-(?P<os>[a-z]+)(?P<version>\d+)$").unwrap();
        assert_eq!(
            rewrite_name("corp-tools", &pattern, "ext-{os}-el{version}"),
            "corp-tools"
        );
    }

    // ── description / catalog id ────────────────────────────────────────

    #[test]
    fn test_description_carries_catalog_id() {
        let d = descriptor(json!({
            "name": "nginx",
            "content_repo_type": "rpm",
            "description": "Nginx packages",
            "owner": "web-team",
            "base_url": "el7-x86_64",
            "url": "https://nginx.org/packages/centos"
        }));
        let description = build_description(&d);
        assert!(description.contains("Nginx packages"));
        assert!(description.contains("web-team"));
        assert!(description.contains("base_url:el7-x86_64"));
        assert_eq!(catalog_id(&description), Some("nginx"));
    }

    #[test]
    fn test_catalog_id_absent() {
        assert_eq!(catalog_id("a hand-made repository"), None);
        assert_eq!(catalog_id(""), None);
    }

    // ── descriptor parsing ──────────────────────────────────────────────

    #[test]
    fn test_descriptor_releases_alias() {
        let d = descriptor(json!({
            "name": "ubuntu",
            "content_repo_type": "deb",
            "url": "https://archive.ubuntu.com/ubuntu",
            "releases": "focal jammy"
        }));
        assert_eq!(d.distributions.as_deref(), Some("focal jammy"));
    }

    #[test]
    fn test_descriptor_unknown_fields_preserved() {
        let d = descriptor(json!({
            "name": "x", "content_repo_type": "rpm",
            "rate_limit": 4, "vault_load_secrets": []
        }));
        assert_eq!(d.extra["rate_limit"], 4);
        assert!(d.extra.contains_key("vault_load_secrets"));
    }

    #[test]
    fn test_descriptor_kind_iso_maps_to_file() {
        let d = descriptor(json!({"name": "x", "content_repo_type": "iso"}));
        assert_eq!(d.kind().unwrap(), RepoKind::File);

        let bad = descriptor(json!({"name": "x", "content_repo_type": "gem"}));
        assert!(bad.kind().is_err());
    }

    // ── desired remote ──────────────────────────────────────────────────

    #[test]
    fn test_desired_remote_deb_defaults() {
        let settings = default_settings();
        let d = descriptor(json!({
            "name": "ubuntu",
            "content_repo_type": "deb",
            "url": "https://archive.ubuntu.com/ubuntu",
            "components": "main universe"
        }));
        let remote = desired_remote(&settings, &d, "ext-ubuntu", RepoKind::Deb, None);
        assert_eq!(remote.distributions.as_deref(), Some("stable"));
        assert_eq!(remote.components.as_deref(), Some("main universe"));
        assert_eq!(remote.ignore_missing_package_indices, Some(true));
        assert_eq!(remote.policy.as_deref(), Some("immediate"));
    }

    #[test]
    fn test_desired_remote_internal_url_gets_root_ca() {
        let settings = AppSettings::parse(
            "[pulp]\ninternal_domains = \"corp.example.com\"\n",
        )
        .unwrap();
        let d = descriptor(json!({
            "name": "tools",
            "content_repo_type": "rpm",
            "url": "https://mirror.corp.example.com/tools",
            "proxy": "http://proxy.corp:3128"
        }));
        let remote = desired_remote(&settings, &d, "ext-tools", RepoKind::Rpm, Some("PEM"));
        assert!(remote.tls_validation);
        assert_eq!(remote.ca_cert.as_deref(), Some("PEM"));
        assert_eq!(remote.proxy_url, None, "internal feeds bypass the proxy");
    }

    #[test]
    fn test_desired_remote_external_keeps_proxy() {
        let settings = default_settings();
        let d = descriptor(json!({
            "name": "nginx",
            "content_repo_type": "rpm",
            "url": "https://nginx.org/packages/centos",
            "proxy": "http://proxy.corp:3128"
        }));
        let remote = desired_remote(&settings, &d, "ext-nginx", RepoKind::Rpm, Some("PEM"));
        assert_eq!(remote.proxy_url.as_deref(), Some("http://proxy.corp:3128"));
        assert!(remote.ca_cert.is_none());
    }

    // ── remote diffing ──────────────────────────────────────────────────

    #[test]
    fn test_remote_needs_update_identical() {
        let settings = default_settings();
        let d = descriptor(json!({
            "name": "nginx", "content_repo_type": "rpm", "url": "https://x/"
        }));
        let desired = desired_remote(&settings, &d, "ext-nginx", RepoKind::Rpm, None);
        assert!(!remote_needs_update(&desired.clone(), &desired));
    }

    #[test]
    fn test_remote_needs_update_url_change() {
        let settings = default_settings();
        let d = descriptor(json!({
            "name": "nginx", "content_repo_type": "rpm", "url": "https://x/"
        }));
        let desired = desired_remote(&settings, &d, "ext-nginx", RepoKind::Rpm, None);
        let mut current = desired.clone();
        current.url = "https://y/".into();
        assert!(remote_needs_update(&current, &desired));
    }

    #[test]
    fn test_remote_update_ignores_whitespace_noise() {
        // Pulp pads some string fields with trailing newlines.
        let settings = default_settings();
        let d = descriptor(json!({
            "name": "ubuntu", "content_repo_type": "deb",
            "url": "https://x/", "releases": "focal"
        }));
        let desired = desired_remote(&settings, &d, "ext-ubuntu", RepoKind::Deb, None);
        let mut current = desired.clone();
        current.distributions = Some("focal\n".into());
        current.url = "https://x/ ".into();
        assert!(!remote_needs_update(&current, &desired));
    }

    // ── descriptor loading ──────────────────────────────────────────────

    #[test]
    fn test_load_descriptors_from_tree() {
        let dir = tempfile::tempdir().unwrap();
        let remote_dir = dir.path().join("remote");
        let internal_dir = dir.path().join("internal");
        std::fs::create_dir_all(&remote_dir).unwrap();
        std::fs::create_dir_all(&internal_dir).unwrap();

        std::fs::write(
            remote_dir.join("nginx.json"),
            r#"{"name": "nginx", "content_repo_type": "rpm", "url": "https://x/"}"#,
        )
        .unwrap();
        std::fs::write(
            internal_dir.join("myapp.json"),
            r#"{"name": "myapp", "content_repo_type": "deb"}"#,
        )
        .unwrap();
        std::fs::write(remote_dir.join("global.json"), r#"{"pulp": {}}"#).unwrap();
        std::fs::write(remote_dir.join("README.md"), "not a descriptor").unwrap();

        let descriptors = load_descriptors(dir.path()).unwrap();
        assert_eq!(descriptors.len(), 2);
        let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"nginx"));
        assert!(names.contains(&"myapp"));
    }

    #[test]
    fn test_load_descriptors_invalid_json_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        assert!(load_descriptors(dir.path()).is_err());
    }

    // ── rename lookup ───────────────────────────────────────────────────

    #[test]
    fn test_find_repo_by_canonical_name() {
        let mut inventory = ServerInventory::default();
        inventory.repos.insert(
            "ext-nginx".into(),
            Repository {
                pulp_href: Some("/r/1/".into()),
                name: "ext-nginx".into(),
                ..Default::default()
            },
        );
        let (name, _) = find_repo(&inventory, "ext-nginx", "nginx").unwrap();
        assert_eq!(name, "ext-nginx");
    }

    #[test]
    fn test_find_repo_by_catalog_id_for_rename() {
        let mut inventory = ServerInventory::default();
        inventory.repos.insert(
            "ext-old-name".into(),
            Repository {
                pulp_href: Some("/r/1/".into()),
                name: "ext-old-name".into(),
                description: Some("x - team - base_url:el7 - catalog_id:nginx".into()),
                ..Default::default()
            },
        );
        let (name, _) = find_repo(&inventory, "ext-nginx", "nginx").unwrap();
        assert_eq!(name, "ext-old-name", "rename target found via catalog id");
    }

    #[test]
    fn test_find_repo_unrecognized_is_none() {
        let mut inventory = ServerInventory::default();
        inventory.repos.insert(
            "hand-made".into(),
            Repository {
                pulp_href: Some("/r/1/".into()),
                name: "hand-made".into(),
                description: Some("clickops special".into()),
                ..Default::default()
            },
        );
        assert!(find_repo(&inventory, "ext-nginx", "nginx").is_none());
    }
}

//! Credentials resolution against the Vault secret store.
//!
//! Each Pulp server names a service account: a username plus the Vault KV
//! mount the password lives under. Lookups go through a TTL cache so a
//! fleet-wide sync does not hammer Vault; a resolution failure fails the
//! calling job fast and is never retried within it.

use crate::config::{RemotesSection, VaultSection};
use crate::error::{AppError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// How long a resolved secret stays usable without a re-read.
const CACHE_TTL: Duration = Duration::from_secs(600);

/// A resolved username/password pair.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
struct CacheEntry {
    credentials: Credentials,
    fetched_at: Instant,
}

/// Resolves named credential references to concrete secrets.
#[derive(Clone)]
pub struct CredentialsResolver {
    http: reqwest::Client,
    vault_addr: Option<String>,
    namespace: Option<String>,
    token: Option<String>,
    cache: Arc<RwLock<HashMap<(String, String), CacheEntry>>>,
}

impl CredentialsResolver {
    pub fn new(
        vault: &VaultSection,
        remotes: &RemotesSection,
        token: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(remotes.sock_connect_timeout))
            .timeout(Duration::from_secs_f64(remotes.sock_read_timeout))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            vault_addr: vault.vault_addr.clone(),
            namespace: vault.repo_secret_namespace.clone(),
            token,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Resolve `(username, mount)` into credentials, consulting the cache
    /// first. Safe to call concurrently.
    pub async fn resolve(&self, username: &str, mount: &str) -> Result<Credentials> {
        let key = (mount.to_string(), username.to_string());

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(entry.credentials.clone());
                }
            }
        }

        let credentials = self.read_from_vault(username, mount).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            key,
            CacheEntry {
                credentials: credentials.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(credentials)
    }

    /// KV v2 read: `GET {addr}/v1/{mount}/data/{username}`, password under
    /// `data.data.password`.
    async fn read_from_vault(&self, username: &str, mount: &str) -> Result<Credentials> {
        let addr = self.vault_addr.as_deref().ok_or_else(|| {
            AppError::CredentialsUnavailable("vault.vault_addr is not configured".into())
        })?;
        let token = self.token.as_deref().ok_or_else(|| {
            AppError::CredentialsUnavailable("VAULT_TOKEN is not set".into())
        })?;

        let url = format!("{}/v1/{}/data/{}", addr.trim_end_matches('/'), mount, username);
        let mut request = self.http.get(&url).header("X-Vault-Token", token);
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request.send().await.map_err(|e| {
            AppError::CredentialsUnavailable(format!("vault request to {url} failed: {e}"))
        })?;

        if !response.status().is_success() {
            return Err(AppError::CredentialsUnavailable(format!(
                "vault returned {} for {url}",
                response.status()
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            AppError::CredentialsUnavailable(format!("vault returned invalid JSON: {e}"))
        })?;

        let password = extract_password(&body).ok_or_else(|| {
            AppError::CredentialsUnavailable(format!(
                "secret at {mount}/{username} has no password field"
            ))
        })?;

        Ok(Credentials {
            username: username.to_string(),
            password,
        })
    }
}

/// Pull the password out of a KV v2 read response.
fn extract_password(body: &serde_json::Value) -> Option<String> {
    body.get("data")?
        .get("data")?
        .get("password")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_password_kv2_shape() {
        let body = json!({
            "data": {
                "data": {"password": "hunter2"},
                "metadata": {"version": 4}
            }
        });
        assert_eq!(extract_password(&body).as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_extract_password_missing() {
        assert!(extract_password(&json!({})).is_none());
        assert!(extract_password(&json!({"data": {"data": {}}})).is_none());
        assert!(extract_password(&json!({"data": {"data": {"password": 42}}})).is_none());
    }

    #[tokio::test]
    async fn test_resolve_without_vault_addr_fails_fast() {
        let resolver = CredentialsResolver::new(
            &VaultSection::default(),
            &RemotesSection::default(),
            Some("tok".into()),
        )
        .unwrap();
        let err = resolver.resolve("svc_pulp", "service-accounts").await.unwrap_err();
        assert!(matches!(err, AppError::CredentialsUnavailable(_)));
    }

    #[tokio::test]
    async fn test_resolve_without_token_fails_fast() {
        let vault = VaultSection {
            vault_addr: Some("https://vault.example.com".into()),
            repo_secret_namespace: None,
        };
        let resolver =
            CredentialsResolver::new(&vault, &RemotesSection::default(), None).unwrap();
        let err = resolver.resolve("svc_pulp", "service-accounts").await.unwrap_err();
        assert!(err.to_string().contains("VAULT_TOKEN"));
    }
}

//! Application configuration.
//!
//! Two layers: process-level settings (database URL, bind address, config
//! file paths) come from environment variables; operational settings come
//! from a TOML file whose tables mirror the legacy INI sections key for key
//! (`ca`, `auth`, `pulp`, `remotes`, `paging`, `vault`).

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Read an environment variable and parse it, falling back to a default on
/// missing or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Process-level configuration from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// Path to the application config TOML file
    pub app_config_path: String,

    /// Path to the fleet config YAML file
    pub fleet_config_path: String,

    /// Vault token used by the credentials resolver
    pub vault_token: Option<String>,

    /// Worker poll interval in seconds
    pub worker_poll_secs: u64,

    /// Settings loaded from the application config file
    pub app: AppSettings,
}

impl Config {
    /// Load configuration from environment variables and the application
    /// config file.
    pub fn load() -> Result<Self> {
        let app_config_path = env::var("PULP_MANAGER_CONFIG")
            .unwrap_or_else(|_| "/etc/pulp-manager/config.toml".into());
        let fleet_config_path = env::var("PULP_MANAGER_FLEET_CONFIG")
            .unwrap_or_else(|_| "/etc/pulp-manager/fleet.yml".into());

        let app = AppSettings::load(&app_config_path)?;

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::ConfigInvalid("DATABASE_URL not set".into()))?,
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            app_config_path,
            fleet_config_path,
            vault_token: env::var("VAULT_TOKEN").ok(),
            worker_poll_secs: env_parse("WORKER_POLL_SECS", 5),
            app,
        })
    }
}

/// Settings parsed from the application config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub ca: CaSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub pulp: PulpSection,
    #[serde(default)]
    pub remotes: RemotesSection,
    #[serde(default)]
    pub paging: PagingSection,
    #[serde(default)]
    pub vault: VaultSection,
}

impl AppSettings {
    /// Parse the application config file. Missing file is fatal; every
    /// table and key is optional with a sensible default.
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigInvalid(format!("could not read app config '{path}': {e}"))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| AppError::ConfigInvalid(format!("invalid app config: {e}")))
    }

    /// Read the root CA bundle when one is configured.
    pub fn root_ca(&self) -> Result<Option<String>> {
        match &self.ca.root_ca_file_path {
            Some(path) if Path::new(path).exists() => Ok(Some(std::fs::read_to_string(path)?)),
            Some(path) => Err(AppError::ConfigInvalid(format!(
                "root_ca_file_path '{path}' does not exist"
            ))),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaSection {
    pub root_ca_file_path: Option<String>,
}

/// Carried for the external LDAP+JWT layer; the engine itself never reads
/// these beyond passing them through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    pub method: Option<String>,
    pub use_ssl: Option<bool>,
    pub ldap_servers: Option<String>,
    pub base_dn: Option<String>,
    pub default_domain: Option<String>,
    pub jwt_algorithm: Option<String>,
    pub jwt_token_lifetime_mins: Option<u64>,
    pub admin_group: Option<String>,
    pub require_jwt_auth: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulpSection {
    /// Name of the signing service attached to deb repositories
    pub deb_signing_service: Option<String>,
    /// Packages matching this regex are stripped from externally synced repos
    pub banned_package_regex: Option<String>,
    /// Comma-separated list of domains treated as internal
    pub internal_domains: String,
    /// Git URL holding the declarative repo catalog
    pub git_repo_config: Option<String>,
    /// Subdirectory of the checkout containing descriptor files
    pub git_repo_config_dir: String,
    /// Local descriptor directory used instead of cloning when set
    pub local_repo_config_dir: Option<String>,
    /// Prefix applied to internal repository names
    pub internal_package_prefix: String,
    /// Regex with named groups matched against repo names before building
    /// distribution base paths
    pub package_name_replacement_pattern: Option<String>,
    /// Replacement template referencing the pattern's named groups
    pub package_name_replacement_rule: Option<String>,
    /// TLS validation default for new remotes
    pub remote_tls_validation: bool,
    /// Generate https feeds when pointing secondaries at a primary
    pub use_https_for_sync: bool,
}

impl Default for PulpSection {
    fn default() -> Self {
        Self {
            deb_signing_service: None,
            banned_package_regex: None,
            internal_domains: String::new(),
            git_repo_config: None,
            git_repo_config_dir: "repo_config".into(),
            local_repo_config_dir: None,
            internal_package_prefix: "int-".into(),
            package_name_replacement_pattern: None,
            package_name_replacement_rule: None,
            remote_tls_validation: false,
            use_https_for_sync: true,
        }
    }
}

impl PulpSection {
    /// Internal domain list with empty entries dropped.
    pub fn internal_domain_list(&self) -> Vec<&str> {
        self.internal_domains
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .collect()
    }

    /// True when the URL points at one of the configured internal domains.
    pub fn is_internal_url(&self, url: &str) -> bool {
        self.internal_domain_list().iter().any(|d| url.contains(d))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotesSection {
    /// Connect timeout (seconds) for Pulp HTTP sessions
    pub sock_connect_timeout: f64,
    /// Read timeout (seconds) for Pulp HTTP sessions
    pub sock_read_timeout: f64,
}

impl Default for RemotesSection {
    fn default() -> Self {
        Self {
            sock_connect_timeout: 10.0,
            sock_read_timeout: 120.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingSection {
    pub default_page_size: i64,
    pub max_page_size: i64,
}

impl Default for PagingSection {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSection {
    pub vault_addr: Option<String>,
    pub repo_secret_namespace: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[ca]
root_ca_file_path = "/etc/ssl/certs/corp-root.pem"

[pulp]
deb_signing_service = "corp-apt"
banned_package_regex = "pp-skipfish|pp-nmap|sslstrip"
internal_domains = "corp.example.com,build.example.com"
git_repo_config = "https://git.example.com/infra/repo-config.git"
git_repo_config_dir = "repo_config"
internal_package_prefix = "corp-"
remote_tls_validation = true
use_https_for_sync = true

[remotes]
sock_connect_timeout = 5.0
sock_read_timeout = 60.0

[vault]
vault_addr = "https://vault.example.com"
repo_secret_namespace = "infra/pulp"
"#;

    #[test]
    fn test_parse_sample() {
        let settings = AppSettings::parse(SAMPLE).unwrap();
        assert_eq!(settings.pulp.deb_signing_service.as_deref(), Some("corp-apt"));
        assert_eq!(settings.pulp.internal_package_prefix, "corp-");
        assert!(settings.pulp.remote_tls_validation);
        assert_eq!(settings.remotes.sock_connect_timeout, 5.0);
        assert_eq!(settings.remotes.sock_read_timeout, 60.0);
        assert_eq!(
            settings.vault.vault_addr.as_deref(),
            Some("https://vault.example.com")
        );
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let settings = AppSettings::parse("").unwrap();
        assert_eq!(settings.pulp.internal_package_prefix, "int-");
        assert_eq!(settings.pulp.git_repo_config_dir, "repo_config");
        assert_eq!(settings.remotes.sock_connect_timeout, 10.0);
        assert_eq!(settings.paging.default_page_size, 20);
        assert!(settings.vault.vault_addr.is_none());
    }

    #[test]
    fn test_parse_garbage_rejected() {
        let result = AppSettings::parse("pulp = [broken");
        assert!(matches!(result, Err(AppError::ConfigInvalid(_))));
    }

    #[test]
    fn test_internal_domain_list() {
        let settings = AppSettings::parse(SAMPLE).unwrap();
        assert_eq!(
            settings.pulp.internal_domain_list(),
            vec!["corp.example.com", "build.example.com"]
        );
    }

    #[test]
    fn test_internal_domain_list_empty() {
        let settings = AppSettings::parse("").unwrap();
        assert!(settings.pulp.internal_domain_list().is_empty());
    }

    #[test]
    fn test_is_internal_url() {
        let settings = AppSettings::parse(SAMPLE).unwrap();
        assert!(settings
            .pulp
            .is_internal_url("https://mirror.corp.example.com/apt"));
        assert!(!settings.pulp.is_internal_url("https://deb.debian.org"));
    }

    #[test]
    fn test_roundtrip() {
        let settings = AppSettings::parse(SAMPLE).unwrap();
        let serialized = toml::to_string(&settings).unwrap();
        let reparsed = AppSettings::parse(&serialized).unwrap();
        assert_eq!(
            reparsed.pulp.banned_package_regex,
            settings.pulp.banned_package_regex
        );
        assert_eq!(
            reparsed.remotes.sock_read_timeout,
            settings.remotes.sock_read_timeout
        );
    }
}

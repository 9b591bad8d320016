//! Fleet configuration.
//!
//! The fleet file is YAML describing the managed Pulp servers, the named
//! credentials they authenticate with, and the repo groups bound to each
//! server with a cron schedule and runtime caps. Parsing is strict about the
//! cross-references: every failure here is fatal at startup.

use crate::error::{AppError, Result};
use cron::Schedule;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Top-level fleet config document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialsEntry>,
    #[serde(default)]
    pub repo_groups: BTreeMap<String, RepoGroupDef>,
    #[serde(default)]
    pub pulp_servers: BTreeMap<String, PulpServerDef>,
}

/// A named credential: the username plus the Vault mount the password is
/// read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsEntry {
    pub username: String,
    pub vault_service_account_mount: String,
}

/// A named (include/exclude) regex pair over repository names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoGroupDef {
    #[serde(default)]
    pub regex_include: Option<String>,
    #[serde(default)]
    pub regex_exclude: Option<String>,
}

/// Per-server fleet entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulpServerDef {
    pub credentials: String,
    #[serde(default)]
    pub repo_config_registration: Option<RegistrationDef>,
    #[serde(default)]
    pub snapshot_support: Option<SnapshotSupportDef>,
    #[serde(default)]
    pub repo_groups: BTreeMap<String, GroupBindingDef>,
}

/// Schedule for applying the declarative repo catalog to a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationDef {
    pub schedule: String,
    #[serde(
        deserialize_with = "deserialize_max_runtime",
        serialize_with = "serialize_max_runtime"
    )]
    pub max_runtime: Duration,
}

/// Marks a server snapshot-capable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSupportDef {
    pub max_concurrent_snapshots: u32,
}

/// Binding of a repo group to a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupBindingDef {
    pub schedule: String,
    pub max_concurrent_sync: u32,
    #[serde(
        deserialize_with = "deserialize_max_runtime",
        serialize_with = "serialize_max_runtime"
    )]
    pub max_runtime: Duration,
    #[serde(default)]
    pub pulp_master: Option<String>,
}

impl FleetConfig {
    /// Load and validate the fleet config from a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigInvalid(format!("could not read fleet config '{path}': {e}"))
        })?;
        Self::parse(&raw)
    }

    /// Parse and validate fleet config YAML. Duplicate mapping keys (and
    /// therefore duplicate server names) are rejected by the YAML parser.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: FleetConfig = serde_yaml::from_str(raw)
            .map_err(|e| AppError::ConfigInvalid(format!("invalid fleet config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (server_name, server) in &self.pulp_servers {
            if !self.credentials.contains_key(&server.credentials) {
                return Err(AppError::ConfigInvalid(format!(
                    "pulp server '{server_name}' references unknown credentials '{}'",
                    server.credentials
                )));
            }

            if let Some(registration) = &server.repo_config_registration {
                parse_schedule(&registration.schedule).map_err(|e| {
                    AppError::ConfigInvalid(format!(
                        "pulp server '{server_name}' repo_config_registration: {e}"
                    ))
                })?;
                if registration.max_runtime.is_zero() {
                    return Err(AppError::ConfigInvalid(format!(
                        "pulp server '{server_name}' repo_config_registration max_runtime \
                         must be a positive duration"
                    )));
                }
            }

            for (group_name, binding) in &server.repo_groups {
                if !self.repo_groups.contains_key(group_name) {
                    return Err(AppError::ConfigInvalid(format!(
                        "pulp server '{server_name}' binds unknown repo group '{group_name}'"
                    )));
                }
                parse_schedule(&binding.schedule).map_err(|e| {
                    AppError::ConfigInvalid(format!(
                        "pulp server '{server_name}' group '{group_name}': {e}"
                    ))
                })?;
                if binding.max_runtime.is_zero() {
                    return Err(AppError::ConfigInvalid(format!(
                        "pulp server '{server_name}' group '{group_name}' max_runtime \
                         must be a positive duration"
                    )));
                }
                if binding.max_concurrent_sync == 0 {
                    return Err(AppError::ConfigInvalid(format!(
                        "pulp server '{server_name}' group '{group_name}' \
                         max_concurrent_sync must be at least 1"
                    )));
                }
                if let Some(master) = &binding.pulp_master {
                    if !self.pulp_servers.contains_key(master) {
                        return Err(AppError::ConfigInvalid(format!(
                            "pulp server '{server_name}' group '{group_name}' names \
                             pulp_master '{master}' which is not in the fleet"
                        )));
                    }
                }
            }
        }

        for (group_name, group) in &self.repo_groups {
            for pattern in [&group.regex_include, &group.regex_exclude]
                .into_iter()
                .flatten()
            {
                regex::Regex::new(pattern).map_err(|e| {
                    AppError::ConfigInvalid(format!(
                        "repo group '{group_name}' has invalid regex '{pattern}': {e}"
                    ))
                })?;
            }
        }

        Ok(())
    }
}

/// Parse a five-field cron expression. The `cron` crate wants a seconds
/// field, so five-field expressions get `0 ` prepended.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| AppError::ConfigInvalid(format!("invalid cron expression '{expr}': {e}")))
}

/// Parse a `max_runtime` value: `<N>s`, `<N>m`, `<N>h`, `<N>d`, or a bare
/// integer meaning seconds.
pub fn parse_max_runtime(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::ConfigInvalid("max_runtime is empty".into()));
    }

    let (digits, unit_secs) = match value.as_bytes()[value.len() - 1] {
        b's' => (&value[..value.len() - 1], 1),
        b'm' => (&value[..value.len() - 1], 60),
        b'h' => (&value[..value.len() - 1], 3600),
        b'd' => (&value[..value.len() - 1], 86400),
        _ => (value, 1),
    };

    let count: u64 = digits.parse().map_err(|_| {
        AppError::ConfigInvalid(format!("invalid max_runtime '{value}'"))
    })?;

    Ok(Duration::from_secs(count * unit_secs))
}

/// Accept `max_runtime` as either a string with a unit suffix or a bare
/// integer number of seconds.
fn deserialize_max_runtime<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_max_runtime(&text).map_err(serde::de::Error::custom),
    }
}

/// Optional variant of `deserialize_max_runtime` for API request bodies.
pub fn deserialize_opt_max_runtime<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(Raw::Text(text)) => parse_max_runtime(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Emit `max_runtime` as a bare number of seconds so serialized configs
/// parse back through `deserialize_max_runtime`.
fn serialize_max_runtime<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(value.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
credentials:
  prod-svc:
    username: svc_pulp
    vault_service_account_mount: service-accounts

repo_groups:
  external:
    regex_include: "^ext-"
  internal:
    regex_include: "^corp-"
    regex_exclude: "-staging$"

pulp_servers:
  pulp-primary.example.com:
    credentials: prod-svc
    repo_config_registration:
      schedule: "0 4 * * *"
      max_runtime: 2h
    snapshot_support:
      max_concurrent_snapshots: 3
    repo_groups:
      external:
        schedule: "30 2 * * *"
        max_concurrent_sync: 4
        max_runtime: 6h
  pulp-secondary.example.com:
    credentials: prod-svc
    repo_groups:
      external:
        schedule: "0 8,20 * * *"
        max_concurrent_sync: 2
        max_runtime: 14400
        pulp_master: pulp-primary.example.com
"#;

    #[test]
    fn test_parse_sample() {
        let config = FleetConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.pulp_servers.len(), 2);
        assert_eq!(config.repo_groups.len(), 2);

        let primary = &config.pulp_servers["pulp-primary.example.com"];
        assert!(primary.snapshot_support.is_some());
        assert_eq!(
            primary.repo_config_registration.as_ref().unwrap().max_runtime,
            Duration::from_secs(7200)
        );

        let secondary = &config.pulp_servers["pulp-secondary.example.com"];
        let binding = &secondary.repo_groups["external"];
        assert_eq!(binding.max_runtime, Duration::from_secs(14400));
        assert_eq!(
            binding.pulp_master.as_deref(),
            Some("pulp-primary.example.com")
        );
    }

    #[test]
    fn test_unknown_credentials_rejected() {
        let raw = r#"
pulp_servers:
  pulp1.example.com:
    credentials: nope
"#;
        let err = FleetConfig::parse(raw).unwrap_err();
        assert!(matches!(err, AppError::ConfigInvalid(_)));
        assert!(err.to_string().contains("unknown credentials 'nope'"));
    }

    #[test]
    fn test_bad_cron_rejected() {
        let raw = r#"
credentials:
  c: {username: u, vault_service_account_mount: m}
repo_groups:
  g: {}
pulp_servers:
  pulp1.example.com:
    credentials: c
    repo_groups:
      g:
        schedule: "every tuesday"
        max_concurrent_sync: 1
        max_runtime: 1h
"#;
        let err = FleetConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }

    #[test]
    fn test_zero_max_runtime_rejected() {
        let raw = r#"
credentials:
  c: {username: u, vault_service_account_mount: m}
repo_groups:
  g: {}
pulp_servers:
  pulp1.example.com:
    credentials: c
    repo_groups:
      g:
        schedule: "0 1 * * *"
        max_concurrent_sync: 1
        max_runtime: 0
"#;
        let err = FleetConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("positive duration"));
    }

    #[test]
    fn test_unknown_pulp_master_rejected() {
        let raw = r#"
credentials:
  c: {username: u, vault_service_account_mount: m}
repo_groups:
  g: {}
pulp_servers:
  pulp1.example.com:
    credentials: c
    repo_groups:
      g:
        schedule: "0 1 * * *"
        max_concurrent_sync: 1
        max_runtime: 1h
        pulp_master: ghost.example.com
"#;
        let err = FleetConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("ghost.example.com"));
    }

    #[test]
    fn test_duplicate_server_rejected() {
        let raw = r#"
credentials:
  c: {username: u, vault_service_account_mount: m}
pulp_servers:
  pulp1.example.com:
    credentials: c
  pulp1.example.com:
    credentials: c
"#;
        assert!(FleetConfig::parse(raw).is_err());
    }

    #[test]
    fn test_invalid_group_regex_rejected() {
        let raw = r#"
repo_groups:
  g:
    regex_include: "[unclosed"
"#;
        let err = FleetConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
    }

    #[test]
    fn test_parse_max_runtime_units() {
        assert_eq!(parse_max_runtime("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_max_runtime("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_max_runtime("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_max_runtime("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_max_runtime("90").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_max_runtime_invalid() {
        assert!(parse_max_runtime("").is_err());
        assert!(parse_max_runtime("h").is_err());
        assert!(parse_max_runtime("ten minutes").is_err());
        assert!(parse_max_runtime("-5m").is_err());
    }

    #[test]
    fn test_parse_schedule_five_field() {
        let schedule = parse_schedule("0 4 * * *").unwrap();
        assert!(schedule.upcoming(chrono::Utc).next().is_some());
    }

    #[test]
    fn test_parse_schedule_comma_lists() {
        assert!(parse_schedule("0 8,20 * * 1-5").is_ok());
        assert!(parse_schedule("*/15 * * * *").is_ok());
    }

    #[test]
    fn test_roundtrip() {
        let config = FleetConfig::parse(SAMPLE).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let reparsed = FleetConfig::parse(&serialized).unwrap();
        assert_eq!(
            reparsed.pulp_servers.keys().collect::<Vec<_>>(),
            config.pulp_servers.keys().collect::<Vec<_>>()
        );
        assert_eq!(reparsed.repo_groups, config.repo_groups);
        assert_eq!(
            reparsed.pulp_servers["pulp-secondary.example.com"].repo_groups["external"]
                .max_runtime,
            Duration::from_secs(14400)
        );
    }
}

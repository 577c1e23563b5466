//! Service manager configuration.
//!
//! Parsed from a JSON file. Paths that are not set explicitly are derived
//! from `workingDir`; durations are strings such as `"10s"`, `"35s"`,
//! `"30d"`.

use crate::constants::{
    DEFAULT_DROP_INS_DIR, DEFAULT_LAYER_TTL, DEFAULT_LOG_PART_COUNT, DEFAULT_LOG_PART_SIZE,
    DEFAULT_MAX_PARALLEL_OPS, DEFAULT_MONITORING_AVERAGE_WINDOW, DEFAULT_MONITORING_POLL_PERIOD,
    DEFAULT_REMOVE_OUTDATED_PERIOD, DEFAULT_SERVICE_ALERT_PRIORITY, DEFAULT_SERVICE_TTL,
    DEFAULT_SYSTEM_ALERT_PRIORITY, MAX_ALERT_PRIORITY,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// A static host entry added to every instance's `/etc/hosts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEntry {
    pub ip: String,
    pub hostname: String,
}

/// Resource monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    #[serde(default = "default_poll_period", with = "duration_str")]
    pub poll_period: Duration,
    #[serde(default = "default_average_window", with = "duration_str")]
    pub average_window: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            poll_period: DEFAULT_MONITORING_POLL_PERIOD,
            average_window: DEFAULT_MONITORING_AVERAGE_WINDOW,
        }
    }
}

/// Log upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_part_size")]
    pub max_part_size: usize,
    #[serde(default = "default_log_part_count")]
    pub max_part_count: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_part_size: DEFAULT_LOG_PART_SIZE,
            max_part_count: DEFAULT_LOG_PART_COUNT,
        }
    }
}

/// Journal alert settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalAlertsConfig {
    /// Messages matching any of these regular expressions are dropped.
    #[serde(default)]
    pub filter: Vec<String>,
    #[serde(default = "default_service_alert_priority")]
    pub service_alert_priority: u8,
    #[serde(default = "default_system_alert_priority")]
    pub system_alert_priority: u8,
}

impl Default for JournalAlertsConfig {
    fn default() -> Self {
        Self {
            filter: Vec::new(),
            service_alert_priority: DEFAULT_SERVICE_ALERT_PRIORITY,
            system_alert_priority: DEFAULT_SYSTEM_ALERT_PRIORITY,
        }
    }
}

/// Database schema migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    #[serde(default = "default_migration_path")]
    pub migration_path: PathBuf,
    /// Derived from `workingDir` when empty.
    #[serde(default)]
    pub merged_migration_path: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migration_path: default_migration_path(),
            merged_migration_path: PathBuf::new(),
        }
    }
}

fn default_migration_path() -> PathBuf {
    PathBuf::from("/usr/share/aos/servicemanager/migration")
}

/// Top-level service manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub working_dir: PathBuf,

    #[serde(default = "default_cert_storage")]
    pub cert_storage: PathBuf,
    #[serde(default)]
    pub iam_public_server_url: String,
    #[serde(default)]
    pub iam_protected_server_url: String,
    #[serde(default)]
    pub ca_cert: PathBuf,

    /// Derived from `workingDir` when empty.
    #[serde(default)]
    pub services_dir: PathBuf,
    #[serde(default)]
    pub download_dir: PathBuf,
    /// Percent of the partition usable for services; 0 means unbounded.
    #[serde(default)]
    pub services_part_limit: u32,
    #[serde(default = "default_service_ttl", with = "duration_str")]
    pub service_ttl: Duration,
    #[serde(default = "default_remove_outdated_period", with = "duration_str")]
    pub remove_outdated_period: Duration,

    #[serde(default)]
    pub layers_dir: PathBuf,
    /// Percent of the partition usable for layers; 0 means unbounded.
    #[serde(default)]
    pub layers_part_limit: u32,
    #[serde(default = "default_layer_ttl", with = "duration_str")]
    pub layer_ttl: Duration,

    #[serde(default)]
    pub storage_dir: PathBuf,
    #[serde(default)]
    pub state_dir: PathBuf,
    /// Top-level host paths bound into instances; everything else is
    /// masked with whiteouts.
    #[serde(default)]
    pub host_binds: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,

    #[serde(default)]
    pub cm_server_url: String,
    #[serde(default = "default_cm_reconnect_timeout", with = "duration_str")]
    pub cm_reconnect_timeout: Duration,

    #[serde(default = "default_drop_ins_dir")]
    pub drop_ins_dir: PathBuf,
    #[serde(default = "default_max_parallel_ops")]
    pub max_parallel_instance_ops: usize,

    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub journal_alerts: JournalAlertsConfig,
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Derived from `workingDir` when empty.
    #[serde(default)]
    pub node_config_file: PathBuf,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::Fatal(format!("cannot read config {}: {err}", path.display()))
        })?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|err| Error::Fatal(format!("cannot parse config: {err}")))?;

        config.fill_defaults();
        config.validate()?;

        Ok(config)
    }

    /// Builds a configuration rooted at `working_dir` with all defaults.
    pub fn with_working_dir(working_dir: impl Into<PathBuf>) -> Self {
        let working_dir: PathBuf = working_dir.into();
        let mut config: Config =
            serde_json::from_value(serde_json::json!({ "workingDir": working_dir }))
                .expect("default config is valid");
        config.fill_defaults();
        config
    }

    /// Fills path defaults derived from the working directory.
    fn fill_defaults(&mut self) {
        let wd = self.working_dir.clone();
        let fill = |field: &mut PathBuf, leaf: &str| {
            if field.as_os_str().is_empty() {
                *field = wd.join(leaf);
            }
        };

        fill(&mut self.services_dir, "services");
        fill(&mut self.download_dir, "downloads");
        fill(&mut self.layers_dir, "layers");
        fill(&mut self.storage_dir, "storages");
        fill(&mut self.state_dir, "states");
        fill(&mut self.node_config_file, "aos_node.cfg");
        fill(&mut self.migration.merged_migration_path, "mergedMigration");
    }

    /// Validates the configuration, clamping recoverable fields.
    fn validate(&mut self) -> Result<()> {
        if self.working_dir.as_os_str().is_empty() {
            return Err(Error::Fatal("workingDir is not set".to_string()));
        }

        if self.journal_alerts.service_alert_priority > MAX_ALERT_PRIORITY {
            warn!(
                value = self.journal_alerts.service_alert_priority,
                "serviceAlertPriority out of range, using default"
            );
            self.journal_alerts.service_alert_priority = DEFAULT_SERVICE_ALERT_PRIORITY;
        }

        if self.journal_alerts.system_alert_priority > MAX_ALERT_PRIORITY {
            warn!(
                value = self.journal_alerts.system_alert_priority,
                "systemAlertPriority out of range, using default"
            );
            self.journal_alerts.system_alert_priority = DEFAULT_SYSTEM_ALERT_PRIORITY;
        }

        if self.services_part_limit > 100 || self.layers_part_limit > 100 {
            return Err(Error::Fatal("partition limit exceeds 100 percent".to_string()));
        }

        Ok(())
    }
}

// =============================================================================
// Duration Strings
// =============================================================================

/// Parses durations of the form `"500ms"`, `"10s"`, `"5m"`, `"2h"`, `"30d"`.
/// A bare number is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let count: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid duration '{value}'")))?;

    let duration = match unit {
        "ms" => Duration::from_millis(count),
        "" | "s" => Duration::from_secs(count),
        "m" => Duration::from_secs(count * 60),
        "h" => Duration::from_secs(count * 60 * 60),
        "d" => Duration::from_secs(count * 24 * 60 * 60),
        _ => {
            return Err(Error::InvalidArgument(format!(
                "invalid duration unit '{unit}'"
            )));
        }
    };

    Ok(duration)
}

mod duration_str {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", value.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

fn default_cert_storage() -> PathBuf {
    PathBuf::from("/var/aos/crypt/sm/")
}

fn default_drop_ins_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DROP_INS_DIR)
}

fn default_service_ttl() -> Duration {
    DEFAULT_SERVICE_TTL
}

fn default_layer_ttl() -> Duration {
    DEFAULT_LAYER_TTL
}

fn default_remove_outdated_period() -> Duration {
    DEFAULT_REMOVE_OUTDATED_PERIOD
}

fn default_cm_reconnect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_period() -> Duration {
    DEFAULT_MONITORING_POLL_PERIOD
}

fn default_average_window() -> Duration {
    DEFAULT_MONITORING_AVERAGE_WINDOW
}

fn default_log_part_size() -> usize {
    DEFAULT_LOG_PART_SIZE
}

fn default_log_part_count() -> usize {
    DEFAULT_LOG_PART_COUNT
}

fn default_service_alert_priority() -> u8 {
    DEFAULT_SERVICE_ALERT_PRIORITY
}

fn default_system_alert_priority() -> u8 {
    DEFAULT_SYSTEM_ALERT_PRIORITY
}

fn default_max_parallel_ops() -> usize {
    DEFAULT_MAX_PARALLEL_OPS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(
            parse_duration("30d").unwrap(),
            Duration::from_secs(30 * 24 * 60 * 60)
        );
        assert!(parse_duration("10y").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn defaults_derive_from_working_dir() {
        let config = Config::with_working_dir("/var/aos/sm");

        assert_eq!(config.services_dir, PathBuf::from("/var/aos/sm/services"));
        assert_eq!(config.download_dir, PathBuf::from("/var/aos/sm/downloads"));
        assert_eq!(config.layers_dir, PathBuf::from("/var/aos/sm/layers"));
        assert_eq!(config.storage_dir, PathBuf::from("/var/aos/sm/storages"));
        assert_eq!(config.state_dir, PathBuf::from("/var/aos/sm/states"));
        assert_eq!(
            config.node_config_file,
            PathBuf::from("/var/aos/sm/aos_node.cfg")
        );
        assert_eq!(config.service_ttl, DEFAULT_SERVICE_TTL);
        assert_eq!(config.cm_reconnect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn alert_priorities_clamped() {
        let mut config = Config::with_working_dir("/tmp/sm");
        config.journal_alerts.service_alert_priority = 9;
        config.journal_alerts.system_alert_priority = 200;
        config.validate().unwrap();

        assert_eq!(
            config.journal_alerts.service_alert_priority,
            DEFAULT_SERVICE_ALERT_PRIORITY
        );
        assert_eq!(
            config.journal_alerts.system_alert_priority,
            DEFAULT_SYSTEM_ALERT_PRIORITY
        );
    }

    #[test]
    fn config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aos_servicemanager.cfg");
        std::fs::write(
            &path,
            serde_json::json!({
                "workingDir": "/var/aos/sm",
                "servicesPartLimit": 80,
                "serviceTtl": "7d",
                "journalAlerts": { "filter": ["^audit"], "serviceAlertPriority": 5 }
            })
            .to_string(),
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.services_part_limit, 80);
        assert_eq!(config.service_ttl, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(config.journal_alerts.service_alert_priority, 5);
        assert_eq!(config.journal_alerts.filter, vec!["^audit".to_string()]);
    }
}

//! Coordinator configuration.
//!
//! Parsed from a TOML file. Every section is optional; missing sections and
//! fields take the defaults below. Command-line overrides are applied by the
//! daemon before [`CoordinatorConfig::validate`] runs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Local region identity, store location and tick intervals.
    #[serde(default)]
    pub coordinator: CoordinatorSection,

    /// Static region registry.
    #[serde(default)]
    pub regions: RegionsConfig,

    /// Local regional account API.
    #[serde(default)]
    pub regional_api: RegionalApiConfig,

    /// External services called by merge commits.
    #[serde(default)]
    pub services: ServicesConfig,

    /// Per-job timeout overrides.
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Loads `path` if it exists, else returns the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or contains unknown keys.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks values serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an empty region uid, a zero
    /// interval or timeout, or a blank region in the static registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.region_uid.trim().is_empty() {
            return Err(ConfigError::Validation(
                "coordinator.region_uid must not be empty".to_string(),
            ));
        }
        let intervals = [
            ("coordinator.run_interval_ms", self.coordinator.run_interval_ms),
            ("coordinator.finish_interval_ms", self.coordinator.finish_interval_ms),
            ("coordinator.commit_interval_ms", self.coordinator.commit_interval_ms),
            ("regional_api.timeout_secs", self.regional_api.timeout_secs),
            ("services.timeout_secs", self.services.timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be > 0")));
            }
        }
        for (job, overrides) in [
            ("delete_user", &self.jobs.delete_user),
            ("merge_user", &self.jobs.merge_user),
        ] {
            if overrides.unit_timeout_secs == Some(0) || overrides.commit_timeout_secs == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "jobs.{job} timeouts must be > 0"
                )));
            }
        }
        if self.regions.uids.iter().any(|uid| uid.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "regions.uids must not contain empty entries".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[coordinator]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorSection {
    /// Region this instance runs units for.
    #[serde(default)]
    pub region_uid: String,

    /// `SQLite` database shared by every coordinator instance.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Interval between `RunPhase` ticks.
    #[serde(default = "default_run_interval_ms")]
    pub run_interval_ms: u64,

    /// Interval between `FinishPhase` ticks.
    #[serde(default = "default_finish_interval_ms")]
    pub finish_interval_ms: u64,

    /// Interval between `CommitPhase` ticks.
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
}

impl CoordinatorSection {
    /// `RunPhase` tick interval.
    #[must_use]
    pub const fn run_interval(&self) -> Duration {
        Duration::from_millis(self.run_interval_ms)
    }

    /// `FinishPhase` tick interval.
    #[must_use]
    pub const fn finish_interval(&self) -> Duration {
        Duration::from_millis(self.finish_interval_ms)
    }

    /// `CommitPhase` tick interval.
    #[must_use]
    pub const fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            region_uid: String::new(),
            database: default_database(),
            run_interval_ms: default_run_interval_ms(),
            finish_interval_ms: default_finish_interval_ms(),
            commit_interval_ms: default_commit_interval_ms(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("xregion.db")
}

const fn default_run_interval_ms() -> u64 {
    5_000
}

const fn default_finish_interval_ms() -> u64 {
    10_000
}

const fn default_commit_interval_ms() -> u64 {
    10_000
}

/// `[regions]` section. Empty means "use the store's region table".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionsConfig {
    /// Active region uids.
    #[serde(default)]
    pub uids: Vec<String>,
}

impl RegionsConfig {
    /// Configured uids as a set.
    #[must_use]
    pub fn as_set(&self) -> BTreeSet<String> {
        self.uids.iter().cloned().collect()
    }
}

/// `[regional_api]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionalApiConfig {
    /// Base URL of the local region's account service. Required unless
    /// `dry_run` is set.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Run units against an in-memory region instead of a real cluster.
    #[serde(default)]
    pub dry_run: bool,

    /// Per-request timeout.
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RegionalApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            dry_run: false,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// `[services]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicesConfig {
    /// Billing service base URL (balance transfer).
    #[serde(default)]
    pub billing_url: Option<String>,

    /// Work-order service base URL.
    #[serde(default)]
    pub workorder_url: Option<String>,

    /// VM provisioning service base URL.
    #[serde(default)]
    pub vm_url: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            billing_url: None,
            workorder_url: None,
            vm_url: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

const fn default_http_timeout_secs() -> u64 {
    10
}

/// `[jobs]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobsConfig {
    /// `[jobs.delete_user]`.
    #[serde(default)]
    pub delete_user: JobTimeoutOverrides,

    /// `[jobs.merge_user]`.
    #[serde(default)]
    pub merge_user: JobTimeoutOverrides,
}

/// Optional timeout overrides for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobTimeoutOverrides {
    /// Regional lease length.
    #[serde(default)]
    pub unit_timeout_secs: Option<u64>,

    /// Commit window measured from the FINISH transition.
    #[serde(default)]
    pub commit_timeout_secs: Option<u64>,
}

impl JobTimeoutOverrides {
    /// Unit timeout, or `default` when not overridden.
    #[must_use]
    pub fn unit_timeout(&self, default: Duration) -> Duration {
        self.unit_timeout_secs.map_or(default, Duration::from_secs)
    }

    /// Commit timeout, or `default` when not overridden.
    #[must_use]
    pub fn commit_timeout(&self, default: Duration) -> Duration {
        self.commit_timeout_secs.map_or(default, Duration::from_secs)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

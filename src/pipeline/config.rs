//! Runner configuration.
//!
//! All configuration comes from an environment-style key/value map: the
//! process environment, optionally overlaid with a dotenv-style file. The map
//! is captured once as an [`Environment`] and passed around explicitly, so
//! nothing below this module reads process state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::error::JobError;
use crate::project::PrivacyTier;

/// Default wall-clock budget for a single job (24 hours).
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Default delay between queue polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a cancelled backend gets to clean up before it is aborted.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Default backend name used to filter pending jobs.
pub const DEFAULT_BACKEND: &str = "tpp";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An immutable snapshot of environment-style configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Captures the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Builds an environment from explicit pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns a copy with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Returns a copy where entries from `other` replace existing ones.
    pub fn overlay(mut self, other: BTreeMap<String, String>) -> Self {
        self.vars.extend(other);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    /// Connection URL for a database flavour, keyed `<FLAVOUR>_DATABASE_URL`.
    pub fn database_url(&self, db: &str) -> Result<String, JobError> {
        let env_var = format!("{}_DATABASE_URL", db.to_uppercase());
        match self.get(&env_var) {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ => Err(JobError::MissingDatabaseConfiguration {
                db: db.to_string(),
                env_var,
            }),
        }
    }
}

/// Parses a dotenv-style file into key/value pairs.
///
/// Each non-blank line not starting with `#` is `key = value`. Whitespace
/// around keys and values is trimmed, and one layer of matching single or
/// double quotes is removed from the value. Lines without `=` are ignored.
pub fn parse_env(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Storage root directory for each privacy tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoots {
    pub high: PathBuf,
    pub medium: PathBuf,
}

impl StorageRoots {
    pub fn new(high: impl Into<PathBuf>, medium: impl Into<PathBuf>) -> Self {
        Self {
            high: high.into(),
            medium: medium.into(),
        }
    }

    /// Root directory for a tier.
    pub fn root_for(&self, tier: PrivacyTier) -> &PathBuf {
        match tier {
            PrivacyTier::High => &self.high,
            PrivacyTier::Medium => &self.medium,
        }
    }
}

/// Configuration for resolving and supervising jobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Storage roots per privacy tier.
    pub storage: StorageRoots,
    /// URL listing pending jobs.
    pub job_server_endpoint: Option<String>,
    /// Basic auth credentials for the job server.
    pub queue_auth: Option<(String, String)>,
    /// Backend name pending jobs are filtered by.
    pub backend: String,
    /// Wall-clock budget for one job.
    pub job_timeout: Duration,
    /// Delay between queue polls.
    pub poll_interval: Duration,
    /// Time a cancelled backend gets to clean up.
    pub cancel_grace: Duration,
    /// Snapshot used for per-database lookups.
    pub environment: Environment,
}

impl RunnerConfig {
    /// Creates a configuration with default timings.
    pub fn new(storage: StorageRoots) -> Self {
        Self {
            storage,
            job_server_endpoint: None,
            queue_auth: None,
            backend: DEFAULT_BACKEND.to_string(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            environment: Environment::default(),
        }
    }

    /// Creates configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_environment(Environment::from_process())
    }

    /// Creates configuration from an environment snapshot.
    ///
    /// # Environment Variables
    ///
    /// - `HIGH_PRIVACY_STORAGE_BASE`: storage root for high privacy data (required)
    /// - `MEDIUM_PRIVACY_STORAGE_BASE`: storage root for medium privacy data (required)
    /// - `JOB_SERVER_ENDPOINT`: URL listing pending jobs
    /// - `QUEUE_USER` / `QUEUE_PASS`: basic auth for the job server
    /// - `BACKEND`: backend name jobs are filtered by (default: tpp)
    /// - `JOB_TIMEOUT_SECS`: job budget in seconds (default: 86400)
    /// - `POLL_INTERVAL_SECS`: delay between polls (default: 5)
    /// - `CANCEL_GRACE_SECS`: cleanup time after cancellation (default: 10)
    /// - `<FLAVOUR>_DATABASE_URL`: read when a job for that database runs
    pub fn from_environment(env: Environment) -> Result<Self, ConfigError> {
        let storage = StorageRoots::new(
            env.require("HIGH_PRIVACY_STORAGE_BASE")?,
            env.require("MEDIUM_PRIVACY_STORAGE_BASE")?,
        );
        let mut config = Self::new(storage);

        config.job_server_endpoint = env.get("JOB_SERVER_ENDPOINT").map(str::to_string);

        if let (Some(user), Some(pass)) = (env.get("QUEUE_USER"), env.get("QUEUE_PASS")) {
            config.queue_auth = Some((user.to_string(), pass.to_string()));
        }

        if let Some(val) = env.get("BACKEND") {
            config.backend = val.to_string();
        }

        if let Some(val) = env.get("JOB_TIMEOUT_SECS") {
            config.job_timeout = Duration::from_secs(parse_env_value(val, "JOB_TIMEOUT_SECS")?);
        }

        if let Some(val) = env.get("POLL_INTERVAL_SECS") {
            config.poll_interval =
                Duration::from_secs(parse_env_value(val, "POLL_INTERVAL_SECS")?);
        }

        if let Some(val) = env.get("CANCEL_GRACE_SECS") {
            config.cancel_grace = Duration::from_secs(parse_env_value(val, "CANCEL_GRACE_SECS")?);
        }

        config.environment = env;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.backend.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "backend cannot be empty".to_string(),
            ));
        }

        if self.storage.high == self.storage.medium {
            return Err(ConfigError::ValidationFailed(
                "high and medium privacy storage must be different directories".to_string(),
            ));
        }

        Ok(())
    }

    /// The job server endpoint, required for supervising.
    pub fn require_endpoint(&self) -> Result<&str, ConfigError> {
        self.job_server_endpoint
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("JOB_SERVER_ENDPOINT".to_string()))
    }

    /// Builder method to set the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builder method to set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the environment snapshot.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }
}

/// Helper to parse environment variable values.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{}'", value),
    })
}

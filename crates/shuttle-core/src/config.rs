//! Configuration (`shuttle.toml`).
//!
//! ```toml
//! [database]
//! path = "shuttle.db"
//! busy_timeout_ms = 5000
//!
//! [worker]
//! lease_duration_secs = 300
//! renew_interval_secs = 60
//! recover_interval_secs = 30
//! poll_min_ms = 100
//! poll_max_ms = 5000
//! poll_backoff_factor = 2.0
//! default_max_tries = 3
//! retry_failed_executions = false
//!
//! [workflows]
//! path = "workflows"
//!
//! [[executors]]
//! name = "reviewer"
//! factory = "static"
//! params = { output = { approved = true } }
//! ```
//!
//! Every field has a default; a missing file means all defaults. Selected
//! values can be overridden with `SHUTTLE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::app::backoff::PollBackoff;
use crate::domain::DEFAULT_MAX_TRIES;

pub const DEFAULT_CONFIG_FILE: &str = "shuttle.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("shuttle.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Lease owner id; generated at startup when unset.
    pub id: Option<String>,
    pub lease_duration_secs: u64,
    pub renew_interval_secs: u64,
    pub recover_interval_secs: u64,
    pub poll_min_ms: u64,
    pub poll_max_ms: u64,
    pub poll_backoff_factor: f64,
    pub default_max_tries: u32,
    /// Return failed executions to `pending` while budget remains.
    pub retry_failed_executions: bool,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            id: None,
            lease_duration_secs: 300,
            renew_interval_secs: 60,
            recover_interval_secs: 30,
            poll_min_ms: 100,
            poll_max_ms: 5_000,
            poll_backoff_factor: 2.0,
            default_max_tries: DEFAULT_MAX_TRIES,
            retry_failed_executions: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkflowsSection {
    /// A `.toml` file or a directory of them.
    pub path: Option<PathBuf>,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// One `[[executors]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutorConfig {
    pub name: String,
    pub factory: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

impl ExecutorConfig {
    pub fn new(name: impl Into<String>, factory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory: factory.into(),
            params: empty_params(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub database: DatabaseSection,
    pub worker: WorkerSection,
    pub workflows: WorkflowsSection,
    pub executors: Vec<ExecutorConfig>,
}

impl ShuttleConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SHUTTLE_*` overrides from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(path) = lookup("SHUTTLE_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(id) = lookup("SHUTTLE_WORKER_ID") {
            self.worker.id = Some(id);
        }
        if let Some(path) = lookup("SHUTTLE_WORKFLOWS_PATH") {
            self.workflows.path = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup("SHUTTLE_LEASE_DURATION_SECS") {
            self.worker.lease_duration_secs = parse_env("SHUTTLE_LEASE_DURATION_SECS", &raw)?;
        }
        if let Some(raw) = lookup("SHUTTLE_RETRY_FAILED_EXECUTIONS") {
            self.worker.retry_failed_executions =
                parse_env("SHUTTLE_RETRY_FAILED_EXECUTIONS", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.worker;
        let mut problems = Vec::new();

        if w.lease_duration_secs == 0 {
            problems.push("worker.lease_duration_secs must be positive".to_string());
        }
        if w.renew_interval_secs == 0 {
            problems.push("worker.renew_interval_secs must be positive".to_string());
        }
        if w.renew_interval_secs >= w.lease_duration_secs {
            problems.push("worker.renew_interval_secs must be shorter than the lease".to_string());
        }
        if w.recover_interval_secs == 0 {
            problems.push("worker.recover_interval_secs must be positive".to_string());
        }
        if w.poll_min_ms == 0 {
            problems.push("worker.poll_min_ms must be positive".to_string());
        }
        if w.poll_max_ms < w.poll_min_ms {
            problems.push("worker.poll_max_ms must be >= poll_min_ms".to_string());
        }
        if !(w.poll_backoff_factor >= 1.0) {
            problems.push("worker.poll_backoff_factor must be >= 1".to_string());
        }
        if w.default_max_tries == 0 {
            problems.push("worker.default_max_tries must be at least 1".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for entry in &self.executors {
            if !names.insert(entry.name.as_str()) {
                problems.push(format!("executor '{}' is configured twice", entry.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database.busy_timeout_ms)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let w = &self.worker;
        WorkerSettings {
            lease_duration: Duration::from_secs(w.lease_duration_secs),
            renew_interval: Duration::from_secs(w.renew_interval_secs),
            recover_interval: Duration::from_secs(w.recover_interval_secs),
            poll: PollBackoff {
                min: Duration::from_millis(w.poll_min_ms),
                max: Duration::from_millis(w.poll_max_ms),
                factor: w.poll_backoff_factor,
            },
            default_max_tries: w.default_max_tries,
            retry_failed_executions: w.retry_failed_executions,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse '{raw}'")))
}

/// Runtime knobs of the worker and recovery loops.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub recover_interval: Duration,
    pub poll: PollBackoff,
    pub default_max_tries: u32,
    pub retry_failed_executions: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        ShuttleConfig::default().worker_settings()
    }
}

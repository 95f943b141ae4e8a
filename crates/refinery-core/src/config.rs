//! Refinery configuration.
//!
//! Sources, later overriding earlier:
//! 1. built-in defaults
//! 2. project file `.refinery/config.toml` (or an explicit path)
//! 3. environment variables `REFINERY_*`
//!
//! Relative paths are resolved against the project directory passed to
//! [`RefineryConfig::load`].

use std::{
    path::{Path, PathBuf},
    time::Duration as StdDuration,
};

use serde::{Deserialize, Serialize};

use crate::{engine::EngineSettings, tracker::DEFAULT_BACK_REFERENCE_FIELD, Error, Result};

/// Project config file, relative to the project directory
pub const PROJECT_CONFIG_PATH: &str = ".refinery/config.toml";

/// Upper bound on the claim lease (30 days)
pub const MAX_LEASE_SECS: u64 = 30 * 24 * 60 * 60;

/// Worker identity variable
pub const WORKER_ENV: &str = "REFINERY_WORKER";

/// Worker identity when `REFINERY_WORKER` is unset
pub const DEFAULT_WORKER_ID: &str = "refinery";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefineryConfig {
    /// Directory holding records, locks, events and engine status
    pub queue_dir: PathBuf,
    /// Working tree the engine merges in
    pub repo_path: PathBuf,
    /// Rig name stamped on new records; defaults to the repository directory name
    pub rig: Option<String>,
    pub default_target: String,
    pub poll_interval_secs: u64,
    pub lease_secs: u64,
    pub max_attempts: u32,
    pub delete_merged_branches: bool,
    pub remote: Option<String>,
    pub gate: GateConfig,
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Shell commands run in order against the staged merge
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// Tracker CLI, e.g. `bd`; unset disables tracker updates
    pub command: Option<String>,
    pub back_reference_field: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: None,
            back_reference_field: DEFAULT_BACK_REFERENCE_FIELD.to_string(),
        }
    }
}

impl Default for RefineryConfig {
    fn default() -> Self {
        Self {
            queue_dir: PathBuf::from(".refinery/queue"),
            repo_path: PathBuf::from("."),
            rig: None,
            default_target: "main".to_string(),
            poll_interval_secs: 30,
            lease_secs: 600,
            max_attempts: 3,
            delete_merged_branches: true,
            remote: None,
            gate: GateConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl RefineryConfig {
    /// Load the full hierarchy for the project at `project_dir`.
    ///
    /// An explicit `config_path` must exist; the default project file is optional.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a file is unreadable or malformed, an
    /// environment override does not parse, or validation fails.
    pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Self::from_file(&resolve(project_dir, path))?,
            None => {
                let path = project_dir.join(PROJECT_CONFIG_PATH);
                if path.is_file() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };

        let config = config.with_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config.resolve_paths(project_dir))
    }

    /// Parse one TOML file; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Apply `REFINERY_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a numeric or boolean override does not parse.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("REFINERY_QUEUE_DIR") {
            self.queue_dir = PathBuf::from(v);
        }
        if let Some(v) = get("REFINERY_REPO_PATH") {
            self.repo_path = PathBuf::from(v);
        }
        if let Some(v) = get("REFINERY_RIG") {
            self.rig = Some(v);
        }
        if let Some(v) = get("REFINERY_TARGET") {
            self.default_target = v;
        }
        if let Some(v) = get("REFINERY_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_env("REFINERY_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("REFINERY_LEASE_SECS") {
            self.lease_secs = parse_env("REFINERY_LEASE_SECS", &v)?;
        }
        if let Some(v) = get("REFINERY_MAX_ATTEMPTS") {
            self.max_attempts = parse_env("REFINERY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("REFINERY_DELETE_MERGED_BRANCHES") {
            self.delete_merged_branches = parse_env("REFINERY_DELETE_MERGED_BRANCHES", &v)?;
        }
        if let Some(v) = get("REFINERY_REMOTE") {
            self.remote = Some(v);
        }
        if let Some(v) = get("REFINERY_TRACKER_COMMAND") {
            self.tracker.command = Some(v);
        }
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Config("poll_interval_secs must be greater than 0".into()));
        }
        if self.lease_secs == 0 {
            return Err(Error::Config("lease_secs must be greater than 0".into()));
        }
        if self.lease_secs > MAX_LEASE_SECS {
            return Err(Error::Config(format!(
                "lease_secs {} exceeds the maximum of {MAX_LEASE_SECS}",
                self.lease_secs
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be greater than 0".into()));
        }
        if self.default_target.trim().is_empty() {
            return Err(Error::Config("default_target must not be empty".into()));
        }
        if self.gate.commands.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::Config("gate.commands must not contain empty commands".into()));
        }
        if self.tracker.command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(Error::Config("tracker.command must not be empty when set".into()));
        }
        Ok(())
    }

    fn resolve_paths(mut self, project_dir: &Path) -> Self {
        self.queue_dir = resolve(project_dir, &self.queue_dir);
        self.repo_path = resolve(project_dir, &self.repo_path);
        self
    }

    /// Rig name for new records
    #[must_use]
    pub fn rig_name(&self) -> String {
        self.rig.clone().unwrap_or_else(|| {
            std::fs::canonicalize(&self.repo_path)
                .ok()
                .as_deref()
                .unwrap_or(self.repo_path.as_path())
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|n| !n.is_empty())
                .map_or_else(|| "default".to_string(), String::from)
        })
    }

    #[must_use]
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.lease_secs.min(MAX_LEASE_SECS)).unwrap_or(i64::from(u32::MAX)),
        )
    }

    /// Engine tunables for `worker_id`
    #[must_use]
    pub fn engine_settings(&self, worker_id: &str) -> EngineSettings {
        EngineSettings {
            worker_id: worker_id.to_string(),
            poll_interval: StdDuration::from_secs(self.poll_interval_secs),
            max_attempts: self.max_attempts,
            delete_merged_branches: self.delete_merged_branches,
            remote: self.remote.clone(),
            workdir: self.repo_path.clone(),
        }
    }
}

/// Worker id from `REFINERY_WORKER`, defaulting to `refinery`.
#[must_use]
pub fn worker_id_from_env() -> String {
    std::env::var(WORKER_ENV)
        .ok()
        .filter(|w| !w.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_WORKER_ID.to_string())
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {key}='{value}': {e}")))
}

//! Runner configuration loaded from a YAML file.
//!
//! The file path comes from `--config`, then `INFRACD_CONFIG_FILE`, then
//! `config.yml` in the current directory. Every problem found while loading or
//! validating is reported as [`RunError::ConfigValidation`].

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use super::cache::CacheConfig;
use super::hooks::TerminationHooks;
use super::metrics::MetricsConfig;
use super::paths::Paths;
use super::source::Source;
use super::state_store::StateStoreConfig;
use crate::core::duration;
use crate::core::recurrence::RecurrencePolicy;
use crate::core::types::Command;
use crate::error::{Categorize, RunError};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "INFRACD_CONFIG_FILE";

pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

const DEFAULT_WAIT: Duration = Duration::from_secs(60 * 60);

/// Per-step timeouts. Unset provisioning timeouts wait indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub terraform_init: Option<Duration>,
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub terraform_plan: Option<Duration>,
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub terraform_apply: Option<Duration>,
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub terraform_destroy: Option<Duration>,
    /// How long the `wait` command sleeps. Zero means the default.
    #[serde(deserialize_with = "duration::deserialize")]
    pub wait: Duration,
}

impl Timeouts {
    pub fn wait_duration(&self) -> Duration {
        if self.wait.is_zero() {
            DEFAULT_WAIT
        } else {
            self.wait
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            terraform_init: None,
            terraform_plan: None,
            terraform_apply: None,
            terraform_destroy: None,
            wait: DEFAULT_WAIT,
        }
    }
}

/// Backend files swapped by the `migrate_backend` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendMigration {
    /// File name inside the workspace to remove.
    pub current_backend: String,
    /// File copied into the workspace in its place.
    pub next_backend: PathBuf,
}

impl BackendMigration {
    fn is_complete(&self) -> bool {
        !self.current_backend.is_empty() && !self.next_backend.as_os_str().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub terraform_path: PathBuf,
    pub sources: Vec<Source>,
    pub timeouts: Timeouts,
    pub recurrence: Option<RecurrencePolicy>,
    /// Upper bound of a random delay before the run starts.
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub random_jitter: Option<Duration>,
    pub backend_migration: BackendMigration,
    pub command: Command,
    pub termination_hooks: TerminationHooks,
    /// Root of every persistent and ephemeral directory. Defaults to the current directory.
    pub working_directory: PathBuf,
    pub state_store: StateStoreConfig,
    pub cache: Option<CacheConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            terraform_path: PathBuf::from("terraform"),
            sources: Vec::new(),
            timeouts: Timeouts::default(),
            recurrence: None,
            random_jitter: None,
            backend_migration: BackendMigration::default(),
            command: Command::default(),
            termination_hooks: TerminationHooks::default(),
            working_directory: PathBuf::new(),
            state_store: StateStoreConfig::default(),
            cache: None,
            metrics: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.termination_hooks.validate()?;
        self.state_store.validate()?;
        let has_store = self.state_store.is_defined();
        if self.recurrence().is_some() && !has_store {
            bail!("recurrence requires a state store");
        }
        if self.cache().is_some() && !has_store {
            bail!("cache requires a state store");
        }
        if self.command == Command::MigrateBackend && !self.backend_migration.is_complete() {
            bail!(
                "command migrate_backend requires backend_migration.current_backend and backend_migration.next_backend"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.validate()?;
        }
        Ok(())
    }

    pub fn paths(&self) -> Paths {
        Paths::new(&self.working_directory)
    }

    /// The recurrence policy, if one that can gate anything is configured.
    pub fn recurrence(&self) -> Option<&RecurrencePolicy> {
        self.recurrence.as_ref().filter(|p| p.is_defined())
    }

    pub fn cache(&self) -> Option<&CacheConfig> {
        self.cache.as_ref().filter(|c| c.is_defined())
    }

    pub fn metrics(&self) -> Option<&MetricsConfig> {
        self.metrics.as_ref().filter(|m| m.is_defined())
    }

    /// Make `working_directory` absolute, defaulting to `cwd`.
    fn resolve_working_directory(&mut self, cwd: &Path) {
        if self.working_directory.as_os_str().is_empty() {
            self.working_directory = cwd.to_path_buf();
        } else if self.working_directory.is_relative() {
            self.working_directory = cwd.join(&self.working_directory);
        }
    }
}

/// Pick the configuration file: explicit flag, then environment, then default.
pub fn config_path(flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    match env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

/// Load, normalize and validate the configuration at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    load_config_inner(path).categorize(RunError::ConfigValidation)
}

fn load_config_inner(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut config = parse_config(&contents).with_context(|| format!("parse {}", path.display()))?;
    let cwd = env::current_dir().context("determine current directory")?;
    config.resolve_working_directory(&cwd);
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(contents)?)
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::settings::BatchSettings;
use crate::protocol::Subjects;
use crate::{Error, Result};

/// Upper bound on `batch.max_concurrent`.
pub const MAX_CONCURRENT_LIMIT: usize = 10;

/// Plans live under `<repo>/.semspec/changes/<slug>/tasks.json` by default.
const DEFAULT_PLANS_SUBDIR: &str = ".semspec/changes";

/// Process-wide configuration, read from `~/.dispatcher/dispatcher.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DispatcherConfig {
    /// Directory holding one subdirectory per plan slug.
    pub plans_dir: Option<String>,
    /// Directory for batch ledger records.
    pub ledger_dir: Option<String>,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub subjects: Subjects,
}

impl DispatcherConfig {
    pub fn dispatcher_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".dispatcher"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::dispatcher_dir()?.join("dispatcher.toml"))
    }

    /// Repository root used to locate plans: `DISPATCHER_REPO_PATH` or the
    /// current directory.
    pub fn repo_root() -> Result<PathBuf> {
        match std::env::var("DISPATCHER_REPO_PATH") {
            Ok(path) if !path.trim().is_empty() => Ok(expand_tilde(&path)),
            _ => Ok(std::env::current_dir()?),
        }
    }

    pub fn effective_plans_dir(&self) -> Result<PathBuf> {
        match &self.plans_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::repo_root()?.join(DEFAULT_PLANS_SUBDIR)),
        }
    }

    pub fn effective_ledger_dir(&self) -> Result<PathBuf> {
        match &self.ledger_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::dispatcher_dir()?.join("ledger")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from an explicit path; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "DispatcherConfig::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_concurrent = config.batch.max_concurrent,
            policy = %config.batch.failure_policy,
            plans_dir = ?config.plans_dir,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                debug!(dir = %parent.display(), "creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let batch = &self.batch;
        if batch.max_concurrent == 0 || batch.max_concurrent > MAX_CONCURRENT_LIMIT {
            return Err(Error::Config(format!(
                "batch.max_concurrent must be between 1 and {}, got {}",
                MAX_CONCURRENT_LIMIT, batch.max_concurrent
            )));
        }
        if batch.context_timeout_secs == 0 {
            return Err(Error::Config("batch.context_timeout_secs must be positive".to_string()));
        }
        if batch.execution_timeout_secs == 0 {
            return Err(Error::Config("batch.execution_timeout_secs must be positive".to_string()));
        }
        if batch.context_max_attempts == 0 {
            return Err(Error::Config("batch.context_max_attempts must be positive".to_string()));
        }
        if let Some(field) = self.subjects.is_empty_field() {
            return Err(Error::Config(format!("subjects.{} must not be empty", field)));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

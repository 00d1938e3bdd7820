use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{clog_debug, Error, Result};

pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 4;
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Construction-time settings for an [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker pool size; also the upper bound on a single wave.
    pub max_parallel_tasks: usize,
    /// How many signals the bus keeps for inspection.
    pub history_capacity: usize,
    #[serde(default)]
    pub debug: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: DEFAULT_MAX_PARALLEL_TASKS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            debug: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_workers(max_parallel_tasks: usize) -> Self {
        Self {
            max_parallel_tasks,
            ..Self::default()
        }
    }

    pub fn conductor_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(".conductor"))
            .ok_or_else(|| Error::InvalidConfig("no home directory".to_string()))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        clog_debug!("OrchestratorConfig::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml_str(&fs::read_to_string(path)?)?;
        clog_debug!(
            "Config loaded: max_parallel_tasks={}, history_capacity={}, debug={}",
            config.max_parallel_tasks,
            config.history_capacity,
            config.debug
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_tasks == 0 {
            return Err(Error::InvalidConfig(
                "max_parallel_tasks must be at least 1".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(Error::InvalidConfig(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

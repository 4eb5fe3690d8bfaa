use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::health::HealthPolicy;
use crate::deploy::lock::LockPolicy;
use crate::deploy::model::DeployMode;
use crate::descriptor::routing::RoutingConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Contents of `relevo.toml`. Every field has a default, so an empty or
/// missing file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevoConfig {
    /// Parent of the per-project working trees.
    #[serde(default = "default_workspace_dir", alias = "workspace")]
    pub workspace_dir: PathBuf,
    /// Parent of the per-generation descriptors.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Also append log records to this file.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub mode: DeployMode,
    /// What a second deployment of a busy project does.
    #[serde(default, alias = "on-busy", alias = "on_busy")]
    pub lock: LockPolicy,
    /// Descriptor file name; searched among the usual compose names when unset.
    #[serde(default)]
    pub descriptor: Option<String>,
    /// Seconds both generations serve traffic before the old one is retired.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    #[serde(default)]
    pub health: HealthPolicy,
    #[serde(default)]
    pub routing: RoutingConfig,
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("data/repos")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("data/generations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_settle_secs() -> u64 {
    10
}

impl Default for RelevoConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            state_dir: default_state_dir(),
            log_file: None,
            log_level: default_log_level(),
            mode: DeployMode::default(),
            lock: LockPolicy::default(),
            descriptor: None,
            settle_secs: default_settle_secs(),
            health: HealthPolicy::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl RelevoConfig {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(config) => Self::try_init_from_string(&config),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn workdir(&self, project: &str) -> PathBuf {
        self.workspace_dir.join(project)
    }
}

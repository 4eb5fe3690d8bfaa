//! Typed access to the container engine.
//!
//! Everything the deployment pipeline needs from the engine goes through the
//! [`ContainerEngine`] trait, which hands back typed records instead of
//! tabular CLI output. [`docker::DockerEngine`] is the production
//! implementation.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub mod docker;
#[cfg(test)]
pub mod fake;

pub type ContainerId = String;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("docker compose exited with {status:?}: {stderr}")]
    ComposeFailed { status: Option<i32>, stderr: String },
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),
}

/// Selects containers by id and/or labels.
///
/// Labels are written as `key=value` (exact match) or `key` (presence),
/// the same syntax the engine's own label filter understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub id: Option<ContainerId>,
    pub labels: Vec<String>,
    pub include_stopped: bool,
}

impl ContainerFilter {
    pub fn label(key: &str, value: &str) -> Self {
        Self::default().and_label(key, value)
    }

    pub fn id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn and_label(mut self, key: &str, value: &str) -> Self {
        self.labels.push(format!("{key}={value}"));
        self
    }

    pub fn include_stopped(mut self) -> Self {
        self.include_stopped = true;
        self
    }

    /// Evaluate the filter against a container's id, labels and state.
    pub fn matches(
        &self,
        id: &str,
        labels: &HashMap<String, String>,
        state: ContainerState,
    ) -> bool {
        if !self.include_stopped && !state.is_running() {
            return false;
        }
        if let Some(wanted) = &self.id {
            if !id.starts_with(wanted.as_str()) {
                return false;
            }
        }
        self.labels.iter().all(|expr| match expr.split_once('=') {
            Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
            None => labels.contains_key(expr),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Removing,
    Unknown,
}

impl ContainerState {
    /// Whether the engine lists the container without `--all`.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ContainerState::Running | ContainerState::Paused | ContainerState::Restarting
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    /// The image or descriptor declares no health check.
    NoHealthcheck,
    Starting,
    Healthy,
    /// Carries the output of the most recent failing probe, if any.
    Unhealthy(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub health: HealthState,
}

/// One `docker compose up` for a single generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeInvocation {
    /// Compose project name, unique per generation.
    pub project_name: String,
    /// Directory relative paths in the descriptor resolve against.
    pub project_directory: PathBuf,
    pub file: PathBuf,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Fails when the daemon or the tooling around it is not usable.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Build images and start every service of the descriptor.
    async fn compose_up(&self, invocation: &ComposeInvocation) -> Result<(), EngineError>;

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError>;

    /// `Ok(None)` when the container does not exist.
    async fn inspect(&self, id: &str) -> Result<Option<ContainerInfo>, EngineError>;

    /// Last `tail` lines of combined stdout/stderr.
    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>, EngineError>;

    /// Run a command inside the container and return its exit code.
    async fn exec(&self, id: &str, cmd: &[&str]) -> Result<i64, EngineError>;

    /// Stopping a missing or already stopped container succeeds.
    async fn stop(&self, id: &str) -> Result<(), EngineError>;

    /// Removing a missing container succeeds.
    async fn remove(&self, id: &str) -> Result<(), EngineError>;

    /// Remove every network carrying `label` (`key=value`), returning how many
    /// were removed.
    async fn remove_networks(&self, label: &str) -> Result<usize, EngineError>;
}

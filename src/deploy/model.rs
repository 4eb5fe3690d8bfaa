use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::DeploymentError;
use crate::engine::ContainerId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum DeployMode {
    /// Start the new generation next to the old one and retire the old one
    /// only after the new one is healthy.
    #[default]
    #[serde(alias = "blue_green", alias = "bluegreen")]
    BlueGreen,
    /// Retire the old generation before starting the new one.
    #[serde(alias = "recreate")]
    Simple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Init,
    Syncing,
    Transforming,
    Building,
    HealthChecking,
    Switching,
    CleaningUp,
    Done,
    Failed,
}

impl DeploymentStatus {
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Init, Syncing)
                | (Syncing, Transforming)
                | (Transforming, Building)
                | (Building, HealthChecking)
                | (HealthChecking, Switching)
                | (Switching, CleaningUp)
                | (CleaningUp, Done)
                | (Init | Syncing | Transforming | Building | HealthChecking | Switching, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Done | DeploymentStatus::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentStatus::Init => "init",
            DeploymentStatus::Syncing => "syncing",
            DeploymentStatus::Transforming => "transforming",
            DeploymentStatus::Building => "building",
            DeploymentStatus::HealthChecking => "health_checking",
            DeploymentStatus::Switching => "switching",
            DeploymentStatus::CleaningUp => "cleaning_up",
            DeploymentStatus::Done => "done",
            DeploymentStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One execution of the pipeline for one project.
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub id: Uuid,
    pub project: String,
    pub repo_url: String,
    pub mode: DeployMode,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub revision: Option<String>,
    pub error: Option<String>,
    pub old_generation: Vec<ContainerId>,
    pub new_generation: Vec<ContainerId>,
}

impl Deployment {
    pub fn new(project: &str, repo_url: &str, mode: DeployMode) -> Self {
        Self {
            id: Uuid::now_v7(),
            project: project.to_string(),
            repo_url: repo_url.to_string(),
            mode,
            status: DeploymentStatus::Init,
            started_at: Utc::now(),
            finished_at: None,
            revision: None,
            error: None,
            old_generation: Vec::new(),
            new_generation: Vec::new(),
        }
    }

    pub fn transition(&mut self, next: DeploymentStatus) -> Result<(), DeploymentError> {
        if !self.status.can_transition_to(next) {
            return Err(DeploymentError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        log::info!("Deployment {} of {}: {} -> {}", self.id, self.project, self.status, next);
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record `error` and move to `Failed`.
    pub fn fail(&mut self, error: &DeploymentError) {
        self.error = Some(error.to_string());
        if let Err(e) = self.transition(DeploymentStatus::Failed) {
            log::error!("Deployment {}: {e}", self.id);
            self.status = DeploymentStatus::Failed;
            self.finished_at = Some(Utc::now());
        }
    }
}

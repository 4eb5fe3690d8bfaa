use thiserror::Error;

use super::health::HealthReport;
use super::launcher::BuildError;
use super::model::DeploymentStatus;
use crate::descriptor::TransformError;
use crate::vcs::SyncError;

#[derive(Error, Debug)]
pub enum DeploymentError {
    #[error("Prerequisite missing: {0}")]
    PrerequisiteMissing(String),
    #[error("A deployment of {0} is already in progress")]
    ProjectBusy(String),
    #[error("Repository sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error("Descriptor transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("Build failed: {0}")]
    Build(#[from] BuildError),
    #[error("Health check failed: {0}")]
    HealthCheck(HealthReport),
    #[error("Deployment cancelled")]
    Cancelled,
    #[error("Illegal state transition from {from} to {to}")]
    IllegalTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeploymentError {
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentError::PrerequisiteMissing(_) => "PrerequisiteMissing",
            DeploymentError::ProjectBusy(_) => "ProjectBusy",
            DeploymentError::Sync(_) => "SyncFailure",
            DeploymentError::Transform(_) => "TransformFailure",
            DeploymentError::Build(_) => "BuildFailure",
            DeploymentError::HealthCheck(_) => "HealthCheckFailure",
            DeploymentError::Cancelled => "Cancelled",
            DeploymentError::IllegalTransition { .. } | DeploymentError::Io(_) => "Internal",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            DeploymentError::PrerequisiteMissing(_) => 2,
            DeploymentError::ProjectBusy(_) => 3,
            DeploymentError::Sync(_) => 4,
            DeploymentError::Transform(_) => 5,
            DeploymentError::Build(_) => 6,
            DeploymentError::HealthCheck(_) => 7,
            DeploymentError::Cancelled => 130,
            DeploymentError::IllegalTransition { .. } | DeploymentError::Io(_) => 1,
        }
    }
}

//! Builds and starts one generation.

use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use super::cleanup::CleanupStack;
use crate::descriptor::labels::DEPLOYMENT_LABEL;
use crate::engine::{ComposeInvocation, ContainerEngine, ContainerFilter, ContainerId, EngineError};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No containers carry relevo.deployment={0} after starting the services")]
    NoContainers(Uuid),
}

/// The set of containers started by one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub deployment_id: Uuid,
    pub project: String,
    /// Compose project name, distinct for every generation so that starting
    /// one never recreates the containers of another.
    pub compose_project: String,
    pub descriptor_path: PathBuf,
    pub containers: Vec<ContainerId>,
}

impl Generation {
    pub fn new(project: &str, deployment_id: Uuid, state_dir: &Path) -> Self {
        Self {
            deployment_id,
            project: project.to_string(),
            compose_project: compose_project_name(project, deployment_id),
            descriptor_path: descriptor_path(state_dir, project, deployment_id),
            containers: Vec::new(),
        }
    }
}

pub fn compose_project_name(project: &str, deployment_id: Uuid) -> String {
    let simple = deployment_id.simple().to_string();
    // The tail of a v7 id is random; its head is a timestamp.
    format!("{project}-{}", &simple[simple.len() - 12..])
}

pub fn descriptor_path(state_dir: &Path, project: &str, deployment_id: Uuid) -> PathBuf {
    state_dir
        .join(project)
        .join(format!("{deployment_id}.compose.yml"))
}

/// Write the generation's descriptor, build and start its services and
/// discover the resulting containers.
///
/// The generation is pushed onto `cleanup` before anything is created, so a
/// failure at any point leaves nothing behind once the stack is unwound.
pub async fn launch(
    engine: &dyn ContainerEngine,
    generation: &mut Generation,
    descriptor: &str,
    workdir: &Path,
    cleanup: &mut CleanupStack,
) -> Result<(), BuildError> {
    cleanup.push(generation.clone());
    if let Some(parent) = generation.descriptor_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&generation.descriptor_path, descriptor).await?;
    log::debug!("Wrote descriptor {:?}", generation.descriptor_path);

    log::info!(
        "Building and starting {} from {workdir:?}",
        generation.compose_project
    );
    engine
        .compose_up(&ComposeInvocation {
            project_name: generation.compose_project.clone(),
            project_directory: workdir.to_path_buf(),
            file: generation.descriptor_path.clone(),
        })
        .await?;

    let containers = discover(engine, generation.deployment_id).await?;
    if containers.is_empty() {
        return Err(BuildError::NoContainers(generation.deployment_id));
    }
    log::info!(
        "Generation {} has {} container(s): {containers:?}",
        generation.compose_project,
        containers.len()
    );
    generation.containers = containers;
    Ok(())
}

/// Every container, running or not, labelled with `deployment_id`.
pub async fn discover(
    engine: &dyn ContainerEngine,
    deployment_id: Uuid,
) -> Result<Vec<ContainerId>, EngineError> {
    let filter =
        ContainerFilter::label(DEPLOYMENT_LABEL, &deployment_id.to_string()).include_stopped();
    Ok(engine
        .list_containers(&filter)
        .await?
        .into_iter()
        .map(|c| c.id)
        .collect())
}

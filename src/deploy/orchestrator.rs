//! Runs the deployment pipeline for one project.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::cleanup::{self, CleanupStack};
use super::error::DeploymentError;
use super::health::HealthVerifier;
use super::launcher::{self, Generation};
use super::lock::ProjectLocks;
use super::model::{DeployMode, Deployment, DeploymentStatus};
use super::switch;
use crate::config::RelevoConfig;
use crate::descriptor::labels::{DEPLOYMENT_LABEL, PROJECT_LABEL};
use crate::descriptor::{TransformError, find_descriptor, transform};
use crate::engine::{ContainerEngine, ContainerFilter, ContainerId};
use crate::vcs::{self, VersionControl};

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub repo_url: String,
    /// Derived from the repository URL when unset.
    pub project: Option<String>,
    pub mode: DeployMode,
}

pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    vcs: Arc<dyn VersionControl>,
    config: Arc<RelevoConfig>,
    locks: Arc<ProjectLocks>,
}

/// Race `fut` against cancellation.
async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, DeploymentError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeploymentError::Cancelled),
        out = fut => Ok(out),
    }
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        vcs: Arc<dyn VersionControl>,
        config: Arc<RelevoConfig>,
        locks: Arc<ProjectLocks>,
    ) -> Self {
        Self {
            engine,
            vcs,
            config,
            locks,
        }
    }

    /// Verify that the engine, compose and git are usable.
    pub async fn check_prerequisites(&self) -> Result<(), DeploymentError> {
        self.engine
            .ping()
            .await
            .map_err(|e| DeploymentError::PrerequisiteMissing(e.to_string()))?;
        self.vcs
            .check()
            .await
            .map_err(|e| DeploymentError::PrerequisiteMissing(e.to_string()))?;
        Ok(())
    }

    /// Deploy the latest revision of a repository.
    ///
    /// On success the new generation is the only one left for the project.
    /// On failure or cancellation everything the run created is removed and
    /// the previous generation is left untouched.
    pub async fn run(
        &self,
        request: DeployRequest,
        cancel: CancellationToken,
    ) -> Result<Deployment, DeploymentError> {
        let project = match request.project {
            Some(project) => vcs::validate_project_name(&project)?.to_string(),
            None => vcs::project_name(&request.repo_url)?,
        };
        let mut deployment = Deployment::new(&project, &request.repo_url, request.mode);
        log::info!(
            "Starting deployment {} of {project} from {} ({:?})",
            deployment.id,
            deployment.repo_url,
            deployment.mode
        );

        let result = self.execute(&mut deployment, &cancel).await;
        if let Err(e) = &result {
            deployment.fail(e);
            log::error!("Deployment {} of {project} failed: {e}", deployment.id);
        }
        match serde_json::to_string(&deployment) {
            Ok(record) => log::info!("Deployment record: {record}"),
            Err(e) => log::warn!("Could not serialize deployment record: {e}"),
        }
        result.map(|_| deployment)
    }

    async fn execute(
        &self,
        deployment: &mut Deployment,
        cancel: &CancellationToken,
    ) -> Result<(), DeploymentError> {
        self.check_prerequisites().await?;
        let _guard = cancellable(
            cancel,
            self.locks.acquire(&deployment.project, self.config.lock),
        )
        .await??;

        let mut cleanup = CleanupStack::default();
        let result = self.phases(deployment, &mut cleanup, cancel).await;
        if result.is_err() && !cleanup.is_empty() {
            let warnings = cleanup.unwind(self.engine.as_ref()).await;
            cleanup::log_warnings(&warnings);
        }
        result
    }

    async fn phases(
        &self,
        deployment: &mut Deployment,
        cleanup: &mut CleanupStack,
        cancel: &CancellationToken,
    ) -> Result<(), DeploymentError> {
        let engine = self.engine.as_ref();
        let project = deployment.project.clone();
        let workdir = self.config.workdir(&project);

        deployment.transition(DeploymentStatus::Syncing)?;
        let outcome = cancellable(
            cancel,
            vcs::sync(self.vcs.as_ref(), &deployment.repo_url, &workdir),
        )
        .await??;
        if outcome.fresh_clone {
            log::info!("Cloned a fresh working tree for {project}");
        }
        deployment.revision = Some(outcome.revision);

        deployment.transition(DeploymentStatus::Transforming)?;
        let source = find_descriptor(&workdir, self.config.descriptor.as_deref())?;
        let text = cancellable(cancel, tokio::fs::read_to_string(&source))
            .await?
            .map_err(TransformError::Io)?;
        let descriptor = transform(&text, &project, deployment.id, &self.config.routing)?;
        deployment.old_generation = self.live_containers(&project, deployment).await;

        deployment.transition(DeploymentStatus::Building)?;
        if deployment.mode == DeployMode::Simple {
            self.retire(&project, deployment).await;
        }
        let mut generation = Generation::new(&project, deployment.id, &self.config.state_dir);
        cancellable(
            cancel,
            launcher::launch(engine, &mut generation, &descriptor, &workdir, cleanup),
        )
        .await??;
        deployment.new_generation = generation.containers.clone();

        deployment.transition(DeploymentStatus::HealthChecking)?;
        let verifier = HealthVerifier::new(engine, self.config.health);
        let report = cancellable(cancel, verifier.verify(&generation.containers)).await?;
        if !report.all_passed() {
            for (id, diagnosis) in report.failures() {
                log::error!("Container {id} failed verification: {}", diagnosis.reason);
                for line in &diagnosis.logs {
                    log::error!("  {id} | {line}");
                }
            }
            return Err(DeploymentError::HealthCheck(report));
        }

        deployment.transition(DeploymentStatus::Switching)?;
        let settle = match deployment.mode {
            DeployMode::BlueGreen => self.config.settle(),
            DeployMode::Simple => std::time::Duration::ZERO,
        };
        switch::confirm(engine, &generation, self.config.routing.enabled, settle, cancel).await?;

        // From here on the new generation is the one serving traffic.
        deployment.transition(DeploymentStatus::CleaningUp)?;
        cleanup.disarm();
        self.retire(&project, deployment).await;

        deployment.transition(DeploymentStatus::Done)?;
        log::info!(
            "Deployed {project} at {} as {}",
            deployment.revision.as_deref().unwrap_or("unknown revision"),
            generation.compose_project
        );
        Ok(())
    }

    /// Containers of the project outside this deployment, stopped ones
    /// included, as retirement will remove them all.
    async fn live_containers(&self, project: &str, deployment: &Deployment) -> Vec<ContainerId> {
        let keep = deployment.id.to_string();
        let filter = ContainerFilter::label(PROJECT_LABEL, project).include_stopped();
        match self.engine.list_containers(&filter).await
        {
            Ok(containers) => containers
                .into_iter()
                .filter(|c| c.labels.get(DEPLOYMENT_LABEL) != Some(&keep))
                .map(|c| c.id)
                .collect(),
            Err(e) => {
                log::warn!("Could not list the containers of {project}: {e}");
                Vec::new()
            }
        }
    }

    async fn retire(&self, project: &str, deployment: &Deployment) {
        let retirement = cleanup::retire(
            self.engine.as_ref(),
            project,
            deployment.id,
            &self.config.state_dir,
        )
        .await;
        if !retirement.retired.is_empty() {
            log::info!(
                "Retired {} container(s) of {project}",
                retirement.retired.len()
            );
        }
        cleanup::log_warnings(&retirement.warnings);
    }
}

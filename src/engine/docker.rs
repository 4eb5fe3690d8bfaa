//! Docker engine client using bollard.
//!
//! All container queries go through the Docker API. Only the
//! build-and-start step shells out to `docker compose`, which has no API
//! counterpart.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use bollard::Docker;
use bollard::exec::StartExecResults;
use bollard::models::{
    ContainerStateStatusEnum, ContainerSummaryStateEnum, ExecConfig, HealthStatusEnum,
};
use bollard::query_parameters::{
    InspectContainerOptions, InspectContainerOptionsBuilder, ListContainersOptions,
    ListContainersOptionsBuilder, ListNetworksOptions, ListNetworksOptionsBuilder, LogsOptions,
    LogsOptionsBuilder, RemoveContainerOptions, RemoveContainerOptionsBuilder,
    StopContainerOptions, StopContainerOptionsBuilder,
};
use futures_util::StreamExt;
use tokio::process::Command;

use super::{
    ComposeInvocation, ContainerEngine, ContainerFilter, ContainerInfo, ContainerState,
    ContainerSummary, EngineError, HealthState,
};

/// Seconds the engine waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: i32 = 10;

#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the default method for the platform
    /// (Unix socket on Linux/macOS, named pipe on Windows).
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if *status_code == code
    )
}

fn summary_state(state: Option<ContainerSummaryStateEnum>) -> ContainerState {
    match state {
        Some(ContainerSummaryStateEnum::CREATED) => ContainerState::Created,
        Some(ContainerSummaryStateEnum::RUNNING) => ContainerState::Running,
        Some(ContainerSummaryStateEnum::PAUSED) => ContainerState::Paused,
        Some(ContainerSummaryStateEnum::RESTARTING) => ContainerState::Restarting,
        Some(ContainerSummaryStateEnum::EXITED) => ContainerState::Exited,
        Some(ContainerSummaryStateEnum::DEAD) => ContainerState::Dead,
        Some(ContainerSummaryStateEnum::REMOVING) => ContainerState::Removing,
        Some(ContainerSummaryStateEnum::EMPTY) | None => ContainerState::Unknown,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Unavailable(format!("docker daemon: {e}")))?;

        let status = Command::new("docker")
            .args(["compose", "version"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| EngineError::Unavailable(format!("docker CLI: {e}")))?;
        if !status.success() {
            return Err(EngineError::Unavailable(
                "the docker compose plugin is not installed".to_string(),
            ));
        }
        Ok(())
    }

    async fn compose_up(&self, invocation: &ComposeInvocation) -> Result<(), EngineError> {
        log::info!(
            "Composing {} from {:?}...",
            invocation.project_name,
            invocation.file
        );
        let output = Command::new("docker")
            .arg("compose")
            .args(["--project-name", &invocation.project_name])
            .arg("--project-directory")
            .arg(&invocation.project_directory)
            .arg("--file")
            .arg(&invocation.file)
            .args(["up", "--detach", "--build"])
            .current_dir(&invocation.project_directory)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            log::info!("Services for {} are up", invocation.project_name);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        log::error!(
            "docker compose up for {} exited with {:?}",
            invocation.project_name,
            output.status.code()
        );
        Err(EngineError::ComposeFailed {
            status: output.status.code(),
            stderr,
        })
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut filters: HashMap<&str, Vec<String>> = HashMap::new();
        if !filter.labels.is_empty() {
            filters.insert("label", filter.labels.clone());
        }
        if let Some(id) = &filter.id {
            filters.insert("id", vec![id.clone()]);
        }

        let options: ListContainersOptions = ListContainersOptionsBuilder::new()
            .all(filter.include_stopped)
            .filters(&filters)
            .build();

        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(ContainerSummary {
                    id,
                    name,
                    labels: c.labels.unwrap_or_default(),
                    state: summary_state(c.state),
                })
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerInfo>, EngineError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        let info = match self.docker.inspect_container(id, Some(options)).await {
            Ok(info) => info,
            Err(e) if is_status(&e, 404) => return Ok(None),
            Err(e) => return Err(EngineError::DockerApi(e)),
        };

        let labels = info
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default();
        let state = info.state.unwrap_or_default();
        let health = match state.health {
            Some(health) => match health.status {
                Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
                Some(HealthStatusEnum::STARTING) => HealthState::Starting,
                Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy(
                    health
                        .log
                        .and_then(|probes| probes.into_iter().last())
                        .and_then(|probe| probe.output)
                        .map(|output| output.trim().to_string()),
                ),
                Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => {
                    HealthState::NoHealthcheck
                }
            },
            None => HealthState::NoHealthcheck,
        };

        Ok(Some(ContainerInfo {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            labels,
            running: state.running.unwrap_or(false),
            // A created container has never run, so its exit code means nothing.
            exit_code: match state.status {
                Some(ContainerStateStatusEnum::CREATED) => None,
                _ => state.exit_code,
            },
            health,
        }))
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>, EngineError> {
        let options: LogsOptions = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail.to_string())
            .build();

        let mut stream = self.docker.logs(id, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            lines.extend(chunk.to_string().lines().map(str::to_string));
        }

        let skip = lines.len().saturating_sub(tail);
        Ok(lines.split_off(skip))
    }

    async fn exec(&self, id: &str, cmd: &[&str]) -> Result<i64, EngineError> {
        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd.iter().map(|c| c.to_string()).collect()),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, config).await?;

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                if let Ok(chunk) = chunk {
                    log::debug!("exec {id}: {}", chunk.to_string().trim_end());
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn stop(&self, id: &str) -> Result<(), EngineError> {
        log::info!("Stopping container: {id}");
        let options: StopContainerOptions =
            StopContainerOptionsBuilder::new().t(STOP_TIMEOUT_SECS).build();

        match self.docker.stop_container(id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {id} stopped successfully");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                log::warn!("Container {id} not found, skipping stop");
                Ok(())
            }
            Err(e) if is_status(&e, 304) => {
                log::info!("Container {id} already stopped");
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to stop container {id}: {e}");
                Err(EngineError::DockerApi(e))
            }
        }
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        log::info!("Removing container: {id}");
        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(true).build();

        match self.docker.remove_container(id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {id} removed successfully");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                log::info!("Container {id} not found, skipping removal");
                Ok(())
            }
            // Removal already in progress.
            Err(e) if is_status(&e, 409) => {
                log::info!("Container {id} is already being removed");
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to remove container {id}: {e}");
                Err(EngineError::DockerApi(e))
            }
        }
    }

    async fn remove_networks(&self, label: &str) -> Result<usize, EngineError> {
        let mut filters: HashMap<&str, Vec<&str>> = HashMap::new();
        filters.insert("label", vec![label]);
        let options: ListNetworksOptions = ListNetworksOptionsBuilder::new()
            .filters(&filters)
            .build();

        let mut removed = 0;
        for network in self.docker.list_networks(Some(options)).await? {
            let Some(name) = network.name else { continue };
            match self.docker.remove_network(&name).await {
                Ok(_) => {
                    log::info!("Network {name} removed");
                    removed += 1;
                }
                Err(e) if is_status(&e, 404) => {}
                Err(e) => return Err(EngineError::DockerApi(e)),
            }
        }
        Ok(removed)
    }
}

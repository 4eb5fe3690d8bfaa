use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cli::Command;
use crate::config::RelevoConfig;
use crate::deploy::lock::ProjectLocks;
use crate::deploy::{DeployRequest, DeploymentError, Orchestrator};
use crate::engine::docker::DockerEngine;
use crate::vcs::git::GitCli;

mod cli;
mod config;
mod deploy;
mod descriptor;
mod engine;
mod logging;
mod signals;
mod vcs;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::get_cli_args();

    let config = match RelevoConfig::try_init(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Unable to load {:?}: {e}", args.config);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&config.log_level, config.log_file.as_deref()) {
        eprintln!("Unable to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let engine = match DockerEngine::connect() {
        Ok(engine) => engine,
        Err(e) => {
            let e = DeploymentError::PrerequisiteMissing(e.to_string());
            log::error!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };
    let default_mode = config.mode;
    let orchestrator = Orchestrator::new(
        Arc::new(engine),
        Arc::new(GitCli),
        Arc::new(config),
        Arc::new(ProjectLocks::new()),
    );

    match &args.command {
        Command::Check => match orchestrator.check_prerequisites().await {
            Ok(()) => {
                log::info!("docker, docker compose and git are available");
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("{e}");
                ExitCode::from(e.exit_code())
            }
        },
        Command::Deploy {
            repo_url,
            mode,
            project,
        } => {
            let cancel = CancellationToken::new();
            if let Err(e) = signals::cancel_on_signal(cancel.clone()) {
                log::warn!("Unable to listen for signals: {e}");
            }
            let request = DeployRequest {
                repo_url: repo_url.clone(),
                project: project.clone(),
                mode: mode.unwrap_or(default_mode),
            };
            match orchestrator.run(request, cancel).await {
                Ok(deployment) => {
                    let summary = serde_json::json!({
                        "container_id": deployment.new_generation.first(),
                        "deployment_id": deployment.id,
                        "project": deployment.project,
                    });
                    println!("{summary}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    log::error!("{}: {e}", e.kind());
                    ExitCode::from(e.exit_code())
                }
            }
        }
    }
}

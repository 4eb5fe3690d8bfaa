//! Hand-over of traffic to a verified generation.
//!
//! The proxy picks up the new containers by itself from their labels, so the
//! switch only confirms those labels are present and gives the proxy time to
//! register the new backends before the old ones disappear.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::error::DeploymentError;
use super::launcher::Generation;
use crate::descriptor::labels::{DEPLOYMENT_LABEL, PROJECT_LABEL};
use crate::engine::ContainerEngine;

const ROUTING_LABEL: &str = "traefik.enable";

/// Required labels absent from the containers of `generation`.
async fn missing_labels(
    engine: &dyn ContainerEngine,
    generation: &Generation,
    routing_enabled: bool,
) -> Vec<(String, &'static str)> {
    let deployment = generation.deployment_id.to_string();
    let mut missing = Vec::new();
    for id in &generation.containers {
        let info = match engine.inspect(id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                log::warn!("Container {id} disappeared before the switch");
                continue;
            }
            Err(e) => {
                log::warn!("Could not inspect {id} before the switch: {e}");
                continue;
            }
        };
        if info.labels.get(PROJECT_LABEL) != Some(&generation.project) {
            missing.push((id.clone(), PROJECT_LABEL));
        }
        if info.labels.get(DEPLOYMENT_LABEL) != Some(&deployment) {
            missing.push((id.clone(), DEPLOYMENT_LABEL));
        }
        if routing_enabled && !info.labels.contains_key(ROUTING_LABEL) {
            missing.push((id.clone(), ROUTING_LABEL));
        }
    }
    missing
}

/// Confirm the generation is routable and wait `settle` for the proxy.
///
/// Missing labels are reported but never fail the deployment. Only
/// cancellation during the wait does.
pub async fn confirm(
    engine: &dyn ContainerEngine,
    generation: &Generation,
    routing_enabled: bool,
    settle: Duration,
    cancel: &CancellationToken,
) -> Result<(), DeploymentError> {
    for (id, label) in missing_labels(engine, generation, routing_enabled).await {
        log::warn!("Container {id} is missing the {label} label and may not receive traffic");
    }

    if settle.is_zero() {
        return Ok(());
    }
    log::info!(
        "Waiting {}s for the proxy to pick up {}",
        settle.as_secs(),
        generation.compose_project
    );
    tokio::select! {
        _ = cancel.cancelled() => Err(DeploymentError::Cancelled),
        _ = tokio::time::sleep(settle) => Ok(()),
    }
}

//! One orchestration per project at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use super::error::DeploymentError;

/// What to do when a project already has a deployment in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockPolicy {
    #[default]
    #[serde(alias = "fail")]
    Reject,
    #[serde(alias = "wait")]
    Queue,
}

/// Held for the whole run; dropping it releases the project.
pub type ProjectGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct ProjectLocks {
    table: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, project: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.entry(project.to_string()).or_default().clone()
    }

    pub async fn acquire(
        &self,
        project: &str,
        policy: LockPolicy,
    ) -> Result<ProjectGuard, DeploymentError> {
        let lock = self.lock_for(project);
        match policy {
            LockPolicy::Reject => lock
                .try_lock_owned()
                .map_err(|_| DeploymentError::ProjectBusy(project.to_string())),
            LockPolicy::Queue => match lock.clone().try_lock_owned() {
                Ok(guard) => Ok(guard),
                Err(_) => {
                    log::info!("Waiting for the running deployment of {project} to finish");
                    Ok(lock.lock_owned().await)
                }
            },
        }
    }
}

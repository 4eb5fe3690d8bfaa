//! Health verification of a freshly started generation.
//!
//! Each container is polled on its own budget of attempts. A container that
//! crashes or reports an unhealthy health check fails immediately; one that
//! keeps starting, or never shows up, fails once the budget is spent.

use std::fmt;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::descriptor::labels::{DISABLE_HEALTHCHECK_LABEL, is_truthy};
use crate::engine::{ContainerEngine, ContainerFilter, ContainerId, ContainerInfo, HealthState};

/// Polling budget for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_interval_secs", alias = "interval")]
    pub interval_secs: u64,
    /// Log lines kept in a failure diagnosis.
    #[serde(default = "default_log_tail")]
    pub log_tail: usize,
}

fn default_attempts() -> u32 {
    30
}

fn default_interval_secs() -> u64 {
    5
}

fn default_log_tail() -> usize {
    50
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            interval_secs: default_interval_secs(),
            log_tail: default_log_tail(),
        }
    }
}

impl HealthPolicy {
    /// At least one inspection is always made.
    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Crashed,
    Unhealthy,
    NeverStarted,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub reason: String,
    pub classification: Classification,
    pub exit_code: Option<i64>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// `attempts` is 0 when verification was disabled for the container.
    Pass { attempts: u32 },
    Fail(Diagnosis),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// In the order the containers were given.
    pub outcomes: Vec<(ContainerId, HealthOutcome)>,
}

impl HealthReport {
    pub fn all_passed(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, HealthOutcome::Pass { .. }))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ContainerId, &Diagnosis)> {
        self.outcomes.iter().filter_map(|(id, outcome)| match outcome {
            HealthOutcome::Fail(diagnosis) => Some((id, diagnosis)),
            HealthOutcome::Pass { .. } => None,
        })
    }

    pub fn get(&self, id: &str) -> Option<&HealthOutcome> {
        self.outcomes
            .iter()
            .find(|(candidate, _)| candidate == id)
            .map(|(_, outcome)| outcome)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures: Vec<String> = self
            .failures()
            .map(|(id, diagnosis)| match diagnosis.exit_code {
                Some(code) => format!("{id}: {} (exit code {code})", diagnosis.reason),
                None => format!("{id}: {}", diagnosis.reason),
            })
            .collect();
        write!(
            f,
            "{} of {} container(s) failed: {}",
            failures.len(),
            self.outcomes.len(),
            failures.join("; ")
        )
    }
}

enum Attempt {
    Pass,
    Fail(Diagnosis),
    Retry,
}

pub struct HealthVerifier<'a> {
    engine: &'a dyn ContainerEngine,
    policy: HealthPolicy,
}

impl<'a> HealthVerifier<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, policy: HealthPolicy) -> Self {
        Self { engine, policy }
    }

    /// Verify every container concurrently.
    pub async fn verify(&self, ids: &[ContainerId]) -> HealthReport {
        let outcomes = join_all(ids.iter().map(|id| self.verify_one(id))).await;
        HealthReport {
            outcomes: ids.iter().cloned().zip(outcomes).collect(),
        }
    }

    async fn is_disabled(&self, id: &str) -> bool {
        let filter = ContainerFilter::id(id).include_stopped();
        match self.engine.list_containers(&filter).await {
            Ok(containers) => containers.iter().any(|c| {
                c.labels
                    .get(DISABLE_HEALTHCHECK_LABEL)
                    .is_some_and(|value| is_truthy(value))
            }),
            Err(e) => {
                log::warn!("Could not read the labels of {id}: {e}");
                false
            }
        }
    }

    pub async fn verify_one(&self, id: &str) -> HealthOutcome {
        if self.is_disabled(id).await {
            log::info!("Health verification disabled for {id}");
            return HealthOutcome::Pass { attempts: 0 };
        }

        let attempts = self.policy.attempts();
        let mut seen = false;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.interval()).await;
            }
            match self.engine.inspect(id).await {
                Ok(Some(info)) => {
                    seen = true;
                    match self.check(&info).await {
                        Attempt::Pass => {
                            log::info!(
                                "{} ({id}) is healthy after {attempt} attempt(s)",
                                info.name
                            );
                            return HealthOutcome::Pass { attempts: attempt };
                        }
                        Attempt::Fail(diagnosis) => {
                            log::error!("{} ({id}): {}", info.name, diagnosis.reason);
                            return HealthOutcome::Fail(diagnosis);
                        }
                        Attempt::Retry => {
                            log::debug!(
                                "{} ({id}) not ready, attempt {attempt}/{attempts}",
                                info.name
                            );
                        }
                    }
                }
                Ok(None) => log::debug!("{id} not found, attempt {attempt}/{attempts}"),
                Err(e) => log::warn!("Inspecting {id} failed on attempt {attempt}: {e}"),
            }
        }

        let diagnosis = if seen {
            Diagnosis {
                reason: format!("not healthy after {attempts} attempts"),
                classification: Classification::TimedOut,
                exit_code: None,
                logs: self.tail_logs(id).await,
            }
        } else {
            Diagnosis {
                reason: "container never started".to_string(),
                classification: Classification::NeverStarted,
                exit_code: None,
                logs: Vec::new(),
            }
        };
        log::error!("{id}: {}", diagnosis.reason);
        HealthOutcome::Fail(diagnosis)
    }

    async fn check(&self, info: &ContainerInfo) -> Attempt {
        if !info.running {
            if let Some(code) = info.exit_code {
                return Attempt::Fail(Diagnosis {
                    reason: format!("container exited with code {code}"),
                    classification: Classification::Crashed,
                    exit_code: Some(code),
                    logs: self.tail_logs(&info.id).await,
                });
            }
            return Attempt::Retry;
        }

        match &info.health {
            HealthState::Healthy => Attempt::Pass,
            HealthState::Starting => Attempt::Retry,
            HealthState::Unhealthy(output) => Attempt::Fail(Diagnosis {
                reason: match output {
                    Some(output) => format!("health check failed: {output}"),
                    None => "health check failed".to_string(),
                },
                classification: Classification::Unhealthy,
                exit_code: None,
                logs: self.tail_logs(&info.id).await,
            }),
            HealthState::NoHealthcheck => match self.engine.exec(&info.id, &["true"]).await {
                Ok(0) => Attempt::Pass,
                Ok(code) => {
                    log::debug!("Probe in {} exited with {code}", info.id);
                    Attempt::Retry
                }
                Err(e) => {
                    log::warn!("Probe in {} failed: {e}", info.id);
                    Attempt::Retry
                }
            },
        }
    }

    async fn tail_logs(&self, id: &str) -> Vec<String> {
        match self.engine.logs(id, self.policy.log_tail).await {
            Ok(lines) => lines,
            Err(e) => {
                log::warn!("Could not read the logs of {id}: {e}");
                Vec::new()
            }
        }
    }
}

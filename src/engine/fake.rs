//! In-memory container engine for tests.
//!
//! `compose_up` reads the descriptor it is given and materializes one
//! container per service, so pipeline tests observe exactly what the
//! descriptor transformer produced.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_yaml::Value;

use crate::descriptor::labels::COMPOSE_PROJECT_LABEL;

use super::{
    ComposeInvocation, ContainerEngine, ContainerFilter, ContainerInfo, ContainerState,
    ContainerSummary, EngineError, HealthState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    /// Reports `starting` until the n-th inspection.
    HealthyAfter(u32),
    Unhealthy(String),
    Crash(i64),
    /// Compose succeeds but the container never shows up.
    NeverStarts,
    NoHealthcheck { exec_ok: bool },
}

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    labels: HashMap<String, String>,
    state: ContainerState,
    exit_code: Option<i64>,
    behavior: Behavior,
    logs: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    containers: BTreeMap<String, FakeContainer>,
    behaviors: HashMap<String, Behavior>,
    compose_failure: Option<(String, bool)>,
    unavailable: bool,
    stop_failures: HashSet<String>,
    networks: Vec<(String, String)>,
    inspections: HashMap<String, u32>,
    compose_calls: Vec<ComposeInvocation>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct FakeEngine {
    inner: Mutex<Inner>,
}

fn service_labels(service: &Value) -> HashMap<String, String> {
    match service.get("labels") {
        Some(Value::Sequence(entries)) => entries
            .iter()
            .filter_map(Value::as_str)
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry.to_string(), String::new()),
            })
            .collect(),
        Some(Value::Mapping(map)) => map
            .iter()
            .filter_map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => String::new(),
                };
                Some((k.as_str()?.to_string(), value))
            })
            .collect(),
        _ => HashMap::new(),
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake engine mutex poisoned")
    }

    pub fn set_behavior(&self, service: &str, behavior: Behavior) {
        self.lock().behaviors.insert(service.to_string(), behavior);
    }

    /// Make `compose_up` fail. With `partial`, the first service is created
    /// before the failure.
    pub fn fail_compose(&self, stderr: &str, partial: bool) {
        self.lock().compose_failure = Some((stderr.to_string(), partial));
    }

    pub fn set_unavailable(&self) {
        self.lock().unavailable = true;
    }

    pub fn fail_stop(&self, id: &str) {
        self.lock().stop_failures.insert(id.to_string());
    }

    /// Seed a container directly, bypassing compose.
    pub fn add_container(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        state: ContainerState,
        behavior: Behavior,
    ) -> String {
        let mut inner = self.lock();
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let exit_code = match (&behavior, state) {
            (Behavior::Crash(code), _) => Some(*code),
            (_, ContainerState::Exited) => Some(0),
            _ => None,
        };
        Self::insert(&mut inner, name, labels, state, exit_code, behavior)
    }

    fn insert(
        inner: &mut Inner,
        name: &str,
        labels: HashMap<String, String>,
        state: ContainerState,
        exit_code: Option<i64>,
        behavior: Behavior,
    ) -> String {
        inner.next_id += 1;
        let id = format!("{:012x}", inner.next_id);
        let logs = (1..=60).map(|i| format!("{name} log line {i}")).collect();
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                labels,
                state,
                exit_code,
                behavior,
                logs,
            },
        );
        id
    }

    /// Ids of every container, in any state, carrying `key=value`.
    pub fn ids_with_label(&self, key: &str, value: &str) -> BTreeSet<String> {
        self.lock()
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(key).is_some_and(|v| v == value))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn names_with_label(&self, key: &str, value: &str) -> BTreeSet<String> {
        self.lock()
            .containers
            .values()
            .filter(|c| c.labels.get(key).is_some_and(|v| v == value))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn labels_of(&self, id: &str) -> HashMap<String, String> {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.labels.clone())
            .unwrap_or_default()
    }

    pub fn inspections(&self, id: &str) -> u32 {
        self.lock().inspections.get(id).copied().unwrap_or(0)
    }

    pub fn compose_calls(&self) -> Vec<ComposeInvocation> {
        self.lock().compose_calls.clone()
    }

    pub fn network_count(&self) -> usize {
        self.lock().networks.len()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        if self.lock().unavailable {
            return Err(EngineError::Unavailable("fake daemon is down".into()));
        }
        Ok(())
    }

    async fn compose_up(&self, invocation: &ComposeInvocation) -> Result<(), EngineError> {
        let text = std::fs::read_to_string(&invocation.file)?;
        let doc: Value = serde_yaml::from_str(&text).map_err(|e| EngineError::ComposeFailed {
            status: Some(1),
            stderr: e.to_string(),
        })?;

        let mut inner = self.lock();
        inner.compose_calls.push(invocation.clone());
        inner.networks.push((
            format!("{}_default", invocation.project_name),
            format!("{COMPOSE_PROJECT_LABEL}={}", invocation.project_name),
        ));
        let failure = inner.compose_failure.clone();

        let services = doc
            .get("services")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();
        for (service, definition) in services.iter() {
            let service = service.as_str().unwrap_or_default();
            let name = definition
                .get("container_name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}-{service}-1", invocation.project_name));
            let behavior = inner
                .behaviors
                .get(service)
                .cloned()
                .unwrap_or(Behavior::Healthy);
            let (state, exit_code) = match behavior {
                Behavior::NeverStarts => continue,
                Behavior::Crash(code) => (ContainerState::Exited, Some(code)),
                _ => (ContainerState::Running, None),
            };
            let mut labels = service_labels(definition);
            labels.insert(
                COMPOSE_PROJECT_LABEL.to_string(),
                invocation.project_name.clone(),
            );
            Self::insert(&mut inner, &name, labels, state, exit_code, behavior);

            if let Some((_, true)) = failure {
                break;
            }
        }

        match failure {
            Some((stderr, _)) => Err(EngineError::ComposeFailed {
                status: Some(1),
                stderr,
            }),
            None => Ok(()),
        }
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|(id, c)| filter.matches(id, &c.labels, c.state))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: c.name.clone(),
                labels: c.labels.clone(),
                state: c.state,
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerInfo>, EngineError> {
        let mut inner = self.lock();
        let polls = {
            let count = inner.inspections.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let Some(c) = inner.containers.get(id) else {
            return Ok(None);
        };
        let health = match &c.behavior {
            Behavior::Healthy => HealthState::Healthy,
            Behavior::HealthyAfter(n) if polls < *n => HealthState::Starting,
            Behavior::HealthyAfter(_) => HealthState::Healthy,
            Behavior::Unhealthy(output) => HealthState::Unhealthy(Some(output.clone())),
            Behavior::Crash(_) | Behavior::NeverStarts | Behavior::NoHealthcheck { .. } => {
                HealthState::NoHealthcheck
            }
        };
        Ok(Some(ContainerInfo {
            id: id.to_string(),
            name: c.name.clone(),
            labels: c.labels.clone(),
            running: c.state.is_running(),
            exit_code: c.exit_code,
            health,
        }))
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>, EngineError> {
        let inner = self.lock();
        let logs = inner
            .containers
            .get(id)
            .map(|c| c.logs.clone())
            .unwrap_or_default();
        let skip = logs.len().saturating_sub(tail);
        Ok(logs.into_iter().skip(skip).collect())
    }

    async fn exec(&self, id: &str, _cmd: &[&str]) -> Result<i64, EngineError> {
        let inner = self.lock();
        match inner.containers.get(id) {
            Some(c) if !c.state.is_running() => Ok(1),
            Some(FakeContainer {
                behavior: Behavior::NoHealthcheck { exec_ok: false },
                ..
            }) => Ok(1),
            Some(_) => Ok(0),
            None => Err(EngineError::Unavailable(format!("no such container {id}"))),
        }
    }

    async fn stop(&self, id: &str) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.stop_failures.contains(id) {
            return Err(EngineError::Unavailable(format!("cannot stop {id}")));
        }
        if let Some(c) = inner.containers.get_mut(id) {
            c.state = ContainerState::Exited;
            c.exit_code.get_or_insert(0);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.stop_failures.contains(id) {
            return Err(EngineError::Unavailable(format!("cannot remove {id}")));
        }
        inner.containers.remove(id);
        Ok(())
    }

    async fn remove_networks(&self, label: &str) -> Result<usize, EngineError> {
        let mut inner = self.lock();
        let before = inner.networks.len();
        inner.networks.retain(|(_, l)| l != label);
        Ok(before - inner.networks.len())
    }
}

//! Rollback of a failed generation and retirement of superseded ones.
//!
//! Nothing here returns an error: every failure becomes a
//! [`CleanupWarning`] that the caller logs, and every operation is safe to
//! repeat.

use std::collections::BTreeSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

use uuid::Uuid;

use super::launcher::Generation;
use crate::descriptor::labels::{COMPOSE_PROJECT_LABEL, DEPLOYMENT_LABEL, PROJECT_LABEL};
use crate::engine::{ContainerEngine, ContainerFilter, ContainerId, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub resource: String,
    pub message: String,
}

impl CleanupWarning {
    fn new(resource: impl Into<String>, message: impl ToString) -> Self {
        Self {
            resource: resource.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not clean up {}: {}", self.resource, self.message)
    }
}

pub fn log_warnings(warnings: &[CleanupWarning]) {
    for warning in warnings {
        log::warn!("{warning}");
    }
}

/// Generations started by a run that has not finished yet.
///
/// A generation is pushed before its first resource is created and rolled
/// back by [`CleanupStack::unwind`], newest first. A successful run disarms
/// the stack.
#[derive(Debug, Default)]
pub struct CleanupStack {
    pending: Vec<Generation>,
}

impl CleanupStack {
    pub fn push(&mut self, generation: Generation) {
        self.pending.push(generation);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn disarm(&mut self) {
        self.pending.clear();
    }

    pub async fn unwind(&mut self, engine: &dyn ContainerEngine) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        while let Some(generation) = self.pending.pop() {
            warnings.extend(rollback(engine, &generation).await);
        }
        warnings
    }
}

async fn remove_file(path: &Path) -> Option<CleanupWarning> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => None,
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => Some(CleanupWarning::new(path.display().to_string(), e)),
    }
}

async fn remove_container(engine: &dyn ContainerEngine, id: &str) -> Result<(), EngineError> {
    engine.stop(id).await?;
    engine.remove(id).await
}

async fn remove_networks(
    engine: &dyn ContainerEngine,
    compose_project: &str,
) -> Option<CleanupWarning> {
    let label = format!("{COMPOSE_PROJECT_LABEL}={compose_project}");
    match engine.remove_networks(&label).await {
        Ok(0) => None,
        Ok(n) => {
            log::info!("Removed {n} network(s) of {compose_project}");
            None
        }
        Err(e) => Some(CleanupWarning::new(format!("networks of {compose_project}"), e)),
    }
}

async fn remove_generation(
    engine: &dyn ContainerEngine,
    deployment_id: Uuid,
    compose_project: &str,
) -> Vec<CleanupWarning> {
    let mut warnings = Vec::new();
    let filter =
        ContainerFilter::label(DEPLOYMENT_LABEL, &deployment_id.to_string()).include_stopped();
    match engine.list_containers(&filter).await {
        Ok(containers) => {
            for container in containers {
                match remove_container(engine, &container.id).await {
                    Ok(()) => log::info!("Removed container {} ({})", container.name, container.id),
                    Err(e) => warnings.push(CleanupWarning::new(
                        format!("container {}", container.id),
                        e,
                    )),
                }
            }
        }
        Err(e) => warnings.push(CleanupWarning::new(
            format!("containers of deployment {deployment_id}"),
            e,
        )),
    }
    warnings.extend(remove_networks(engine, compose_project).await);
    warnings
}

/// Remove everything a generation created.
pub async fn rollback(
    engine: &dyn ContainerEngine,
    generation: &Generation,
) -> Vec<CleanupWarning> {
    log::warn!("Rolling back generation {}", generation.compose_project);
    let mut warnings =
        remove_generation(engine, generation.deployment_id, &generation.compose_project).await;
    warnings.extend(remove_file(&generation.descriptor_path).await);
    warnings
}

#[derive(Debug, Default)]
pub struct Retirement {
    pub retired: Vec<ContainerId>,
    pub warnings: Vec<CleanupWarning>,
}

/// Remove every container of `project` that does not belong to deployment
/// `keep`, along with the networks and descriptors of their generations.
pub async fn retire(
    engine: &dyn ContainerEngine,
    project: &str,
    keep: Uuid,
    state_dir: &Path,
) -> Retirement {
    let mut retirement = Retirement::default();
    let keep_label = keep.to_string();

    let filter = ContainerFilter::label(PROJECT_LABEL, project).include_stopped();
    let containers = match engine.list_containers(&filter).await {
        Ok(containers) => containers,
        Err(e) => {
            retirement
                .warnings
                .push(CleanupWarning::new(format!("containers of {project}"), e));
            return retirement;
        }
    };

    let mut compose_projects = BTreeSet::new();
    for container in containers
        .into_iter()
        .filter(|c| c.labels.get(DEPLOYMENT_LABEL) != Some(&keep_label))
    {
        match remove_container(engine, &container.id).await {
            Ok(()) => {
                log::info!("Retired container {} ({})", container.name, container.id);
                retirement.retired.push(container.id);
            }
            Err(e) => retirement
                .warnings
                .push(CleanupWarning::new(format!("container {}", container.id), e)),
        }
        if let Some(compose_project) = container.labels.get(COMPOSE_PROJECT_LABEL) {
            compose_projects.insert(compose_project.clone());
        }
    }

    for compose_project in compose_projects {
        retirement
            .warnings
            .extend(remove_networks(engine, &compose_project).await);
    }

    let keep_file = format!("{keep}.compose.yml");
    retirement
        .warnings
        .extend(remove_stale_descriptors(&state_dir.join(project), &keep_file).await);
    retirement
}

async fn remove_stale_descriptors(dir: &Path, keep_file: &str) -> Vec<CleanupWarning> {
    let mut warnings = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return warnings,
        Err(e) => {
            warnings.push(CleanupWarning::new(dir.display().to_string(), e));
            return warnings;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".compose.yml") && name != keep_file {
                    warnings.extend(remove_file(&entry.path()).await);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warnings.push(CleanupWarning::new(dir.display().to_string(), e));
                break;
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ContainerState;
    use crate::engine::fake::{Behavior, FakeEngine};

    fn seed_generation(engine: &FakeEngine, project: &str, id: Uuid, compose_project: &str) {
        let deployment = id.to_string();
        for service in ["web", "worker"] {
            engine.add_container(
                &format!("{service}-{id}"),
                &[
                    (PROJECT_LABEL, project),
                    (DEPLOYMENT_LABEL, &deployment),
                    (COMPOSE_PROJECT_LABEL, compose_project),
                ],
                ContainerState::Running,
                Behavior::Healthy,
            );
        }
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let id = Uuid::now_v7();
        let generation = Generation::new("shop", id, dir.path());
        seed_generation(&engine, "shop", id, &generation.compose_project);
        std::fs::create_dir_all(generation.descriptor_path.parent().unwrap()).unwrap();
        std::fs::write(&generation.descriptor_path, "services: {}").unwrap();

        assert!(rollback(&engine, &generation).await.is_empty());
        assert!(engine.ids_with_label(DEPLOYMENT_LABEL, &id.to_string()).is_empty());
        assert!(!generation.descriptor_path.exists());

        assert!(rollback(&engine, &generation).await.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_collects_failures() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let id = Uuid::now_v7();
        let generation = Generation::new("shop", id, dir.path());
        seed_generation(&engine, "shop", id, &generation.compose_project);
        let stuck = engine
            .ids_with_label(DEPLOYMENT_LABEL, &id.to_string())
            .into_iter()
            .next()
            .unwrap();
        engine.fail_stop(&stuck);

        let warnings = rollback(&engine, &generation).await;
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].resource, format!("container {stuck}"));
        assert_eq!(
            engine.ids_with_label(DEPLOYMENT_LABEL, &id.to_string()).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_retire_keeps_only_the_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let old = Uuid::now_v7();
        let new = Uuid::now_v7();
        seed_generation(&engine, "shop", old, "shop-old");
        seed_generation(&engine, "shop", new, "shop-new");
        seed_generation(&engine, "blog", Uuid::now_v7(), "blog-1");
        let legacy = engine.add_container(
            "shop-web-1",
            &[(PROJECT_LABEL, "shop")],
            ContainerState::Exited,
            Behavior::Healthy,
        );

        let project_dir = dir.path().join("shop");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join(format!("{old}.compose.yml")), "").unwrap();
        std::fs::write(project_dir.join(format!("{new}.compose.yml")), "").unwrap();

        let retirement = retire(&engine, "shop", new, dir.path()).await;
        assert!(retirement.warnings.is_empty());
        assert_eq!(retirement.retired.len(), 3);
        assert!(retirement.retired.contains(&legacy));

        let remaining = engine.ids_with_label(PROJECT_LABEL, "shop");
        assert_eq!(remaining, engine.ids_with_label(DEPLOYMENT_LABEL, &new.to_string()));
        assert_eq!(remaining.len(), 2);
        assert_eq!(engine.ids_with_label(PROJECT_LABEL, "blog").len(), 2);

        assert!(!project_dir.join(format!("{old}.compose.yml")).exists());
        assert!(project_dir.join(format!("{new}.compose.yml")).exists());
    }

    #[tokio::test]
    async fn test_retire_failure_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let old = Uuid::now_v7();
        seed_generation(&engine, "shop", old, "shop-old");
        let stuck = engine
            .ids_with_label(DEPLOYMENT_LABEL, &old.to_string())
            .into_iter()
            .next()
            .unwrap();
        engine.fail_stop(&stuck);

        let retirement = retire(&engine, "shop", Uuid::now_v7(), dir.path()).await;
        assert_eq!(retirement.retired.len(), 1);
        assert_eq!(retirement.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_unwind_rolls_back_and_empties() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let id = Uuid::now_v7();
        let generation = Generation::new("shop", id, dir.path());
        seed_generation(&engine, "shop", id, &generation.compose_project);

        let mut stack = CleanupStack::default();
        stack.push(generation);
        assert_eq!(stack.len(), 1);

        assert!(stack.unwind(&engine).await.is_empty());
        assert!(stack.is_empty());
        assert!(engine.ids_with_label(PROJECT_LABEL, "shop").is_empty());
    }

    #[tokio::test]
    async fn test_disarmed_stack_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let id = Uuid::now_v7();
        let generation = Generation::new("shop", id, dir.path());
        seed_generation(&engine, "shop", id, &generation.compose_project);

        let mut stack = CleanupStack::default();
        stack.push(generation);
        stack.disarm();
        stack.unwind(&engine).await;
        assert_eq!(engine.ids_with_label(PROJECT_LABEL, "shop").len(), 2);
    }
}

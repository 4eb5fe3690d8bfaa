//! Compose descriptor model and the per-generation rewrite.
//!
//! [`transform`] is a pure function over the parsed document: identical
//! input, project and deployment id always produce byte-identical output.
//! It gives every container a name unique to the generation, stamps the
//! labels the pipeline and the proxy rely on, and removes directives that
//! cannot coexist with a fixed container name.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use thiserror::Error;
use uuid::Uuid;

pub mod labels;
pub mod routing;

use labels::{DEPLOYMENT_LABEL, Labels, PROJECT_LABEL, SERVICE_LABEL};
use routing::RoutingConfig;

/// File names compose looks for, in its own order of preference.
pub const DESCRIPTOR_FILE_NAMES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Descriptor is not a mapping")]
    NotAMapping,
    #[error("Descriptor has no services")]
    MissingServices,
    #[error("Service {0} is not a mapping")]
    InvalidService(String),
    #[error("Service {0} has labels that are neither a list nor a mapping")]
    InvalidLabels(String),
    #[error("Routing rule template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("No compose file found in {0:?}")]
    NotFound(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Locate the compose file of a working tree.
pub fn find_descriptor(dir: &Path, name: Option<&str>) -> Result<PathBuf, TransformError> {
    if let Some(name) = name {
        let path = dir.join(name);
        return match path.is_file() {
            true => Ok(path),
            false => Err(TransformError::NotFound(path)),
        };
    }
    DESCRIPTOR_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| TransformError::NotFound(dir.to_path_buf()))
}

/// A parsed compose document. Keys keep their declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    doc: Mapping,
}

impl Descriptor {
    /// Parse a document, resolving `<<` merge keys so inherited fragments
    /// are rewritten like keys declared on the service itself.
    pub fn parse(text: &str) -> Result<Self, TransformError> {
        let mut value = serde_yaml::from_str::<Value>(text)?;
        value.apply_merge()?;
        match value {
            Value::Mapping(doc) => {
                match doc.get("services") {
                    Some(Value::Mapping(services)) if !services.is_empty() => {}
                    _ => return Err(TransformError::MissingServices),
                }
                Ok(Self { doc })
            }
            _ => Err(TransformError::NotAMapping),
        }
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services()
            .map(|services| {
                services
                    .keys()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn services(&self) -> Option<&Mapping> {
        self.doc.get("services").and_then(Value::as_mapping)
    }

    fn services_mut(&mut self) -> Result<&mut Mapping, TransformError> {
        self.doc
            .get_mut("services")
            .and_then(Value::as_mapping_mut)
            .ok_or(TransformError::MissingServices)
    }

    /// Mutable access to one service body.
    pub fn service_mut(&mut self, name: &str) -> Result<&mut Mapping, TransformError> {
        self.services_mut()?
            .get_mut(name)
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| TransformError::InvalidService(name.to_string()))
    }

    /// Declare an external network at the top level.
    pub fn declare_external_network(&mut self, name: &str) {
        let networks = self
            .doc
            .entry(Value::String("networks".into()))
            .or_insert(Value::Null);
        if !networks.is_mapping() {
            *networks = Value::Mapping(Mapping::new());
        }
        if let Value::Mapping(networks) = networks {
            let mut external = Mapping::new();
            external.insert(Value::String("external".into()), Value::Bool(true));
            networks.insert(Value::String(name.to_string()), Value::Mapping(external));
        }
    }

    /// Give named volumes a fixed name so each generation mounts the same
    /// data instead of a copy scoped to its compose project.
    pub fn pin_volume_names(&mut self, project: &str) {
        let Some(Value::Mapping(volumes)) = self.doc.get_mut("volumes") else {
            return;
        };
        for (name, definition) in volumes.iter_mut() {
            let Some(name) = name.as_str() else { continue };
            if definition.is_null() {
                *definition = Value::Mapping(Mapping::new());
            }
            let Value::Mapping(definition) = definition else {
                continue;
            };
            let external = definition
                .get("external")
                .is_some_and(|e| e.as_bool().unwrap_or(true));
            if external || definition.contains_key("name") {
                continue;
            }
            definition.insert(
                Value::String("name".into()),
                Value::String(format!("{project}_{name}")),
            );
        }
    }

    pub fn to_yaml(&self) -> Result<String, TransformError> {
        Ok(serde_yaml::to_string(&self.doc)?)
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Drop replica directives above one. Returns the removed count.
fn strip_replicas(service: &mut Mapping) -> Option<u64> {
    let mut removed = None;

    if let Some(Value::Mapping(deploy)) = service.get_mut("deploy") {
        if let Some(count) = deploy.get("replicas").and_then(as_count) {
            if count > 1 {
                deploy.shift_remove("replicas");
                removed = Some(count);
            }
        }
        if deploy.is_empty() {
            service.shift_remove("deploy");
        }
    }

    if let Some(count) = service.get("scale").and_then(as_count) {
        if count > 1 {
            service.shift_remove("scale");
            removed = Some(removed.map_or(count, |r: u64| r.max(count)));
        }
    }

    removed
}

/// Container name for a service in a given generation.
pub fn container_name(service: &str, deployment_id: Uuid) -> String {
    format!("{service}-{deployment_id}")
}

/// Rewrite a compose document for one generation.
pub fn transform(
    text: &str,
    project: &str,
    deployment_id: Uuid,
    routing: &RoutingConfig,
) -> Result<String, TransformError> {
    let mut descriptor = Descriptor::parse(text)?;
    let deployment = deployment_id.to_string();

    for name in descriptor.service_names() {
        let service = descriptor.service_mut(&name)?;

        service.insert(
            Value::String("container_name".into()),
            Value::String(container_name(&name, deployment_id)),
        );

        if let Some(count) = strip_replicas(service) {
            log::warn!(
                "Service {name} declares {count} replicas; removing the directive as each \
                 generation runs one named container per service"
            );
        }

        let mut labels = Labels::from_value(&name, service.get("labels"))?;
        labels.set_str(PROJECT_LABEL, project);
        labels.set_str(DEPLOYMENT_LABEL, &deployment);
        labels.set_str(SERVICE_LABEL, &name);

        if routing.enabled {
            let port = routing::routed_port(&name, service);
            routing::apply_labels(&mut labels, routing, project, &name, port)?;
            routing::join_network(&name, service, &routing.network);
        }

        service.insert(Value::String("labels".into()), labels.into_value());
    }

    if routing.enabled {
        descriptor.declare_external_network(&routing.network);
    }
    descriptor.pin_volume_names(project);

    descriptor.to_yaml()
}

use serde_yaml::Value;

use super::TransformError;

pub const PROJECT_LABEL: &str = "project";
pub const DEPLOYMENT_LABEL: &str = "relevo.deployment";
pub const SERVICE_LABEL: &str = "relevo.service";
/// Containers carrying this label skip health verification.
pub const DISABLE_HEALTHCHECK_LABEL: &str = "relevo.healthcheck.disable";
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Whether a label value switches a marker on.
pub fn is_truthy(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelStyle {
    /// `- key=value`
    List,
    /// `key: value`
    Mapping,
}

/// The labels of one service, in declaration order.
///
/// Keeps the representation the service was written in so that a rewrite
/// only touches the keys it sets.
#[derive(Debug, Clone, PartialEq)]
pub struct Labels {
    style: LabelStyle,
    entries: Vec<(String, Value)>,
}

impl Labels {
    pub fn from_value(service: &str, value: Option<&Value>) -> Result<Self, TransformError> {
        let invalid = || TransformError::InvalidLabels(service.to_string());
        match value {
            None | Some(Value::Null) => Ok(Self {
                style: LabelStyle::Mapping,
                entries: Vec::new(),
            }),
            Some(Value::Sequence(items)) => {
                let mut labels = Self {
                    style: LabelStyle::List,
                    entries: Vec::with_capacity(items.len()),
                };
                for item in items {
                    let item = item.as_str().ok_or_else(invalid)?;
                    match item.split_once('=') {
                        Some((key, value)) => labels.set(key, Value::String(value.to_string())),
                        None => labels.set(item, Value::Null),
                    }
                }
                Ok(labels)
            }
            Some(Value::Mapping(map)) => {
                let mut labels = Self {
                    style: LabelStyle::Mapping,
                    entries: Vec::with_capacity(map.len()),
                };
                for (key, value) in map {
                    let key = key.as_str().ok_or_else(invalid)?;
                    labels.set(key, value.clone());
                }
                Ok(labels)
            }
            Some(_) => Err(invalid()),
        }
    }

    pub fn style(&self) -> LabelStyle {
        self.style
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Replace the value of `key` in place, or append it.
    pub fn set(&mut self, key: &str, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.set(key, Value::String(value.to_string()));
    }

    pub fn into_value(self) -> Value {
        match self.style {
            LabelStyle::List => Value::Sequence(
                self.entries
                    .into_iter()
                    .map(|(key, value)| match scalar_to_string(&value) {
                        Some(value) => Value::String(format!("{key}={value}")),
                        None => Value::String(key),
                    })
                    .collect(),
            ),
            LabelStyle::Mapping => Value::Mapping(
                self.entries
                    .into_iter()
                    .map(|(key, value)| (Value::String(key), value))
                    .collect(),
            ),
        }
    }
}

/// Render a YAML scalar the way compose reads it into a label value.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

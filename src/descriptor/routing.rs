//! Reverse-proxy routing for transformed services.
//!
//! The proxy discovers services passively through container labels and
//! network membership, so routing is nothing more than the right labels on
//! the right network.

use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::labels::Labels;
use super::TransformError;

const PORT_ENV_VARS: [&str; 5] = ["PORT", "HTTP_PORT", "SERVER_PORT", "APP_PORT", "WEB_PORT"];
const FALLBACK_PORT: u16 = 80;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// External network shared with the proxy.
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    /// Router rule template. Variables: `router`, `project`, `service`, `domain`.
    #[serde(default = "default_rule")]
    pub rule: String,
}

fn default_true() -> bool {
    true
}

fn default_network() -> String {
    "web-proxy".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_entrypoint() -> String {
    "web".to_string()
}

fn default_rule() -> String {
    "Host(`${ router }.${ domain }`)".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            network: default_network(),
            domain: default_domain(),
            entrypoint: default_entrypoint(),
            rule: default_rule(),
        }
    }
}

impl RoutingConfig {
    /// Render the router rule for one service.
    pub fn render_rule(
        &self,
        router: &str,
        project: &str,
        service: &str,
    ) -> Result<String, TransformError> {
        let mut env = Environment::new();
        let syntax = minijinja::syntax::SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .build()?;
        env.set_syntax(syntax);
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

        let template = env.template_from_str(&self.rule)?;
        Ok(template.render(minijinja::context! {
            router => router,
            project => project,
            service => service,
            domain => &self.domain,
        })?)
    }
}

/// Router and service name shared by every generation of a service.
pub fn router_name(project: &str, service: &str) -> String {
    format!("{project}-{service}")
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            _ => '-',
        })
        .collect()
}

fn leading_port(raw: &str) -> Option<u16> {
    let digits: String = raw.trim().chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Container port of one `ports` entry.
fn container_port(entry: &Value) -> Option<u16> {
    match entry {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        // [ip:][host:]container[/proto]
        Value::String(s) => s.rsplit(':').next().and_then(leading_port),
        Value::Mapping(map) => match map.get("target") {
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Some(Value::String(s)) => leading_port(s),
            _ => Some(FALLBACK_PORT),
        },
        _ => None,
    }
}

/// Remove published ports and return the container ports they pointed at.
///
/// Published host ports would collide between two live generations; the
/// proxy reaches the containers over its network instead.
pub fn take_published_ports(service: &mut Mapping) -> Vec<u16> {
    match service.shift_remove("ports") {
        Some(Value::Sequence(entries)) => entries.iter().filter_map(container_port).collect(),
        _ => Vec::new(),
    }
}

/// Guess the port a service listens on when it publishes none.
pub fn detect_port(service: &Mapping) -> Option<u16> {
    match service.get("environment") {
        Some(Value::Sequence(vars)) => {
            for var in vars.iter().filter_map(Value::as_str) {
                if let Some((key, value)) = var.split_once('=') {
                    if PORT_ENV_VARS.contains(&key) {
                        if let Some(port) = leading_port(value) {
                            return Some(port);
                        }
                    }
                }
            }
        }
        Some(Value::Mapping(vars)) => {
            for key in PORT_ENV_VARS {
                let port = match vars.get(key) {
                    Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
                    Some(Value::String(s)) => leading_port(s),
                    _ => None,
                };
                if port.is_some() {
                    return port;
                }
            }
        }
        _ => {}
    }

    if let Some(Value::Sequence(exposed)) = service.get("expose") {
        if let Some(port) = exposed.first().and_then(container_port) {
            return Some(port);
        }
    }

    let image = service.get("image").and_then(Value::as_str)?.to_lowercase();
    if image.contains("nginx") || image.contains("apache") {
        Some(80)
    } else if image.contains("node") || image.contains("express") {
        Some(3000)
    } else if image.contains("python") || image.contains("flask") || image.contains("django") {
        Some(8000)
    } else if image.contains("tomcat") {
        Some(8080)
    } else {
        None
    }
}

/// Attach the service to the proxy network, keeping the form its
/// `networks` entry was written in.
pub fn join_network(service_name: &str, service: &mut Mapping, network: &str) {
    if service.contains_key("network_mode") {
        log::warn!(
            "Service {service_name} sets network_mode and cannot join {network}; \
             it will not be routed"
        );
        return;
    }
    let proxy = Value::String(network.to_string());
    match service.get_mut("networks") {
        Some(Value::Sequence(networks)) => {
            if !networks.contains(&proxy) {
                networks.push(proxy);
            }
        }
        Some(Value::Mapping(networks)) => {
            if !networks.contains_key(network) {
                networks.insert(proxy, Value::Null);
            }
        }
        _ => {
            // Without an explicit list the service sat on `default` only.
            service.insert(
                Value::String("networks".into()),
                Value::Sequence(vec![Value::String("default".into()), proxy]),
            );
        }
    }
}

/// Routing labels for one service.
pub fn apply_labels(
    labels: &mut Labels,
    routing: &RoutingConfig,
    project: &str,
    service_name: &str,
    port: u16,
) -> Result<(), TransformError> {
    let router = router_name(project, service_name);
    let rule = routing.render_rule(&router, project, service_name)?;

    labels.set_str("traefik.enable", "true");
    labels.set_str(&format!("traefik.http.routers.{router}.rule"), &rule);
    labels.set_str(
        &format!("traefik.http.routers.{router}.entrypoints"),
        &routing.entrypoint,
    );
    labels.set_str(
        &format!("traefik.http.services.{router}.loadbalancer.server.port"),
        &port.to_string(),
    );
    labels.set_str("traefik.docker.network", &routing.network);
    Ok(())
}

/// Resolve the routed port for a service, removing its published ports.
pub fn routed_port(service_name: &str, service: &mut Mapping) -> u16 {
    let published = take_published_ports(service);
    if let Some(port) = published.first() {
        log::info!(
            "Removed published ports {published:?} from {service_name}, routing to {port}"
        );
        return *port;
    }
    match detect_port(service) {
        Some(port) => {
            log::info!("Routing {service_name} to detected port {port}");
            port
        }
        None => {
            log::info!("Routing {service_name} to default port {FALLBACK_PORT}");
            FALLBACK_PORT
        }
    }
}

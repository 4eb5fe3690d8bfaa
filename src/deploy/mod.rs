//! Blue-green deployment of compose projects.
//!
//! A deployment syncs the repository, rewrites its descriptor for a new
//! generation, starts that generation next to the running one, verifies its
//! health and retires the previous generation once the proxy routes to the
//! new one. [`orchestrator::Orchestrator`] drives the phases; the other
//! modules implement one phase each.

pub mod cleanup;
pub mod error;
pub mod health;
pub mod launcher;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod switch;

pub use error::DeploymentError;
pub use orchestrator::{DeployRequest, Orchestrator};

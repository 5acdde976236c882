//! deploy-core — shared model for the deployment orchestrator.
//!
//! Holds the data model every other crate passes around (deployment specs,
//! stage results, rollout records), the `deploy.toml` parser, and the
//! resource graph that turns a set of descriptors into a dependency-respecting
//! apply order.

pub mod config;
pub mod duration;
pub mod error;
pub mod graph;
pub mod types;

pub use config::DeployConfig;
pub use duration::{format_duration, parse_duration};
pub use error::{CollaboratorError, GraphError, ValidationError};
pub use graph::topological_order;
pub use types::*;

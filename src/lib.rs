//! Lightspeed Kubernetes Operator
//!
//! Keeps the Lightspeed assistant service and everything around it in line
//! with a single cluster-scoped `LightspeedConfig` resource. Each cycle
//! resolves the external Secrets and ConfigMaps the config refers to,
//! compiles the desired objects, detects drift and dependency changes, and
//! applies the smallest write that converges the cluster.

pub mod adapters;
pub mod applier;
pub mod certs;
pub mod change;
pub mod compiler;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod equality;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod resolver;
pub mod store;

pub use error::{Error, Result};

//! Custom Resource Definitions for the Lightspeed Operator

pub mod console;
mod lightspeed_config;
pub mod monitoring;

pub use lightspeed_config::*;

use kube::CustomResourceExt;

/// Generate CRD YAML manifests for the resources this operator owns
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![serde_yaml::to_string(&LightspeedConfig::crd())?])
}

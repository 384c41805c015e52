//! Builders turning a LightspeedConfig into the Kubernetes objects it
//! manages

pub mod app_config;
pub mod cache_builder;
pub mod console_builder;
pub mod deployment_builder;
pub mod exporter_config;
pub mod meta;
pub mod monitoring_builder;
pub mod network_policy_builder;
pub mod rbac_builder;
pub mod service_builder;

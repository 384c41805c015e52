//! Operator configuration
//!
//! Everything the desired-state compiler needs to know about the cluster and
//! the operator deployment is carried in [`OperatorConfig`], built once at
//! startup and passed down explicitly.

use clap::{ArgAction, Parser};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Proxy variables forwarded from the operator process to the app server
pub const PROXY_ENV_VARS: [&str; 6] = [
    "HTTPS_PROXY",
    "https_proxy",
    "HTTP_PROXY",
    "http_proxy",
    "NO_PROXY",
    "no_proxy",
];

/// Major and minor version of the platform
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformVersion {
    pub major: u32,
    pub minor: u32,
}

impl PlatformVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PlatformVersion {
    type Err = String;

    /// Accepts `4.16`, `4.16.3` and `4.16.0-rc.1`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let major = parts.next().and_then(|p| p.parse().ok());
        let minor = parts
            .next()
            .map(|p| p.split('-').next().unwrap_or(p))
            .and_then(|p| p.parse().ok());

        match (major, minor) {
            (Some(major), Some(minor)) => Ok(Self { major, minor }),
            _ => Err(format!("invalid platform version '{}'", s)),
        }
    }
}

/// Container images for the managed workload
#[derive(Clone, Debug)]
pub struct Images {
    pub app_server: String,
    pub data_exporter: String,
    pub mcp_server: String,
    pub cache_server: String,
    pub console_plugin: String,
}

/// Runtime configuration of the operator
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace holding every namespaced managed object
    pub namespace: String,
    pub images: Images,
    pub platform_version: PlatformVersion,
    /// Whether the monitoring.coreos.com API is served
    pub prometheus_available: bool,
    /// Proxy variables copied into the app server container, keyed by
    /// lowercase name
    pub proxy_env: BTreeMap<String, String>,
    /// Steady-state requeue interval
    pub reconcile_interval: Duration,
}

/// Command line and environment options
#[derive(Parser, Debug, Clone)]
#[command(name = "lightspeed-operator", version, about)]
pub struct OperatorArgs {
    /// Namespace the managed workload lives in
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "openshift-lightspeed")]
    pub namespace: String,

    #[arg(
        long,
        env = "RELATED_IMAGE_APP_SERVER",
        default_value = "quay.io/openshift-lightspeed/lightspeed-service-api:latest"
    )]
    pub app_server_image: String,

    #[arg(
        long,
        env = "RELATED_IMAGE_DATAVERSE_EXPORTER",
        default_value = "quay.io/openshift-lightspeed/lightspeed-to-dataverse-exporter:latest"
    )]
    pub data_exporter_image: String,

    #[arg(
        long,
        env = "RELATED_IMAGE_OPENSHIFT_MCP_SERVER",
        default_value = "quay.io/openshift-lightspeed/openshift-mcp-server:latest"
    )]
    pub mcp_server_image: String,

    #[arg(
        long,
        env = "RELATED_IMAGE_POSTGRES_SERVER",
        default_value = "registry.redhat.io/rhel9/postgresql-16:latest"
    )]
    pub cache_server_image: String,

    #[arg(
        long,
        env = "RELATED_IMAGE_CONSOLE_PLUGIN",
        default_value = "quay.io/openshift-lightspeed/lightspeed-console-plugin:latest"
    )]
    pub console_plugin_image: String,

    /// Platform version; detected from ClusterVersion when unset
    #[arg(long, env = "PLATFORM_VERSION")]
    pub platform_version: Option<PlatformVersion>,

    /// Manage ServiceMonitor and PrometheusRule objects
    #[arg(long, env = "PROMETHEUS_AVAILABLE", action = ArgAction::Set, default_value_t = true)]
    pub prometheus_available: bool,

    /// Port for the operator's own metrics endpoint
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 60)]
    pub reconcile_interval_secs: u64,
}

impl OperatorArgs {
    /// Build the runtime configuration, capturing proxy variables from the
    /// process environment.
    pub fn into_config(self, platform_version: PlatformVersion) -> OperatorConfig {
        let mut proxy_env = BTreeMap::new();
        for name in PROXY_ENV_VARS {
            if let Some(value) = std::env::var(name).ok().filter(|v| !v.is_empty()) {
                proxy_env.entry(name.to_lowercase()).or_insert(value);
            }
        }

        OperatorConfig {
            namespace: self.namespace,
            images: Images {
                app_server: self.app_server_image,
                data_exporter: self.data_exporter_image,
                mcp_server: self.mcp_server_image,
                cache_server: self.cache_server_image,
                console_plugin: self.console_plugin_image,
            },
            platform_version,
            prometheus_available: self.prometheus_available,
            proxy_env,
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
        }
    }
}

/// Read the platform version from the cluster's ClusterVersion object
pub async fn detect_platform_version(client: &Client) -> Result<PlatformVersion> {
    let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterVersion");
    let resource = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);

    let cluster_version = api.get("version").await.map_err(|e| {
        Error::ConfigError(format!("Failed to get ClusterVersion 'version': {}", e))
    })?;

    let version = cluster_version
        .data
        .pointer("/status/desired/version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::ConfigError("ClusterVersion has no status.desired.version".to_string())
        })?;

    version.parse().map_err(Error::ConfigError)
}

//! Names, paths, labels and owner references shared by the builders

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::LightspeedConfig;

/// Deployment, Service, ServiceAccount and NetworkPolicy name
pub const APP_SERVER_NAME: &str = "lightspeed-app-server";
pub const SAR_ROLE_NAME: &str = "lightspeed-app-server-sar-role";
pub const SAR_ROLE_BINDING_NAME: &str = "lightspeed-app-server-sar-role-binding";

pub const APP_CONFIG_CM_NAME: &str = "olsconfig";
pub const APP_CONFIG_FILENAME: &str = "olsconfig.yaml";
pub const EXPORTER_CONFIG_CM_NAME: &str = "lightspeed-exporter-config";
pub const EXPORTER_CONFIG_FILENAME: &str = "config.yaml";

/// Secret the service CA operator fills when no user TLS secret is given
pub const SERVING_CERT_SECRET_NAME: &str = "lightspeed-tls";
pub const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

pub const METRICS_READER_SECRET_NAME: &str = "metrics-reader-token";
pub const METRICS_READER_SA_NAME: &str = "lightspeed-operator-metrics-reader";
pub const SERVICE_MONITOR_NAME: &str = "lightspeed-app-server-monitor";
pub const PROMETHEUS_RULE_NAME: &str = "lightspeed-app-server-prometheus-rule";

/// Platform root CA bundle present in every namespace
pub const ROOT_CA_CM_NAME: &str = "kube-root-ca.crt";
pub const PROXY_CA_FILENAME: &str = "proxy-ca.crt";

/// Deployment, Service and NetworkPolicy name of the conversation cache
pub const CACHE_SERVER_NAME: &str = "lightspeed-postgres-server";
pub const CACHE_CONFIG_CM_NAME: &str = "lightspeed-postgres-conf";
pub const CACHE_CONFIG_FILENAME: &str = "postgresql.conf.sample";
pub const CACHE_BOOTSTRAP_SECRET_NAME: &str = "lightspeed-postgres-bootstrap";
pub const CACHE_BOOTSTRAP_FILENAME: &str = "create-extensions.sh";
/// Secret the service CA operator fills for the cache Service
pub const CACHE_CERTS_SECRET_NAME: &str = "lightspeed-postgres-certs";
pub const CACHE_PVC_NAME: &str = "lightspeed-postgres-pvc";
/// Service CA bundle injected into every namespace
pub const SERVICE_CA_CM_NAME: &str = "openshift-service-ca.crt";

/// Name shared by every console plugin object
pub const CONSOLE_PLUGIN_NAME: &str = "lightspeed-console-plugin";
pub const CONSOLE_CERT_SECRET_NAME: &str = "lightspeed-console-plugin-cert";
pub const CONSOLE_CR_NAME: &str = "cluster";
pub const CONSOLE_PROXY_ALIAS: &str = "ols";

pub const APP_SERVER_PORT: i32 = 8443;
pub const CACHE_SERVER_PORT: i32 = 5432;
pub const CONSOLE_PLUGIN_PORT: i32 = 9443;
pub const MCP_SERVER_PORT: i32 = 8080;

/// Back-reference written on external objects the operator consumes
pub const WATCHER_ANNOTATION: &str = "lightspeed.io/watcher";
/// Pod template annotation used as the restart token
pub const FORCE_RELOAD_ANNOTATION: &str = "lightspeed.io/force-reload";
/// Marks configs owned by the OpenStack flavour of the assistant
pub const RHOSO_OWNER_LABEL: &str = "openstack.org/lightspeed-owner-id";

// Mount layout inside the app server pod
pub const API_KEY_MOUNT_ROOT: &str = "/etc/apikeys";
pub const CREDENTIALS_MOUNT_ROOT: &str = "/etc/credentials";
pub const CERTS_MOUNT_ROOT: &str = "/etc/certs";
pub const MCP_HEADERS_MOUNT_ROOT: &str = "/etc/mcp/headers";
pub const APP_CONFIG_MOUNT_PATH: &str = "/etc/ols";
pub const EXPORTER_CONFIG_MOUNT_PATH: &str = "/etc/config";
pub const USER_DATA_MOUNT_PATH: &str = "/app-root/ols-user-data";
pub const RAG_MOUNT_PATH: &str = "/rag-data";

pub const ROOT_CA_DIR: &str = "ols-additional-ca";
pub const USER_CA_DIR: &str = "ols-user-ca";
pub const PROXY_CA_DIR: &str = "proxy-ca";
pub const CERT_BUNDLE_DIR: &str = "cert-bundle";

fn component_labels(component: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/component".to_string(), component.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "lightspeed-operator".to_string(),
        ),
        ("app.kubernetes.io/name".to_string(), name.to_string()),
        (
            "app.kubernetes.io/part-of".to_string(),
            "openshift-lightspeed".to_string(),
        ),
    ])
}

/// Labels selecting the app server pods
pub fn app_server_labels() -> BTreeMap<String, String> {
    component_labels("application-server", "lightspeed-service-api")
}

/// Labels selecting the conversation cache pods
pub fn cache_server_labels() -> BTreeMap<String, String> {
    component_labels("postgres-server", "lightspeed-service-postgres")
}

/// Labels selecting the console plugin pods
pub fn console_plugin_labels() -> BTreeMap<String, String> {
    component_labels("console-plugin", CONSOLE_PLUGIN_NAME)
}

pub fn build_owner_reference(config: &LightspeedConfig) -> OwnerReference {
    OwnerReference {
        api_version: LightspeedConfig::api_version(&()).to_string(),
        kind: LightspeedConfig::kind(&()).to_string(),
        name: config.name_any(),
        uid: config.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata for an object owned by the config
pub fn owned_meta(
    config: &LightspeedConfig,
    name: &str,
    namespace: Option<&str>,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        owner_references: Some(vec![build_owner_reference(config)]),
        ..Default::default()
    }
}

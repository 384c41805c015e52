//! Kubernetes Deployment builder for the app server pods

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    HTTPGetAction, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource,
    SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use super::exporter_config::data_collection_enabled;
use super::meta::{
    app_server_labels, owned_meta, API_KEY_MOUNT_ROOT, APP_CONFIG_CM_NAME, APP_CONFIG_FILENAME,
    APP_CONFIG_MOUNT_PATH, APP_SERVER_NAME, APP_SERVER_PORT, CERTS_MOUNT_ROOT, CERT_BUNDLE_DIR,
    CREDENTIALS_MOUNT_ROOT, EXPORTER_CONFIG_CM_NAME, EXPORTER_CONFIG_FILENAME,
    EXPORTER_CONFIG_MOUNT_PATH, MCP_HEADERS_MOUNT_ROOT, MCP_SERVER_PORT, PROXY_CA_DIR,
    RAG_MOUNT_PATH, ROOT_CA_CM_NAME, ROOT_CA_DIR, SERVING_CERT_SECRET_NAME, USER_CA_DIR,
    USER_DATA_MOUNT_PATH,
};
use crate::config::OperatorConfig;
use crate::crd::{
    ContainerOverrides, LightspeedConfig, ResourceRequirementsSpec, FEATURE_GATE_MCP_SERVER,
};
use crate::resolver::KUBERNETES_TOKEN_SENTINEL;
use crate::{Error, Result};

pub const API_CONTAINER_NAME: &str = "lightspeed-service-api";
pub const EXPORTER_CONTAINER_NAME: &str = "lightspeed-to-dataverse-exporter";
pub const MCP_CONTAINER_NAME: &str = "openshift-mcp-server";

pub(crate) const VOLUME_DEFAULT_MODE: i32 = 420;
const APP_CONFIG_VOLUME: &str = "cm-olsconfig";
const USER_DATA_VOLUME: &str = "ols-user-data";
const EXPORTER_CONFIG_VOLUME: &str = "exporter-config";
const ROOT_CA_VOLUME: &str = "openshift-ca";
const USER_CA_VOLUME: &str = "additional-ca";
const RAG_VOLUME: &str = "rag";
pub(crate) const TMP_VOLUME: &str = "tmp-writable-volume";

/// Volumes and mounts keyed by volume name, so repeated references to the
/// same object collapse and the rendered lists come out sorted. A name that
/// comes back with a different source or mount is rejected.
#[derive(Default)]
pub(crate) struct PodStorage {
    volumes: BTreeMap<String, Volume>,
    mounts: BTreeMap<String, VolumeMount>,
}

fn conflicting_volume(name: &str) -> Error {
    Error::DuplicateObject {
        kind: "Volume".to_string(),
        name: name.to_string(),
    }
}

impl PodStorage {
    pub(crate) fn add(&mut self, volume: Volume, mount: Option<VolumeMount>) -> Result<()> {
        let name = volume.name.clone();
        match self.volumes.get(&name) {
            Some(existing) if *existing != volume => return Err(conflicting_volume(&name)),
            _ => {}
        }
        if let Some(mount) = mount {
            match self.mounts.get(&name) {
                Some(existing) if *existing != mount => return Err(conflicting_volume(&name)),
                _ => {}
            }
            self.mounts.insert(name.clone(), mount);
        }
        self.volumes.insert(name, volume);
        Ok(())
    }

    fn add_mounted(&mut self, volume: Volume, mount_path: Option<String>, read_only: bool) -> Result<()> {
        let mount = mount_path.map(|mount_path| VolumeMount {
            name: volume.name.clone(),
            mount_path,
            read_only: read_only.then_some(true),
            ..Default::default()
        });
        self.add(volume, mount)
    }

    pub(crate) fn secret(&mut self, volume_name: String, secret_name: &str, mount_path: String) -> Result<()> {
        let volume = Volume {
            name: volume_name,
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_string()),
                default_mode: Some(VOLUME_DEFAULT_MODE),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.add_mounted(volume, Some(mount_path), true)
    }

    pub(crate) fn config_map(&mut self, volume_name: &str, cm_name: &str, mount_path: String) -> Result<()> {
        let volume = Volume {
            name: volume_name.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: cm_name.to_string(),
                default_mode: Some(VOLUME_DEFAULT_MODE),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.add_mounted(volume, Some(mount_path), true)
    }

    pub(crate) fn empty_dir(&mut self, volume_name: &str, mount_path: Option<String>) -> Result<()> {
        let volume = Volume {
            name: volume_name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        };
        self.add_mounted(volume, mount_path, false)
    }

    pub(crate) fn volumes(&self) -> Vec<Volume> {
        self.volumes.values().cloned().collect()
    }

    pub(crate) fn mounts(&self) -> Vec<VolumeMount> {
        self.mounts.values().cloned().collect()
    }
}

fn pod_storage(config: &LightspeedConfig, telemetry_enabled: bool) -> Result<PodStorage> {
    let spec = &config.spec;
    let ols = &spec.ols;
    let mut storage = PodStorage::default();

    for provider in &spec.llm.providers {
        let name = &provider.credentials_secret_ref.name;
        storage.secret(
            format!("secret-{}", name),
            name,
            format!("{}/{}", API_KEY_MOUNT_ROOT, name),
        )?;
    }

    // Always mounted under the default name so the config path is stable
    let tls_secret = ols
        .tls_config
        .as_ref()
        .map(|t| t.key_cert_secret_ref.name.as_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(SERVING_CERT_SECRET_NAME);
    storage.secret(
        format!("tls-{}", SERVING_CERT_SECRET_NAME),
        tls_secret,
        format!("{}/{}", CERTS_MOUNT_ROOT, SERVING_CERT_SECRET_NAME),
    )?;

    if spec.feature_enabled(FEATURE_GATE_MCP_SERVER) {
        let header_secrets = spec
            .mcp_servers
            .iter()
            .filter_map(|s| s.streamable_http.as_ref())
            .flat_map(|http| http.headers.values())
            .filter(|v| *v != KUBERNETES_TOKEN_SENTINEL);
        for secret in header_secrets {
            storage.secret(
                format!("header-{}", secret),
                secret,
                format!("{}/{}", MCP_HEADERS_MOUNT_ROOT, secret),
            )?;
        }
    }

    let cache_secret = &ols.conversation_cache.postgres.credentials_secret;
    storage.secret(
        format!("credentials-{}", cache_secret),
        cache_secret,
        format!("{}/{}", CREDENTIALS_MOUNT_ROOT, cache_secret),
    )?;

    storage.config_map(
        APP_CONFIG_VOLUME,
        APP_CONFIG_CM_NAME,
        APP_CONFIG_MOUNT_PATH.to_string(),
    )?;
    storage.config_map(
        ROOT_CA_VOLUME,
        ROOT_CA_CM_NAME,
        format!("{}/{}", CERTS_MOUNT_ROOT, ROOT_CA_DIR),
    )?;

    if let Some(ca) = ols
        .additional_ca_config_map_ref
        .as_ref()
        .filter(|r| !r.name.is_empty())
    {
        storage.config_map(
            USER_CA_VOLUME,
            &ca.name,
            format!("{}/{}", CERTS_MOUNT_ROOT, USER_CA_DIR),
        )?;
    }

    if let Some(proxy_ca) = ols
        .proxy_config
        .as_ref()
        .and_then(|p| p.proxy_ca_certificate_ref.as_ref())
        .filter(|r| !r.name.is_empty())
    {
        storage.config_map(
            PROXY_CA_DIR,
            &proxy_ca.name,
            format!("{}/{}", CERTS_MOUNT_ROOT, PROXY_CA_DIR),
        )?;
    }

    storage.empty_dir(
        CERT_BUNDLE_DIR,
        Some(format!("{}/{}", CERTS_MOUNT_ROOT, CERT_BUNDLE_DIR)),
    )?;
    storage.empty_dir(TMP_VOLUME, Some("/tmp".to_string()))?;

    if !ols.rag.is_empty() {
        storage.empty_dir(RAG_VOLUME, Some(RAG_MOUNT_PATH.to_string()))?;
    }

    if data_collection_enabled(config, telemetry_enabled) {
        storage.empty_dir(USER_DATA_VOLUME, Some(USER_DATA_MOUNT_PATH.to_string()))?;
        storage.config_map(
            EXPORTER_CONFIG_VOLUME,
            EXPORTER_CONFIG_CM_NAME,
            EXPORTER_CONFIG_MOUNT_PATH.to_string(),
        )?;
    }

    Ok(storage)
}

pub(crate) fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        None
    } else {
        Some(
            values
                .iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect(),
        )
    }
}

/// User resources when given, otherwise `limit` memory and `cpu`/`memory`
/// requests
pub(crate) fn resources_or_default(
    resources: Option<&ResourceRequirementsSpec>,
    limit: &str,
    cpu: &str,
    memory: &str,
) -> ResourceRequirements {
    match resources {
        Some(resources) => ResourceRequirements {
            limits: quantities(&resources.limits),
            requests: quantities(&resources.requests),
            ..Default::default()
        },
        None => ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity(limit.to_string()),
            )])),
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
            ])),
            ..Default::default()
        },
    }
}

pub(crate) fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(true),
        ..Default::default()
    }
}

/// Proxy variables captured from the operator process
pub(crate) fn proxy_env(operator: &OperatorConfig) -> Vec<EnvVar> {
    operator
        .proxy_env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect()
}

/// Node selector and tolerations of the pod
pub(crate) fn apply_scheduling(pod: &mut PodSpec, overrides: &ContainerOverrides) {
    if !overrides.node_selector.is_empty() {
        pod.node_selector = Some(overrides.node_selector.clone());
    }

    if !overrides.tolerations.is_empty() {
        pod.tolerations = Some(
            overrides
                .tolerations
                .iter()
                .map(|t| Toleration {
                    key: t.key.clone(),
                    operator: t.operator.clone(),
                    value: t.value.clone(),
                    effect: t.effect.clone(),
                    toleration_seconds: t.toleration_seconds,
                })
                .collect(),
        );
    }
}

fn https_probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String("https".to_string()),
            scheme: Some("HTTPS".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(30),
        period_seconds: Some(30),
        timeout_seconds: Some(30),
        failure_threshold: Some(15),
        ..Default::default()
    }
}

fn api_container(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
    mounts: Vec<VolumeMount>,
) -> Container {
    let mut env = proxy_env(operator);
    env.push(EnvVar {
        name: "OLS_CONFIG_FILE".to_string(),
        value: Some(format!("{}/{}", APP_CONFIG_MOUNT_PATH, APP_CONFIG_FILENAME)),
        ..Default::default()
    });

    Container {
        name: API_CONTAINER_NAME.to_string(),
        image: Some(operator.images.app_server.clone()),
        image_pull_policy: Some("Always".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: APP_SERVER_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        security_context: Some(restricted_security_context()),
        volume_mounts: Some(mounts),
        env: Some(env),
        resources: Some(resources_or_default(
            config.spec.ols.deployment.api.resources.as_ref(),
            "4Gi",
            "500m",
            "1Gi",
        )),
        readiness_probe: Some(https_probe("/readiness")),
        liveness_probe: Some(https_probe("/liveness")),
        ..Default::default()
    }
}

fn exporter_container(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
    mounts: Vec<VolumeMount>,
) -> Container {
    let log_level = config
        .spec
        .ols_data_collector
        .log_level
        .clone()
        .unwrap_or_else(|| "INFO".to_string());

    Container {
        name: EXPORTER_CONTAINER_NAME.to_string(),
        image: Some(operator.images.data_exporter.clone()),
        image_pull_policy: Some("Always".to_string()),
        security_context: Some(restricted_security_context()),
        volume_mounts: Some(mounts),
        args: Some(vec![
            "--mode".to_string(),
            "openshift".to_string(),
            "--config".to_string(),
            format!("{}/{}", EXPORTER_CONFIG_MOUNT_PATH, EXPORTER_CONFIG_FILENAME),
            "--log-level".to_string(),
            log_level,
            "--data-dir".to_string(),
            USER_DATA_MOUNT_PATH.to_string(),
        ]),
        resources: Some(resources_or_default(
            config.spec.ols.deployment.data_collector.resources.as_ref(),
            "200Mi",
            "50m",
            "64Mi",
        )),
        ..Default::default()
    }
}

fn mcp_container(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
    mounts: Vec<VolumeMount>,
) -> Container {
    Container {
        name: MCP_CONTAINER_NAME.to_string(),
        image: Some(operator.images.mcp_server.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        security_context: Some(restricted_security_context()),
        volume_mounts: Some(mounts),
        command: Some(vec![
            "/openshift-mcp-server".to_string(),
            "--read-only".to_string(),
            "--port".to_string(),
            MCP_SERVER_PORT.to_string(),
        ]),
        resources: Some(resources_or_default(
            config.spec.ols.deployment.mcp_server.resources.as_ref(),
            "200Mi",
            "50m",
            "64Mi",
        )),
        ..Default::default()
    }
}

/// One init container per RAG image, copying its index into the shared volume
fn rag_init_containers(config: &LightspeedConfig) -> Vec<Container> {
    config
        .spec
        .ols
        .rag
        .iter()
        .enumerate()
        .map(|(i, rag)| {
            let name = format!("rag-{}", i);
            let target = format!("{}/{}", RAG_MOUNT_PATH, name);
            Container {
                name,
                image: Some(rag.image.clone()),
                image_pull_policy: Some("Always".to_string()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("mkdir -p {} && cp -a {}/. {}", target, rag.index_path, target),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: RAG_VOLUME.to_string(),
                    mount_path: RAG_MOUNT_PATH.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }
        })
        .collect()
}

/// Build the app server Deployment.
///
/// Containers are `[api, exporter?, mcp sidecar?]`: the exporter runs only
/// while user data is collected and the sidecar only with introspection.
/// Fails when two references claim the same volume name for different
/// sources.
pub fn build_deployment(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
    telemetry_enabled: bool,
) -> Result<Deployment> {
    let spec = &config.spec;
    let labels = app_server_labels();
    let storage = pod_storage(config, telemetry_enabled)?;
    let mounts = storage.mounts();

    let mut containers = vec![api_container(config, operator, mounts.clone())];
    if data_collection_enabled(config, telemetry_enabled) {
        containers.push(exporter_container(config, operator, mounts.clone()));
    }
    if spec.ols.introspection_enabled {
        containers.push(mcp_container(config, operator, mounts));
    }

    let init_containers = rag_init_containers(config);

    let mut pod_spec = PodSpec {
        containers,
        init_containers: if init_containers.is_empty() {
            None
        } else {
            Some(init_containers)
        },
        volumes: Some(storage.volumes()),
        service_account_name: Some(APP_SERVER_NAME.to_string()),
        ..Default::default()
    };

    apply_scheduling(&mut pod_spec, &spec.ols.deployment.api);

    let replicas = spec.ols.deployment.replicas.filter(|r| *r >= 0).unwrap_or(1);

    Ok(Deployment {
        metadata: owned_meta(
            config,
            APP_SERVER_NAME,
            Some(&operator.namespace),
            labels.clone(),
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            revision_history_limit: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    })
}

//! Conversation cache objects: the postgres Deployment and the config,
//! bootstrap script, credentials and storage it runs with

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Secret, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;

use super::deployment_builder::{
    apply_scheduling, resources_or_default, restricted_security_context, PodStorage, TMP_VOLUME,
    VOLUME_DEFAULT_MODE,
};
use super::meta::{
    cache_server_labels, owned_meta, CACHE_BOOTSTRAP_FILENAME, CACHE_BOOTSTRAP_SECRET_NAME,
    CACHE_CERTS_SECRET_NAME, CACHE_CONFIG_CM_NAME, CACHE_CONFIG_FILENAME, CACHE_PVC_NAME,
    CACHE_SERVER_NAME, CACHE_SERVER_PORT, CERTS_MOUNT_ROOT, SERVICE_CA_CM_NAME,
};
use crate::config::OperatorConfig;
use crate::crd::LightspeedConfig;
use crate::resolver::CACHE_PASSWORD_KEY;
use crate::Result;

const PASSWORD_LENGTH: usize = 24;
const DEFAULT_STORAGE_SIZE: &str = "1Gi";
const CERTS_DEFAULT_MODE: i32 = 0o600;

const CERTS_VOLUME: &str = "secret-lightspeed-postgres-certs";
const BOOTSTRAP_VOLUME: &str = "secret-lightspeed-postgres-bootstrap";
const CONFIG_VOLUME: &str = "lightspeed-postgres-conf";
const DATA_VOLUME: &str = "postgres-data";
const SERVICE_CA_VOLUME: &str = "cm-olspostgresca";
const VAR_RUN_VOLUME: &str = "lightspeed-postgres-var-run";

const BOOTSTRAP_MOUNT_PATH: &str = "/usr/share/container-scripts/postgresql/start/create-extensions.sh";
const CONFIG_MOUNT_PATH: &str = "/usr/share/pgsql/postgresql.conf.sample";
const DATA_MOUNT_PATH: &str = "/var/lib/pgsql";
const VAR_RUN_MOUNT_PATH: &str = "/var/run/postgresql";

const CACHE_CONFIG: &str = "huge_pages = off
ssl = on
ssl_cert_file = '/etc/certs/tls.crt'
ssl_key_file = '/etc/certs/tls.key'
ssl_ca_file = '/etc/certs/cm-olspostgresca/service-ca.crt'
";

const BOOTSTRAP_SCRIPT: &str = r#"#!/bin/bash

echo "attempting to create pg_trgm extension and cache schemas if they do not exist"

_psql () { psql --set ON_ERROR_STOP=1 "$@" ; }

echo "CREATE EXTENSION IF NOT EXISTS pg_trgm;" | _psql -d $POSTGRESQL_DATABASE
echo "CREATE SCHEMA IF NOT EXISTS quota;" | _psql -d $POSTGRESQL_DATABASE
echo "CREATE SCHEMA IF NOT EXISTS conversation_cache;" | _psql -d $POSTGRESQL_DATABASE
"#;

fn cache_meta(config: &LightspeedConfig, operator: &OperatorConfig, name: &str) -> ObjectMeta {
    owned_meta(
        config,
        name,
        Some(&operator.namespace),
        cache_server_labels(),
    )
}

/// Random alphanumeric database password
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Credentials secret generated when the configured one does not exist.
/// Never compiled into the desired set: an existing secret is not touched.
pub fn build_cache_secret(config: &LightspeedConfig, operator: &OperatorConfig) -> Secret {
    let name = &config.spec.ols.conversation_cache.postgres.credentials_secret;
    Secret {
        metadata: cache_meta(config, operator, name),
        data: Some(BTreeMap::from([(
            CACHE_PASSWORD_KEY.to_string(),
            ByteString(generate_password().into_bytes()),
        )])),
        ..Default::default()
    }
}

pub fn build_cache_config_map(config: &LightspeedConfig, operator: &OperatorConfig) -> ConfigMap {
    ConfigMap {
        metadata: cache_meta(config, operator, CACHE_CONFIG_CM_NAME),
        data: Some(BTreeMap::from([(
            CACHE_CONFIG_FILENAME.to_string(),
            CACHE_CONFIG.to_string(),
        )])),
        ..Default::default()
    }
}

/// Script run by the postgres image on first start
pub fn build_cache_bootstrap_secret(config: &LightspeedConfig, operator: &OperatorConfig) -> Secret {
    Secret {
        metadata: cache_meta(config, operator, CACHE_BOOTSTRAP_SECRET_NAME),
        string_data: Some(BTreeMap::from([(
            CACHE_BOOTSTRAP_FILENAME.to_string(),
            BOOTSTRAP_SCRIPT.to_string(),
        )])),
        ..Default::default()
    }
}

/// Claim for the database files, only when persistent storage is configured
pub fn build_cache_pvc(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> Option<PersistentVolumeClaim> {
    let storage = config.spec.ols.storage.as_ref()?;
    let size = storage
        .size
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_STORAGE_SIZE.to_string());

    Some(PersistentVolumeClaim {
        metadata: cache_meta(config, operator, CACHE_PVC_NAME),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                ..Default::default()
            }),
            storage_class_name: storage.class.clone().filter(|c| !c.is_empty()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn cache_storage(config: &LightspeedConfig) -> Result<PodStorage> {
    let mut storage = PodStorage::default();

    // postgres refuses a key readable by group or others
    storage.add(
        Volume {
            name: CERTS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(CACHE_CERTS_SECRET_NAME.to_string()),
                default_mode: Some(CERTS_DEFAULT_MODE),
                ..Default::default()
            }),
            ..Default::default()
        },
        Some(VolumeMount {
            name: CERTS_VOLUME.to_string(),
            mount_path: CERTS_MOUNT_ROOT.to_string(),
            read_only: Some(true),
            ..Default::default()
        }),
    )?;
    storage.config_map(
        SERVICE_CA_VOLUME,
        SERVICE_CA_CM_NAME,
        format!("{}/{}", CERTS_MOUNT_ROOT, SERVICE_CA_VOLUME),
    )?;

    storage.add(
        Volume {
            name: BOOTSTRAP_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(CACHE_BOOTSTRAP_SECRET_NAME.to_string()),
                default_mode: Some(VOLUME_DEFAULT_MODE),
                ..Default::default()
            }),
            ..Default::default()
        },
        Some(VolumeMount {
            name: BOOTSTRAP_VOLUME.to_string(),
            mount_path: BOOTSTRAP_MOUNT_PATH.to_string(),
            sub_path: Some(CACHE_BOOTSTRAP_FILENAME.to_string()),
            read_only: Some(true),
            ..Default::default()
        }),
    )?;
    storage.add(
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: CACHE_CONFIG_CM_NAME.to_string(),
                default_mode: Some(VOLUME_DEFAULT_MODE),
                ..Default::default()
            }),
            ..Default::default()
        },
        Some(VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            sub_path: Some(CACHE_CONFIG_FILENAME.to_string()),
            ..Default::default()
        }),
    )?;

    if config.spec.ols.storage.is_some() {
        storage.add(
            Volume {
                name: DATA_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: CACHE_PVC_NAME.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Some(VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            }),
        )?;
    } else {
        storage.empty_dir(DATA_VOLUME, Some(DATA_MOUNT_PATH.to_string()))?;
    }

    storage.empty_dir(VAR_RUN_VOLUME, Some(VAR_RUN_MOUNT_PATH.to_string()))?;
    storage.empty_dir(TMP_VOLUME, Some("/tmp".to_string()))?;

    Ok(storage)
}

fn password_env(name: &str, secret: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: CACHE_PASSWORD_KEY.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Build the single-replica postgres Deployment. The password is read from
/// the credentials secret by the kubelet, so rotating the secret restarts
/// the pod through the dependency stamps rather than a spec change.
pub fn build_cache_deployment(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> Result<Deployment> {
    let postgres = &config.spec.ols.conversation_cache.postgres;
    let overrides = &config.spec.ols.deployment.database;
    let labels = cache_server_labels();
    let storage = cache_storage(config)?;

    let container = Container {
        name: CACHE_SERVER_NAME.to_string(),
        image: Some(operator.images.cache_server.clone()),
        image_pull_policy: Some("Always".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("server".to_string()),
            container_port: CACHE_SERVER_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        security_context: Some(restricted_security_context()),
        volume_mounts: Some(storage.mounts()),
        env: Some(vec![
            value_env("POSTGRESQL_USER", postgres.user.clone()),
            value_env("POSTGRESQL_DATABASE", postgres.db_name.clone()),
            password_env("POSTGRESQL_ADMIN_PASSWORD", &postgres.credentials_secret),
            password_env("POSTGRESQL_PASSWORD", &postgres.credentials_secret),
            value_env("POSTGRESQL_SHARED_BUFFERS", postgres.shared_buffers.clone()),
            value_env(
                "POSTGRESQL_MAX_CONNECTIONS",
                postgres.max_connections.to_string(),
            ),
        ]),
        resources: Some(resources_or_default(
            overrides.resources.as_ref(),
            "2Gi",
            "30m",
            "300Mi",
        )),
        ..Default::default()
    };

    let mut pod_spec = PodSpec {
        containers: vec![container],
        volumes: Some(storage.volumes()),
        ..Default::default()
    };
    apply_scheduling(&mut pod_spec, overrides);

    Ok(Deployment {
        metadata: cache_meta(config, operator, CACHE_SERVER_NAME),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
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

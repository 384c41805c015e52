//! Integration tests for the equality oracle

mod common;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, ExecAction, Probe, Secret, SecretVolumeSource,
    Volume,
};
use std::collections::BTreeMap;

use common::{base_config, labels, operator_config};
use lightspeed_operator::adapters::cache_builder::{build_cache_bootstrap_secret, build_cache_pvc};
use lightspeed_operator::adapters::console_builder::build_console_plugin;
use lightspeed_operator::adapters::deployment_builder::build_deployment;
use lightspeed_operator::crd::StorageSpec;
use lightspeed_operator::equality::{
    config_map_equal, console_plugin_equal, container_equal, containers_equal, deployment_equal,
    env_equal, is_subset, persistent_volume_claim_equal, probe_equal, secret_equal,
    set_deployment_defaults, volumes_equal,
};

fn desired_deployment() -> Deployment {
    let mut config = base_config();
    config.spec.ols.introspection_enabled = true;
    build_deployment(&config, &operator_config(), true).expect("deployment builds")
}

fn pod_spec_mut(d: &mut Deployment) -> &mut k8s_openapi::api::core::v1::PodSpec {
    d.spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .expect("pod spec")
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            default_mode: Some(0o644),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn exec_probe(period: Option<i32>, timeout: Option<i32>) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec!["true".to_string()]),
        }),
        period_seconds: period,
        timeout_seconds: timeout,
        ..Default::default()
    }
}

// ============================================================================
// Deployment
// ============================================================================

#[test]
fn desired_deployment_equals_itself() {
    let desired = desired_deployment();
    assert!(deployment_equal(&desired, &desired));
}

#[test]
fn server_defaults_are_not_drift() {
    let desired = desired_deployment();
    let mut live = desired.clone();
    set_deployment_defaults(&mut live);
    live.status = Some(Default::default());

    let spec = live.spec.as_ref().unwrap();
    assert_eq!(
        spec.strategy.as_ref().and_then(|s| s.type_.as_deref()),
        Some("RollingUpdate")
    );
    assert_eq!(spec.progress_deadline_seconds, Some(600));
    assert!(deployment_equal(&live, &desired));
}

#[test]
fn reordered_volumes_and_containers_are_equal() {
    let desired = desired_deployment();
    let mut live = desired.clone();
    let pod = pod_spec_mut(&mut live);
    pod.volumes.as_mut().unwrap().reverse();
    pod.containers.reverse();

    assert!(deployment_equal(&live, &desired));
}

#[test]
fn image_change_is_drift() {
    let desired = desired_deployment();
    let mut live = desired.clone();
    pod_spec_mut(&mut live).containers[0].image = Some("registry.test/old:0.9".to_string());

    assert!(!deployment_equal(&live, &desired));
}

#[test]
fn replica_change_is_drift() {
    let desired = desired_deployment();
    let mut live = desired.clone();
    live.spec.as_mut().unwrap().replicas = Some(3);

    assert!(!deployment_equal(&live, &desired));
}

#[test]
fn template_annotations_are_ignored() {
    let desired = desired_deployment();
    let mut live = desired.clone();
    live.spec
        .as_mut()
        .unwrap()
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations = Some(labels(&[("lightspeed.io/force-reload", "2026-01-01T00:00:00Z")]));

    assert!(deployment_equal(&live, &desired));
}

#[test]
fn extra_template_labels_on_live_are_tolerated() {
    let desired = desired_deployment();
    let mut live = desired.clone();
    let meta = live
        .spec
        .as_mut()
        .unwrap()
        .template
        .metadata
        .get_or_insert_with(Default::default);
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert("pod-template-hash".to_string(), "abc123".to_string());

    assert!(deployment_equal(&live, &desired));
}

#[test]
fn missing_spec_is_never_equal() {
    let desired = desired_deployment();
    assert!(!deployment_equal(&Deployment::default(), &desired));
}

// ============================================================================
// Volumes and Env
// ============================================================================

#[test]
fn volumes_compare_by_source_only() {
    let a = vec![secret_volume("creds", "openai-creds")];
    let mut b = a.clone();
    b[0].secret.as_mut().unwrap().default_mode = Some(0o420);
    assert!(volumes_equal(&a, &b));

    b[0].secret.as_mut().unwrap().secret_name = Some("other".to_string());
    assert!(!volumes_equal(&a, &b));
}

#[test]
fn duplicate_names_are_unequal() {
    let a = vec![
        secret_volume("creds", "openai-creds"),
        secret_volume("creds", "openai-creds"),
    ];
    let b = vec![
        secret_volume("creds", "openai-creds"),
        secret_volume("other", "openai-creds"),
    ];
    assert!(!volumes_equal(&a, &b));
    assert!(!volumes_equal(&b, &a));
}

#[test]
fn different_volume_kinds_are_unequal() {
    let a = vec![secret_volume("data", "x")];
    let b = vec![Volume {
        name: "data".to_string(),
        empty_dir: Some(Default::default()),
        ..Default::default()
    }];
    assert!(!volumes_equal(&a, &b));
}

#[test]
fn env_order_does_not_matter() {
    let var = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    };
    let a = vec![var("HTTPS_PROXY", "http://proxy:3128"), var("NO_PROXY", ".svc")];
    let b = vec![var("NO_PROXY", ".svc"), var("HTTPS_PROXY", "http://proxy:3128")];
    assert!(env_equal(&a, &b));

    let c = vec![var("NO_PROXY", ".cluster"), var("HTTPS_PROXY", "http://proxy:3128")];
    assert!(!env_equal(&a, &c));
}

// ============================================================================
// Containers and Probes
// ============================================================================

#[test]
fn unset_or_zero_probe_timings_are_not_compared() {
    let a = exec_probe(Some(10), None);
    let b = exec_probe(Some(10), Some(1));
    assert!(probe_equal(Some(&a), Some(&b)));

    let c = exec_probe(Some(0), Some(1));
    assert!(probe_equal(Some(&a), Some(&c)));

    let d = exec_probe(Some(30), None);
    assert!(!probe_equal(Some(&a), Some(&d)));
}

#[test]
fn probe_handler_must_match() {
    let a = exec_probe(Some(10), None);
    let mut b = a.clone();
    b.exec = Some(ExecAction {
        command: Some(vec!["false".to_string()]),
    });
    assert!(!probe_equal(Some(&a), Some(&b)));
    assert!(!probe_equal(Some(&a), None));
    assert!(probe_equal(None, None));
}

#[test]
fn port_protocol_defaults_to_tcp() {
    let port = |protocol: Option<&str>| ContainerPort {
        container_port: 8443,
        name: Some("https".to_string()),
        protocol: protocol.map(str::to_string),
        ..Default::default()
    };
    let a = Container {
        name: "api".to_string(),
        ports: Some(vec![port(None)]),
        ..Default::default()
    };
    let mut b = a.clone();
    b.ports = Some(vec![port(Some("TCP"))]);
    assert!(container_equal(&a, &b));

    b.ports = Some(vec![port(Some("UDP"))]);
    assert!(!container_equal(&a, &b));
}

#[test]
fn container_lists_differing_in_size_are_unequal() {
    let c = |name: &str| Container {
        name: name.to_string(),
        ..Default::default()
    };
    assert!(!containers_equal(&[c("api")], &[c("api"), c("exporter")]));
    assert!(containers_equal(&[c("api"), c("exporter")], &[c("exporter"), c("api")]));
}

// ============================================================================
// Metadata and Other Kinds
// ============================================================================

#[test]
fn labels_are_compared_as_subset() {
    let desired = Some(labels(&[("app.kubernetes.io/name", "lightspeed-service-api")]));
    let live = Some(labels(&[
        ("app.kubernetes.io/name", "lightspeed-service-api"),
        ("added-by", "someone-else"),
    ]));
    assert!(is_subset(&desired, &live));
    assert!(!is_subset(&live, &desired));
    assert!(is_subset(&None, &live));
}

#[test]
fn config_map_data_must_match_exactly() {
    let desired = common::config_map("olsconfig", &[("olsconfig.yaml", "a: 1\n")]);
    let mut live = desired.clone();
    live.metadata.resource_version = Some("42".to_string());
    assert!(config_map_equal(&live, &desired));

    live.data = Some(BTreeMap::from([(
        "olsconfig.yaml".to_string(),
        "a: 2\n".to_string(),
    )]));
    assert!(!config_map_equal(&live, &desired));

    let empty = ConfigMap::default();
    let mut no_data = empty.clone();
    no_data.data = Some(BTreeMap::new());
    assert!(config_map_equal(&empty, &no_data));
}

#[test]
fn token_secret_data_is_ignored() {
    let mut desired = Secret {
        type_: Some("kubernetes.io/service-account-token".to_string()),
        ..Default::default()
    };
    desired.metadata.name = Some("metrics-reader-token".to_string());
    let mut live = common::secret("metrics-reader-token", &[("token", "issued-by-platform")]);
    live.type_ = desired.type_.clone();

    assert!(secret_equal(&live, &desired));

    live.type_ = Some("Opaque".to_string());
    assert!(!secret_equal(&live, &desired));
}

#[test]
fn secret_payload_is_compared_when_desired() {
    let desired = build_cache_bootstrap_secret(&base_config(), &operator_config());
    let script = desired.string_data.clone().unwrap()["create-extensions.sh"].clone();

    // What the API server returns: the script moved into data
    let mut live = common::secret("lightspeed-postgres-bootstrap", &[("create-extensions.sh", &script)]);
    live.metadata.labels = desired.metadata.labels.clone();
    assert!(secret_equal(&live, &desired));

    let mut edited = common::secret("lightspeed-postgres-bootstrap", &[("create-extensions.sh", "exit 0")]);
    edited.metadata.labels = desired.metadata.labels.clone();
    assert!(!secret_equal(&edited, &desired));
}

#[test]
fn claim_spec_is_not_compared() {
    let mut config = base_config();
    config.spec.ols.storage = Some(StorageSpec::default());
    let desired = build_cache_pvc(&config, &operator_config()).expect("claim with storage");

    let mut live = desired.clone();
    live.spec.as_mut().unwrap().volume_name = Some("pvc-0d6bc8a4".to_string());
    live.spec.as_mut().unwrap().storage_class_name = Some("gp3-csi".to_string());
    assert!(persistent_volume_claim_equal(&live, &desired));

    live.metadata.labels = None;
    assert!(!persistent_volume_claim_equal(&live, &desired));
}

#[test]
fn console_plugin_proxy_ca_is_compared() {
    let config = base_config();
    let desired = build_console_plugin(&config, &operator_config(), None);
    let live = build_console_plugin(&config, &operator_config(), Some("-----BEGIN CERTIFICATE-----"));

    assert!(console_plugin_equal(&desired.clone(), &desired));
    assert!(!console_plugin_equal(&live, &desired));
}

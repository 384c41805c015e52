//! Kubernetes Service builders for the operand pods

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use super::meta::{
    app_server_labels, cache_server_labels, console_plugin_labels, owned_meta, APP_SERVER_NAME,
    APP_SERVER_PORT, CACHE_CERTS_SECRET_NAME, CACHE_SERVER_NAME, CACHE_SERVER_PORT,
    CONSOLE_CERT_SECRET_NAME, CONSOLE_PLUGIN_NAME, CONSOLE_PLUGIN_PORT, SERVING_CERT_ANNOTATION,
    SERVING_CERT_SECRET_NAME,
};
use crate::config::OperatorConfig;
use crate::crd::LightspeedConfig;

/// Whether the config brings its own serving certificate
pub fn has_user_tls(config: &LightspeedConfig) -> bool {
    config
        .spec
        .ols
        .tls_config
        .as_ref()
        .is_some_and(|t| !t.key_cert_secret_ref.name.is_empty())
}

/// Build the Service for the app server.
///
/// Without a user TLS secret the Service asks the platform service CA to
/// issue one into the default serving-cert secret.
pub fn build_service(config: &LightspeedConfig, operator: &OperatorConfig) -> Service {
    let labels = app_server_labels();
    let mut metadata = owned_meta(
        config,
        APP_SERVER_NAME,
        Some(&operator.namespace),
        labels.clone(),
    );

    if !has_user_tls(config) {
        metadata.annotations = serving_cert_annotation(SERVING_CERT_SECRET_NAME);
    }

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: APP_SERVER_PORT,
                target_port: Some(IntOrString::String("https".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn serving_cert_annotation(secret: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([(
        SERVING_CERT_ANNOTATION.to_string(),
        secret.to_string(),
    )]))
}

/// Service in front of the conversation cache; its certificate is always
/// issued by the platform service CA
pub fn build_cache_service(config: &LightspeedConfig, operator: &OperatorConfig) -> Service {
    let labels = cache_server_labels();
    let mut metadata = owned_meta(
        config,
        CACHE_SERVER_NAME,
        Some(&operator.namespace),
        labels.clone(),
    );
    metadata.annotations = serving_cert_annotation(CACHE_CERTS_SECRET_NAME);

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(labels),
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("server".to_string()),
                port: CACHE_SERVER_PORT,
                target_port: Some(IntOrString::String("server".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_console_service(config: &LightspeedConfig, operator: &OperatorConfig) -> Service {
    let labels = console_plugin_labels();
    let mut metadata = owned_meta(
        config,
        CONSOLE_PLUGIN_NAME,
        Some(&operator.namespace),
        labels.clone(),
    );
    metadata.annotations = serving_cert_annotation(CONSOLE_CERT_SECRET_NAME);

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: CONSOLE_PLUGIN_PORT,
                target_port: Some(IntOrString::String("https".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

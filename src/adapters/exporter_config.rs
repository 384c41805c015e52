//! Data exporter sidecar configuration

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::meta::{
    app_server_labels, owned_meta, EXPORTER_CONFIG_CM_NAME, EXPORTER_CONFIG_FILENAME,
    RHOSO_OWNER_LABEL,
};
use crate::config::OperatorConfig;
use crate::crd::LightspeedConfig;
use crate::Result;

pub const SERVICE_ID_DEFAULT: &str = "ols";
pub const SERVICE_ID_RHOSO: &str = "rhoso_lightspeed";
const INGRESS_SERVER_URL: &str = "https://console.redhat.com/api/ingress/v1/upload";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    pub service_id: String,
    pub ingress_server_url: String,
    pub allowed_subdirs: Vec<String>,
    pub collection_interval: u32,
    pub cleanup_after_send: bool,
    pub ingress_connection_timeout: u32,
}

/// User data is collected when at least one kind is not opted out and the
/// platform has telemetry enabled.
pub fn data_collection_enabled(config: &LightspeedConfig, telemetry_enabled: bool) -> bool {
    let udc = &config.spec.ols.user_data_collection;
    (!udc.feedback_disabled || !udc.transcripts_disabled) && telemetry_enabled
}

pub fn service_id(config: &LightspeedConfig) -> &'static str {
    if config.labels().contains_key(RHOSO_OWNER_LABEL) {
        SERVICE_ID_RHOSO
    } else {
        SERVICE_ID_DEFAULT
    }
}

pub fn build_exporter_config(config: &LightspeedConfig) -> ExporterConfig {
    ExporterConfig {
        service_id: service_id(config).to_string(),
        ingress_server_url: INGRESS_SERVER_URL.to_string(),
        allowed_subdirs: vec!["feedback".to_string(), "transcripts".to_string()],
        collection_interval: 300,
        cleanup_after_send: true,
        ingress_connection_timeout: 30,
    }
}

pub fn build_exporter_config_map(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> Result<ConfigMap> {
    let rendered = serde_yaml::to_string(&build_exporter_config(config))?;

    Ok(ConfigMap {
        metadata: owned_meta(
            config,
            EXPORTER_CONFIG_CM_NAME,
            Some(&operator.namespace),
            app_server_labels(),
        ),
        data: Some(BTreeMap::from([(
            EXPORTER_CONFIG_FILENAME.to_string(),
            rendered,
        )])),
        ..Default::default()
    })
}

//! Typed views of the platform console resources the operator touches.
//! Only the fields the operator writes are modelled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "console.openshift.io",
    version = "v1",
    kind = "ConsolePlugin",
    plural = "consoleplugins"
)]
#[serde(rename_all = "camelCase")]
pub struct ConsolePluginSpec {
    pub backend: PluginBackend,
    pub display_name: String,
    pub i18n: PluginI18n,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy: Vec<PluginProxy>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PluginBackend {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<PluginService>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginService {
    pub name: String,
    pub namespace: String,
    pub port: i32,
    pub base_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginI18n {
    pub load_type: String,
}

/// Console proxy route from the plugin to a backend service
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginProxy {
    pub alias: String,
    pub authorization: String,
    pub endpoint: ProxyEndpoint,

    /// PEM bundle trusted for the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ProxyEndpoint {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ProxyService>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ProxyService {
    pub name: String,
    pub namespace: String,
    pub port: i32,
}

/// The console operator configuration. Everything besides the enabled
/// plugins is carried through untouched.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[kube(
    group = "operator.openshift.io",
    version = "v1",
    kind = "Console",
    plural = "consoles",
    schema = "disabled"
)]
pub struct ConsoleSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

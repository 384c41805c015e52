//! Enumeration of the external objects a config consumes

use std::fmt;

use super::{ExternalKey, ExternalKind};
use crate::adapters::meta::{PROXY_CA_FILENAME, ROOT_CA_CM_NAME};
use crate::crd::{LightspeedConfig, FEATURE_GATE_MCP_SERVER};

pub const AZURE_OPENAI_TYPE: &str = "azure_openai";
/// Header value standing for the pod's own service account token
pub const KUBERNETES_TOKEN_SENTINEL: &str = "kubernetes";
pub const MCP_HEADER_KEY: &str = "header";
pub const CACHE_PASSWORD_KEY: &str = "password";
pub const CACHE_REFERRER: &str = "conversation cache";

/// What an external object is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyRole {
    ProviderCredentials,
    ServingCert,
    McpHeader,
    CacheCredentials,
    AdditionalCa,
    ProxyCa,
    RootCa,
}

impl DependencyRole {
    /// Noun used in error messages
    pub fn describe(&self) -> &'static str {
        match self {
            DependencyRole::ProviderCredentials => "credential secret",
            DependencyRole::ServingCert => "TLS secret",
            DependencyRole::McpHeader => "header secret",
            DependencyRole::CacheCredentials => "credentials secret",
            DependencyRole::AdditionalCa => "CA configmap",
            DependencyRole::ProxyCa => "CA configmap",
            DependencyRole::RootCa => "configmap",
        }
    }
}

/// Keys an external object must carry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// Every listed key
    Keys(Vec<&'static str>),
    /// All keys of the first list, or else all keys of the second
    Either(Vec<&'static str>, Vec<&'static str>),
    /// The key must exist and hold a PEM certificate
    Certificate(&'static str),
    /// Every entry must be a PEM certificate
    Certificates,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalReference {
    pub key: ExternalKey,
    pub role: DependencyRole,
    /// Which part of the config refers to the object
    pub referrer: String,
    pub requirement: Requirement,
    /// Whether the object gets a watcher stamp
    pub stamp: bool,
}

impl fmt::Display for ExternalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.referrer, self.role.describe(), self.key.name)
    }
}

impl ExternalReference {
    fn secret(
        namespace: &str,
        name: &str,
        role: DependencyRole,
        referrer: String,
        requirement: Requirement,
    ) -> Self {
        Self {
            key: ExternalKey::new(ExternalKind::Secret, namespace, name),
            role,
            referrer,
            requirement,
            stamp: true,
        }
    }

    fn config_map(
        namespace: &str,
        name: &str,
        role: DependencyRole,
        referrer: String,
        requirement: Requirement,
    ) -> Self {
        Self {
            key: ExternalKey::new(ExternalKind::ConfigMap, namespace, name),
            role,
            referrer,
            requirement,
            stamp: true,
        }
    }
}

/// Every external object `config` depends on, in a stable order: provider
/// credentials in provider order, TLS, tool-server headers, cache
/// credentials, then trust bundles.
pub fn external_references(config: &LightspeedConfig, namespace: &str) -> Vec<ExternalReference> {
    let spec = &config.spec;
    let mut references = Vec::new();

    for provider in &spec.llm.providers {
        let requirement = if provider.type_ == AZURE_OPENAI_TYPE {
            Requirement::Either(
                vec!["apitoken"],
                vec!["client_id", "tenant_id", "client_secret"],
            )
        } else {
            Requirement::Keys(vec!["apitoken"])
        };
        references.push(ExternalReference::secret(
            namespace,
            &provider.credentials_secret_ref.name,
            DependencyRole::ProviderCredentials,
            format!("LLM provider {}", provider.name),
            requirement,
        ));
    }

    if let Some(tls) = spec
        .ols
        .tls_config
        .as_ref()
        .filter(|tls| !tls.key_cert_secret_ref.name.is_empty())
    {
        references.push(ExternalReference::secret(
            namespace,
            &tls.key_cert_secret_ref.name,
            DependencyRole::ServingCert,
            "TLS configuration".to_string(),
            Requirement::Keys(vec!["tls.crt", "tls.key"]),
        ));
    }

    if spec.feature_enabled(FEATURE_GATE_MCP_SERVER) {
        for server in &spec.mcp_servers {
            let Some(http) = &server.streamable_http else {
                continue;
            };
            for secret in http.headers.values() {
                if secret == KUBERNETES_TOKEN_SENTINEL {
                    continue;
                }
                references.push(ExternalReference::secret(
                    namespace,
                    secret,
                    DependencyRole::McpHeader,
                    format!("MCP server {}", server.name),
                    Requirement::Keys(vec![MCP_HEADER_KEY]),
                ));
            }
        }
    }

    references.push(ExternalReference::secret(
        namespace,
        &spec.ols.conversation_cache.postgres.credentials_secret,
        DependencyRole::CacheCredentials,
        CACHE_REFERRER.to_string(),
        Requirement::Keys(vec![CACHE_PASSWORD_KEY]),
    ));

    if let Some(ca) = spec
        .ols
        .additional_ca_config_map_ref
        .as_ref()
        .filter(|r| !r.name.is_empty())
    {
        references.push(ExternalReference::config_map(
            namespace,
            &ca.name,
            DependencyRole::AdditionalCa,
            "additional CA".to_string(),
            Requirement::Certificates,
        ));
    }

    if let Some(proxy_ca) = spec
        .ols
        .proxy_config
        .as_ref()
        .and_then(|p| p.proxy_ca_certificate_ref.as_ref())
        .filter(|r| !r.name.is_empty())
    {
        references.push(ExternalReference::config_map(
            namespace,
            &proxy_ca.name,
            DependencyRole::ProxyCa,
            "proxy".to_string(),
            Requirement::Certificate(PROXY_CA_FILENAME),
        ));
    }

    let mut root_ca = ExternalReference::config_map(
        namespace,
        ROOT_CA_CM_NAME,
        DependencyRole::RootCa,
        "platform trust bundle".to_string(),
        Requirement::Certificates,
    );
    root_ca.stamp = false;
    references.push(root_ca);

    references
}

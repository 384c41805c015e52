//! Shared fixtures for the integration tests

#![allow(dead_code)]

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lightspeed_operator::config::{Images, OperatorConfig, PlatformVersion};
use lightspeed_operator::crd::{
    LightspeedConfig, LightspeedConfigSpec, LlmSpec, LocalRef, ModelSpec, OlsSpec, ProviderSpec,
    SINGLETON_NAME,
};
use lightspeed_operator::reconcilers::Reconciler;
use lightspeed_operator::resolver::telemetry::{PULL_SECRET_NAME, PULL_SECRET_NAMESPACE};
use lightspeed_operator::resolver::WatchTable;
use lightspeed_operator::store::MemoryStore;

pub const NAMESPACE: &str = "openshift-lightspeed";
pub const PROVIDER_SECRET: &str = "openai-creds";
pub const CACHE_SECRET: &str = "lightspeed-postgres-secret";
pub const ROOT_CA: &str = "kube-root-ca.crt";

pub fn operator_config() -> OperatorConfig {
    OperatorConfig {
        namespace: NAMESPACE.to_string(),
        images: Images {
            app_server: "registry.test/lightspeed-service-api:1.0".to_string(),
            data_exporter: "registry.test/dataverse-exporter:1.0".to_string(),
            mcp_server: "registry.test/openshift-mcp-server:1.0".to_string(),
            cache_server: "registry.test/postgresql-16:1.0".to_string(),
            console_plugin: "registry.test/lightspeed-console-plugin:1.0".to_string(),
        },
        platform_version: PlatformVersion::new(4, 16),
        prometheus_available: true,
        proxy_env: BTreeMap::new(),
        reconcile_interval: Duration::from_secs(60),
    }
}

pub fn provider(name: &str, type_: &str, secret: &str) -> ProviderSpec {
    ProviderSpec {
        name: name.to_string(),
        type_: type_.to_string(),
        url: Some(format!("https://{}.example.com/v1", name)),
        credentials_secret_ref: LocalRef {
            name: secret.to_string(),
        },
        models: vec![ModelSpec {
            name: "gpt-4o-mini".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// A single openai provider, everything else defaulted
pub fn base_config() -> LightspeedConfig {
    let mut config = LightspeedConfig::new(
        SINGLETON_NAME,
        LightspeedConfigSpec {
            llm: LlmSpec {
                providers: vec![provider("openai", "openai", PROVIDER_SECRET)],
            },
            ols: OlsSpec {
                default_model: Some("gpt-4o-mini".to_string()),
                default_provider: Some("openai".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    config.metadata.uid = Some("0d6bc8a4-config".to_string());
    config
}

pub fn pem_certificate() -> String {
    rcgen::generate_simple_self_signed(vec!["lightspeed.test".to_string()])
        .expect("generate certificate")
        .cert
        .pem()
}

pub fn pem_private_key() -> String {
    rcgen::generate_simple_self_signed(vec!["lightspeed.test".to_string()])
        .expect("generate certificate")
        .key_pair
        .serialize_pem()
}

pub fn secret(name: &str, entries: &[(&str, &str)]) -> Secret {
    secret_in(NAMESPACE, name, entries)
}

pub fn secret_in(namespace: &str, name: &str, entries: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

pub fn config_map(name: &str, entries: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Store holding the provider secret, the cache secret and the platform
/// root CA bundle
pub fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .insert(secret(PROVIDER_SECRET, &[("apitoken", "sk-test")]))
        .expect("seed provider secret");
    store
        .insert(secret(CACHE_SECRET, &[("password", "hunter2")]))
        .expect("seed cache secret");
    store
        .insert(config_map(ROOT_CA, &[("ca.crt", &pem_certificate())]))
        .expect("seed root CA");
    store
}

pub fn enable_telemetry(store: &MemoryStore) {
    let payload = r#"{"auths":{"cloud.openshift.com":{"auth":"dG9rZW4=","email":"ops@example.com"}}}"#;
    store
        .insert(secret_in(
            PULL_SECRET_NAMESPACE,
            PULL_SECRET_NAME,
            &[(".dockerconfigjson", payload)],
        ))
        .expect("seed pull secret");
}

pub fn disable_telemetry(store: &MemoryStore) {
    store.remove::<Secret>(Some(PULL_SECRET_NAMESPACE), PULL_SECRET_NAME);
}

pub fn reconciler(store: Arc<MemoryStore>) -> Reconciler<MemoryStore> {
    Reconciler::new(store, Arc::new(operator_config()), WatchTable::new())
}

/// Store the config so status writes have a target, returning it as stored
pub fn store_config(store: &MemoryStore, config: LightspeedConfig) -> LightspeedConfig {
    store.insert(config).expect("store config")
}

pub fn stored_config(store: &MemoryStore) -> LightspeedConfig {
    store
        .object::<LightspeedConfig>(None, SINGLETON_NAME)
        .expect("config in store")
}

/// Replace the entries of a stored secret, bumping its resourceVersion
pub fn rotate_secret(store: &MemoryStore, name: &str, entries: &[(&str, &str)]) {
    let mut current = store
        .object::<Secret>(Some(NAMESPACE), name)
        .expect("secret in store");
    current.data = secret(name, entries).data;
    store.insert(current).expect("rotate secret");
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

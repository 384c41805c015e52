//! Integration tests for external dependency resolution

mod common;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use std::collections::BTreeMap;

use common::{base_config, config_map, secret, seeded_store, NAMESPACE, PROVIDER_SECRET, ROOT_CA};
use lightspeed_operator::adapters::meta::WATCHER_ANNOTATION;
use lightspeed_operator::crd::{
    LocalRef, McpServerSpec, McpStreamableHttpSpec, ProxyConfigSpec, FEATURE_GATE_MCP_SERVER,
};
use lightspeed_operator::resolver::telemetry::{pull_secret_enables_telemetry, telemetry_enabled};
use lightspeed_operator::resolver::{
    external_references, resolve, DependencyRole, ExternalKey, ExternalKind, WatchTable,
};
use lightspeed_operator::store::MemoryStore;
use lightspeed_operator::Error;

fn key(kind: ExternalKind, name: &str) -> ExternalKey {
    ExternalKey::new(kind, NAMESPACE, name)
}

// ============================================================================
// Reference Enumeration
// ============================================================================

#[test]
fn references_follow_a_stable_order() {
    let mut config = base_config();
    config.spec.llm.providers.push(common::provider("azure", "azure_openai", "azure-creds"));
    config.spec.ols.additional_ca_config_map_ref = Some(LocalRef {
        name: "ca-bundle".to_string(),
    });

    let names: Vec<_> = external_references(&config, NAMESPACE)
        .into_iter()
        .map(|r| (r.key.kind, r.key.name))
        .collect();

    assert_eq!(
        names,
        vec![
            (ExternalKind::Secret, PROVIDER_SECRET.to_string()),
            (ExternalKind::Secret, "azure-creds".to_string()),
            (ExternalKind::Secret, common::CACHE_SECRET.to_string()),
            (ExternalKind::ConfigMap, "ca-bundle".to_string()),
            (ExternalKind::ConfigMap, ROOT_CA.to_string()),
        ]
    );
}

#[test]
fn kubernetes_header_sentinel_is_not_a_reference() {
    let mut config = base_config();
    config.spec.feature_gates = vec![FEATURE_GATE_MCP_SERVER.to_string()];
    config.spec.mcp_servers = vec![McpServerSpec {
        name: "tools".to_string(),
        streamable_http: Some(McpStreamableHttpSpec {
            url: "https://tools.example.com/mcp".to_string(),
            timeout: 5,
            sse_read_timeout: 10,
            headers: BTreeMap::from([
                ("Authorization".to_string(), "kubernetes".to_string()),
                ("X-Api-Key".to_string(), "tools-header".to_string()),
            ]),
            enable_sse: false,
        }),
    }];

    let headers: Vec<_> = external_references(&config, NAMESPACE)
        .into_iter()
        .filter(|r| r.role == DependencyRole::McpHeader)
        .map(|r| r.key.name)
        .collect();
    assert_eq!(headers, vec!["tools-header".to_string()]);
}

#[test]
fn header_secrets_need_the_feature_gate() {
    let mut config = base_config();
    config.spec.mcp_servers = vec![McpServerSpec {
        name: "tools".to_string(),
        streamable_http: Some(McpStreamableHttpSpec {
            url: "https://tools.example.com/mcp".to_string(),
            timeout: 5,
            sse_read_timeout: 10,
            headers: BTreeMap::from([("X-Api-Key".to_string(), "tools-header".to_string())]),
            enable_sse: false,
        }),
    }];

    assert!(external_references(&config, NAMESPACE)
        .iter()
        .all(|r| r.role != DependencyRole::McpHeader));
}

// ============================================================================
// Resolution Errors
// ============================================================================

#[tokio::test]
async fn missing_credential_secret_names_provider_and_secret() {
    let store = seeded_store();
    store.remove::<Secret>(Some(NAMESPACE), PROVIDER_SECRET);

    let err = resolve(&store, &base_config(), NAMESPACE, &WatchTable::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingReference { .. }));
    assert_eq!(
        err.to_string(),
        "LLM provider openai credential secret openai-creds not found"
    );
    assert!(err.is_input_error());
}

#[tokio::test]
async fn missing_key_is_reported_with_key_name() {
    let store = seeded_store();
    store
        .insert(secret(PROVIDER_SECRET, &[("token", "sk-test")]))
        .unwrap();

    let err = resolve(&store, &base_config(), NAMESPACE, &WatchTable::new())
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "LLM provider openai credential secret openai-creds is missing key 'apitoken'"
    );
}

#[tokio::test]
async fn missing_cache_secret_is_attributed_to_the_cache() {
    let store = seeded_store();
    store.remove::<Secret>(Some(NAMESPACE), common::CACHE_SECRET);

    let err = resolve(&store, &base_config(), NAMESPACE, &WatchTable::new())
        .await
        .unwrap_err();

    assert_eq!(err.referrer(), Some("conversation cache"));
}

#[tokio::test]
async fn invalid_additional_ca_entry_is_rejected() {
    let store = seeded_store();
    store
        .insert(config_map(
            "ca-bundle",
            &[("bad.crt", "definitely not pem"), ("good.crt", &common::pem_certificate())],
        ))
        .unwrap();
    let mut config = base_config();
    config.spec.ols.additional_ca_config_map_ref = Some(LocalRef {
        name: "ca-bundle".to_string(),
    });

    let err = resolve(&store, &config, NAMESPACE, &WatchTable::new())
        .await
        .unwrap_err();

    assert!(err
        .to_string()
        .starts_with("additional CA configmap ca-bundle entry 'bad.crt' is not a valid certificate"));
}

#[tokio::test]
async fn proxy_ca_requires_its_certificate_key() {
    let store = seeded_store();
    store
        .insert(config_map("proxy-ca", &[("ca.crt", &common::pem_certificate())]))
        .unwrap();
    let mut config = base_config();
    config.spec.ols.proxy_config = Some(ProxyConfigSpec {
        proxy_url: Some("http://proxy.example.com:3128".to_string()),
        proxy_ca_certificate_ref: Some(LocalRef {
            name: "proxy-ca".to_string(),
        }),
    });

    let err = resolve(&store, &config, NAMESPACE, &WatchTable::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingKey { ref key, .. } if key == "proxy-ca.crt"));
}

#[tokio::test]
async fn read_failures_are_platform_errors() {
    let store = seeded_store();
    store.fail_reads::<Secret>(Some(NAMESPACE), PROVIDER_SECRET);

    let err = resolve(&store, &base_config(), NAMESPACE, &WatchTable::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::StoreError { .. }));
    assert!(!err.is_input_error());
}

// ============================================================================
// Azure Credential Alternatives
// ============================================================================

fn azure_config() -> lightspeed_operator::crd::LightspeedConfig {
    let mut config = base_config();
    config.spec.llm.providers = vec![common::provider("azure", "azure_openai", "azure-creds")];
    config
}

#[tokio::test]
async fn azure_accepts_api_token() {
    let store = seeded_store();
    store
        .insert(secret("azure-creds", &[("apitoken", "key")]))
        .unwrap();

    assert!(resolve(&store, &azure_config(), NAMESPACE, &WatchTable::new())
        .await
        .is_ok());
}

#[tokio::test]
async fn azure_accepts_client_credentials() {
    let store = seeded_store();
    store
        .insert(secret(
            "azure-creds",
            &[("client_id", "id"), ("tenant_id", "tenant"), ("client_secret", "secret")],
        ))
        .unwrap();

    assert!(resolve(&store, &azure_config(), NAMESPACE, &WatchTable::new())
        .await
        .is_ok());
}

#[tokio::test]
async fn azure_partial_client_credentials_name_the_missing_key() {
    let store = seeded_store();
    store
        .insert(secret("azure-creds", &[("client_id", "id")]))
        .unwrap();

    let err = resolve(&store, &azure_config(), NAMESPACE, &WatchTable::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingKey { ref key, .. } if key == "tenant_id"));
}

#[tokio::test]
async fn azure_with_nothing_asks_for_api_token() {
    let store = seeded_store();
    store
        .insert(secret("azure-creds", &[("unrelated", "x")]))
        .unwrap();

    let err = resolve(&store, &azure_config(), NAMESPACE, &WatchTable::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingKey { ref key, .. } if key == "apitoken"));
}

// ============================================================================
// Stamps and Edges
// ============================================================================

#[tokio::test]
async fn resolved_secrets_get_watcher_stamp_once() {
    let store = seeded_store();
    let watches = WatchTable::new();
    let config = base_config();

    let first = resolve(&store, &config, NAMESPACE, &watches).await.unwrap();
    let stamped: Secret = store.object(Some(NAMESPACE), PROVIDER_SECRET).unwrap();
    assert_eq!(
        stamped.annotations().get(WATCHER_ANNOTATION).map(String::as_str),
        Some("cluster")
    );

    let writes = store.write_count();
    let second = resolve(&store, &config, NAMESPACE, &watches).await.unwrap();
    assert_eq!(store.write_count(), writes);
    assert_eq!(first, second);
}

#[tokio::test]
async fn root_ca_is_resolved_but_not_stamped() {
    let store = seeded_store();
    let resolved = resolve(&store, &base_config(), NAMESPACE, &WatchTable::new())
        .await
        .unwrap();

    assert!(resolved.get(&key(ExternalKind::ConfigMap, ROOT_CA)).is_some());
    let root: ConfigMap = store.object(Some(NAMESPACE), ROOT_CA).unwrap();
    assert!(!root.annotations().contains_key(WATCHER_ANNOTATION));
}

#[tokio::test]
async fn resolved_objects_carry_version_keys_and_hash() {
    let store = seeded_store();
    let resolved = resolve(&store, &base_config(), NAMESPACE, &WatchTable::new())
        .await
        .unwrap();

    let provider = resolved
        .get(&key(ExternalKind::Secret, PROVIDER_SECRET))
        .unwrap();
    let live: Secret = store.object(Some(NAMESPACE), PROVIDER_SECRET).unwrap();
    assert_eq!(provider.resource_version, live.resource_version());
    assert!(provider.keys.contains("apitoken"));
    assert_eq!(provider.content_hash.len(), 16);
    assert!(provider.roles.contains(&DependencyRole::ProviderCredentials));
}

#[tokio::test]
async fn edges_are_recorded_even_when_resolution_fails() {
    let store = seeded_store();
    store.remove::<Secret>(Some(NAMESPACE), PROVIDER_SECRET);
    let watches = WatchTable::new();

    assert!(resolve(&store, &base_config(), NAMESPACE, &watches)
        .await
        .is_err());

    let owners = watches.owners_of(&key(ExternalKind::Secret, PROVIDER_SECRET));
    assert!(owners.contains("cluster"));
}

#[test]
fn watch_table_replaces_edges_per_owner() {
    let watches = WatchTable::new();
    watches.replace_edges("cluster", [key(ExternalKind::Secret, "a"), key(ExternalKind::Secret, "b")]);
    watches.replace_edges("other", [key(ExternalKind::Secret, "b")]);
    watches.replace_edges("cluster", [key(ExternalKind::Secret, "c")]);

    assert!(watches.owners_of(&key(ExternalKind::Secret, "a")).is_empty());
    assert_eq!(
        watches.owners_of(&key(ExternalKind::Secret, "b")).into_iter().collect::<Vec<_>>(),
        vec!["other".to_string()]
    );
    assert_eq!(watches.edges_of("cluster"), vec![key(ExternalKind::Secret, "c")]);

    watches.remove_owner("other");
    assert!(watches.owners_of(&key(ExternalKind::Secret, "b")).is_empty());
}

#[test]
fn watcher_stamp_adds_an_owner_after_restart() {
    let watches = WatchTable::new();
    let annotations = BTreeMap::from([(WATCHER_ANNOTATION.to_string(), "cluster".to_string())]);

    let owners = watches.owners_for(&key(ExternalKind::Secret, "a"), &annotations);
    assert!(owners.contains("cluster"));
}

// ============================================================================
// Telemetry Detection
// ============================================================================

#[test]
fn pull_secret_with_telemetry_host_enables_telemetry() {
    let raw = br#"{"auths":{"cloud.openshift.com":{"auth":"x"},"quay.io":{"auth":"y"}}}"#;
    assert!(pull_secret_enables_telemetry(raw).unwrap());
}

#[test]
fn pull_secret_without_telemetry_host_disables_telemetry() {
    let raw = br#"{"auths":{"quay.io":{"auth":"y"}}}"#;
    assert!(!pull_secret_enables_telemetry(raw).unwrap());
}

#[test]
fn unparsable_pull_secret_is_an_input_error() {
    let err = pull_secret_enables_telemetry(b"{not json").unwrap_err();
    assert!(err.is_input_error());
}

#[tokio::test]
async fn absent_pull_secret_disables_telemetry() {
    let store = MemoryStore::new();
    assert!(!telemetry_enabled(&store).await.unwrap());

    common::enable_telemetry(&store);
    assert!(telemetry_enabled(&store).await.unwrap());
}

#[tokio::test]
async fn pull_secret_without_docker_config_is_an_error() {
    let store = MemoryStore::new();
    store
        .insert(common::secret_in("openshift-config", "pull-secret", &[("other", "x")]))
        .unwrap();

    let err = telemetry_enabled(&store).await.unwrap_err();
    assert!(matches!(err, Error::MissingKey { .. }));
}

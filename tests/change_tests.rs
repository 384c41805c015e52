//! Integration tests for change detection on the app server Deployment

mod common;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use common::{
    base_config, config_map, operator_config, provider, secret, seeded_store, CACHE_SECRET,
    NAMESPACE,
};
use lightspeed_operator::adapters::app_config::build_app_config_map;
use lightspeed_operator::adapters::deployment_builder::build_deployment;
use lightspeed_operator::adapters::meta::{
    APP_CONFIG_CM_NAME, APP_CONFIG_FILENAME, CACHE_CONFIG_CM_NAME,
};
use lightspeed_operator::change::{
    collect_cache_tokens, collect_tokens, detect, next_restart_token, ChangeReport, ChangeSignal,
    ContentHashSignal, DependencyTokens, TrackedDependency, VersionTokenSignal,
};
use lightspeed_operator::resolver::{resolve, WatchTable};

fn desired() -> Deployment {
    build_deployment(&base_config(), &operator_config(), false).expect("deployment builds")
}

fn tokens(value: &str) -> DependencyTokens {
    let mut tokens = DependencyTokens::default();
    for d in TrackedDependency::APP_SERVER {
        tokens
            .versions
            .insert(d, Some(format!("{}-{}", d, value)));
        tokens.hashes.insert(d, Some(format!("hash-{}-{}", d, value)));
    }
    tokens
}

fn with_annotations(mut deployment: Deployment, annotations: BTreeMap<String, String>) -> Deployment {
    deployment.metadata.annotations = Some(annotations);
    deployment
}

fn legacy_name(dependency: TrackedDependency) -> String {
    dependency
        .legacy_annotation()
        .expect("dependency has a legacy annotation")
        .to_string()
}

fn legacy_hashes(tokens: &DependencyTokens) -> BTreeMap<String, String> {
    tokens
        .tracked()
        .filter_map(|d| Some((d.legacy_annotation()?.to_string(), tokens.hash(d)?.to_string())))
        .collect()
}

fn sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// ============================================================================
// Version Tokens
// ============================================================================

#[test]
fn matching_stamps_need_no_action() {
    let fresh = tokens("1");
    let live = with_annotations(desired(), fresh.version_stamps());

    let report = detect(&live, &desired(), &fresh);

    assert_eq!(report.signal, "version-token");
    assert!(!report.spec_changed);
    assert!(!report.dependencies_changed());
    assert!(!report.requires_action());
}

#[test]
fn one_changed_token_is_reported_alone() {
    let recorded = tokens("1");
    let live = with_annotations(desired(), recorded.version_stamps());

    let mut fresh = recorded.clone();
    fresh
        .versions
        .insert(TrackedDependency::Credentials, Some("credentials-2".to_string()));
    let report = detect(&live, &desired(), &fresh);

    assert_eq!(report.changed_dependencies, vec![TrackedDependency::Credentials]);
    assert!(!report.spec_changed);
    assert!(report.requires_action());
}

#[test]
fn unavailable_token_counts_as_changed() {
    let recorded = tokens("1");
    let live = with_annotations(desired(), recorded.version_stamps());

    let mut fresh = recorded.clone();
    fresh.versions.insert(TrackedDependency::CacheSecret, None);
    let report = detect(&live, &desired(), &fresh);

    assert_eq!(report.changed_dependencies, vec![TrackedDependency::CacheSecret]);
    assert!(!fresh
        .version_stamps()
        .contains_key(TrackedDependency::CacheSecret.version_annotation()));
}

#[test]
fn unstamped_deployment_reports_every_dependency() {
    let report = detect(&desired(), &desired(), &tokens("1"));

    assert_eq!(report.signal, "version-token");
    assert_eq!(report.changed_dependencies, TrackedDependency::APP_SERVER.to_vec());
    assert!(!report.migrate_stamps);
}

#[test]
fn spec_drift_and_dependency_change_are_independent() {
    let fresh = tokens("1");
    let mut live = with_annotations(desired(), fresh.version_stamps());
    live.spec.as_mut().unwrap().replicas = Some(4);

    let report = detect(&live, &desired(), &fresh);

    assert!(report.spec_changed);
    assert!(!report.dependencies_changed());
}

// ============================================================================
// Legacy Content Hashes
// ============================================================================

#[test]
fn legacy_signal_applies_only_without_version_stamps() {
    let fresh = tokens("1");
    let legacy = with_annotations(desired(), legacy_hashes(&fresh));
    assert!(ContentHashSignal.applies_to(&legacy));

    let mut both = legacy_hashes(&fresh);
    both.extend(fresh.version_stamps());
    let stamped = with_annotations(desired(), both);
    assert!(!ContentHashSignal.applies_to(&stamped));
    assert!(VersionTokenSignal.applies_to(&stamped));
    assert!(!ContentHashSignal.applies_to(&desired()));
}

#[test]
fn matching_legacy_hashes_migrate_without_restart() {
    let fresh = tokens("1");
    let live = with_annotations(desired(), legacy_hashes(&fresh));

    let report = detect(&live, &desired(), &fresh);

    assert_eq!(report.signal, "content-hash");
    assert!(!report.dependencies_changed());
    assert!(report.migrate_stamps);
    assert!(report.requires_action());
}

#[test]
fn mismatched_legacy_hash_restarts() {
    let fresh = tokens("1");
    let mut recorded = legacy_hashes(&fresh);
    recorded.insert(legacy_name(TrackedDependency::CacheSecret), "stale".to_string());
    let live = with_annotations(desired(), recorded);

    let report = detect(&live, &desired(), &fresh);

    assert_eq!(report.changed_dependencies, vec![TrackedDependency::CacheSecret]);
    assert!(!report.migrate_stamps);
}

#[test]
fn legacy_annotation_names_match_earlier_releases() {
    assert_eq!(legacy_name(TrackedDependency::AppConfig), "hash/olsconfig");
    assert_eq!(legacy_name(TrackedDependency::Credentials), "hash/llmprovider");
    assert_eq!(legacy_name(TrackedDependency::CacheSecret), "hash/postgres-secret");
    assert_eq!(TrackedDependency::TrustBundle.legacy_annotation(), None);
    assert_eq!(TrackedDependency::CacheConfig.legacy_annotation(), None);
}

#[test]
fn trust_bundle_is_ignored_by_the_legacy_signal() {
    let fresh = tokens("1");
    let live = with_annotations(desired(), legacy_hashes(&fresh));

    let mut moved = fresh.clone();
    moved
        .hashes
        .insert(TrackedDependency::TrustBundle, Some("rotated".to_string()));

    assert!(ContentHashSignal.changed(&live, &moved).is_empty());
}

#[test]
fn missing_legacy_hash_is_not_compared() {
    let fresh = tokens("1");
    let recorded = BTreeMap::from([(
        legacy_name(TrackedDependency::AppConfig),
        fresh.hash(TrackedDependency::AppConfig).unwrap().to_string(),
    )]);
    let live = with_annotations(desired(), recorded);

    let report = detect(&live, &desired(), &fresh);

    assert!(report.changed_dependencies.is_empty());
    assert!(report.migrate_stamps);
}

// ============================================================================
// Restart Token
// ============================================================================

#[test]
fn restart_token_is_rfc3339_with_nanos() {
    let token = next_restart_token(None);
    let parsed = DateTime::parse_from_rfc3339(&token).expect("valid timestamp");
    assert!(token.ends_with('Z'));
    assert!((Utc::now() - parsed.with_timezone(&Utc)).num_seconds() < 5);
}

#[test]
fn restart_token_strictly_increases() {
    let future = (Utc::now() + Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Nanos, true);
    let next = next_restart_token(Some(&future));

    let a = DateTime::parse_from_rfc3339(&future).unwrap();
    let b = DateTime::parse_from_rfc3339(&next).unwrap();
    assert_eq!(b - a, Duration::nanoseconds(1));

    let mut previous = next_restart_token(None);
    for _ in 0..100 {
        let token = next_restart_token(Some(&previous));
        let prev = DateTime::parse_from_rfc3339(&previous).unwrap();
        let cur = DateTime::parse_from_rfc3339(&token).unwrap();
        assert!(cur > prev);
        previous = token;
    }
}

#[test]
fn unparsable_previous_token_is_replaced() {
    let token = next_restart_token(Some("not-a-time"));
    assert!(DateTime::parse_from_rfc3339(&token).is_ok());
}

// ============================================================================
// Token Collection
// ============================================================================

#[tokio::test]
async fn collect_tokens_reads_applied_objects() {
    let store = seeded_store();
    let config = base_config();
    let operator = operator_config();
    let resolved = resolve(&store, &config, NAMESPACE, &WatchTable::new())
        .await
        .unwrap();
    let app_config = build_app_config_map(&config, &resolved, &operator).unwrap();
    let stored = store.insert(app_config.clone()).unwrap();

    let tokens = collect_tokens(&store, NAMESPACE, &config, &resolved, &app_config).await;

    assert_eq!(
        tokens.version(TrackedDependency::AppConfig),
        stored.metadata.resource_version.as_deref()
    );
    assert!(tokens.version(TrackedDependency::CacheSecret).is_some());
    assert!(tokens.version(TrackedDependency::Credentials).is_some());
    assert!(tokens.version(TrackedDependency::TrustBundle).is_some());
    assert_eq!(tokens.tracked().collect::<Vec<_>>(), TrackedDependency::APP_SERVER.to_vec());
    assert!(TrackedDependency::APP_SERVER
        .iter()
        .filter(|d| d.legacy_annotation().is_some())
        .all(|d| tokens.hash(*d).is_some()));
    assert_eq!(tokens.hash(TrackedDependency::TrustBundle), None);
}

#[tokio::test]
async fn digests_use_the_format_of_earlier_releases() {
    let store = seeded_store();
    let config = base_config();
    let resolved = resolve(&store, &config, NAMESPACE, &WatchTable::new())
        .await
        .unwrap();
    let app_config = build_app_config_map(&config, &resolved, &operator_config()).unwrap();
    let rendered = app_config.data.as_ref().unwrap()[APP_CONFIG_FILENAME].clone();

    let tokens = collect_tokens(&store, NAMESPACE, &config, &resolved, &app_config).await;

    assert_eq!(
        tokens.hash(TrackedDependency::AppConfig),
        Some(sha256(rendered.as_bytes()).as_str())
    );
    assert_eq!(
        tokens.hash(TrackedDependency::Credentials),
        Some(sha256(b"apitoken=sk-test\n").as_str())
    );
    assert_eq!(
        tokens.hash(TrackedDependency::CacheSecret),
        Some(sha256(b"hunter2").as_str())
    );
    assert_eq!(
        tokens.hash(TrackedDependency::CacheSecret),
        Some("f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7")
    );
}

#[tokio::test]
async fn credential_digest_covers_providers_in_order_with_sorted_keys() {
    let store = seeded_store();
    store
        .insert(secret(
            "azure-creds",
            &[("client_secret", "s3cret"), ("client_id", "app-1"), ("tenant_id", "t-1")],
        ))
        .unwrap();
    let mut config = base_config();
    config
        .spec
        .llm
        .providers
        .push(provider("azure", "azure_openai", "azure-creds"));
    let resolved = resolve(&store, &config, NAMESPACE, &WatchTable::new())
        .await
        .unwrap();
    let app_config = build_app_config_map(&config, &resolved, &operator_config()).unwrap();

    let tokens = collect_tokens(&store, NAMESPACE, &config, &resolved, &app_config).await;

    let expected = sha256(
        b"apitoken=sk-test\nclient_id=app-1\nclient_secret=s3cret\ntenant_id=t-1\n",
    );
    assert_eq!(tokens.hash(TrackedDependency::Credentials), Some(expected.as_str()));
}

#[tokio::test]
async fn cache_tokens_track_config_and_secret() {
    let store = seeded_store();
    let stored = store
        .insert(config_map(CACHE_CONFIG_CM_NAME, &[("postgresql.conf.sample", "ssl = on")]))
        .unwrap();

    let tokens = collect_cache_tokens(&store, NAMESPACE, CACHE_SECRET).await;

    assert_eq!(tokens.tracked().collect::<Vec<_>>(), vec![
        TrackedDependency::CacheSecret,
        TrackedDependency::CacheConfig,
    ]);
    assert_eq!(
        tokens.version(TrackedDependency::CacheConfig),
        stored.metadata.resource_version.as_deref()
    );
    assert_eq!(tokens.hash(TrackedDependency::CacheConfig), None);
    assert_eq!(
        tokens.hash(TrackedDependency::CacheSecret),
        Some(sha256(b"hunter2").as_str())
    );
}

#[tokio::test]
async fn failed_read_leaves_token_unset() {
    let store = seeded_store();
    let config = base_config();
    let resolved = resolve(&store, &config, NAMESPACE, &WatchTable::new())
        .await
        .unwrap();
    let app_config = build_app_config_map(&config, &resolved, &operator_config()).unwrap();
    store.insert(app_config.clone()).unwrap();
    store.fail_reads::<ConfigMap>(Some(NAMESPACE), APP_CONFIG_CM_NAME);

    let tokens = collect_tokens(&store, NAMESPACE, &config, &resolved, &app_config).await;

    assert_eq!(tokens.version(TrackedDependency::AppConfig), None);
    assert!(tokens.hash(TrackedDependency::AppConfig).is_some());
    assert!(tokens.version(TrackedDependency::CacheSecret).is_some());
}

#[tokio::test]
async fn credential_token_moves_with_the_secret() {
    let store = seeded_store();
    let config = base_config();
    let operator = operator_config();
    let watches = WatchTable::new();

    let resolved = resolve(&store, &config, NAMESPACE, &watches).await.unwrap();
    let app_config = build_app_config_map(&config, &resolved, &operator).unwrap();
    let before = collect_tokens(&store, NAMESPACE, &config, &resolved, &app_config).await;

    common::rotate_secret(&store, common::PROVIDER_SECRET, &[("apitoken", "sk-rotated")]);
    let resolved = resolve(&store, &config, NAMESPACE, &watches).await.unwrap();
    let after = collect_tokens(&store, NAMESPACE, &config, &resolved, &app_config).await;

    assert_ne!(
        before.version(TrackedDependency::Credentials),
        after.version(TrackedDependency::Credentials)
    );
    assert_ne!(
        before.hash(TrackedDependency::Credentials),
        after.hash(TrackedDependency::Credentials)
    );
    assert_eq!(
        before.version(TrackedDependency::TrustBundle),
        after.version(TrackedDependency::TrustBundle)
    );
}

#[test]
fn report_requires_action_for_any_trigger() {
    let report = |spec_changed, changed: Vec<TrackedDependency>, migrate_stamps| ChangeReport {
        spec_changed,
        changed_dependencies: changed,
        migrate_stamps,
        signal: "version-token",
    };
    assert!(!report(false, vec![], false).requires_action());
    assert!(report(true, vec![], false).requires_action());
    assert!(report(false, vec![TrackedDependency::AppConfig], false).requires_action());
    assert!(report(false, vec![], true).requires_action());
}

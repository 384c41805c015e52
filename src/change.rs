//! Change detection for the managed Deployments
//!
//! Two triggers are evaluated independently each cycle. The structural
//! trigger asks the equality oracle whether the live spec has drifted. The
//! dependency trigger compares the tokens recorded on the live Deployment
//! with fresh tokens for every tracked dependency. Either one is enough to
//! act, and the dependency trigger alone causes a rolling restart.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures::future::join_all;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::adapters::meta::{APP_CONFIG_CM_NAME, APP_CONFIG_FILENAME, CACHE_CONFIG_CM_NAME};
use crate::crd::LightspeedConfig;
use crate::equality::deployment_equal;
use crate::resolver::data::{aggregate_token, sha256_hex, DataObject};
use crate::resolver::{DependencyRole, ExternalKind, ResolvedDependencies, CACHE_PASSWORD_KEY};
use crate::store::{ManagedObject, ObjectStore};

/// Dependencies whose change restarts a managed workload
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrackedDependency {
    AppConfig,
    Credentials,
    TrustBundle,
    CacheSecret,
    CacheConfig,
}

impl TrackedDependency {
    pub const ALL: [TrackedDependency; 5] = [
        TrackedDependency::AppConfig,
        TrackedDependency::Credentials,
        TrackedDependency::TrustBundle,
        TrackedDependency::CacheSecret,
        TrackedDependency::CacheConfig,
    ];

    /// Dependencies of the app server Deployment
    pub const APP_SERVER: [TrackedDependency; 4] = [
        TrackedDependency::AppConfig,
        TrackedDependency::Credentials,
        TrackedDependency::TrustBundle,
        TrackedDependency::CacheSecret,
    ];

    /// Dependencies of the conversation cache Deployment
    pub const CACHE_SERVER: [TrackedDependency; 2] = [
        TrackedDependency::CacheConfig,
        TrackedDependency::CacheSecret,
    ];

    /// Deployment annotation holding the version stamp
    pub fn version_annotation(&self) -> &'static str {
        match self {
            TrackedDependency::AppConfig => "lightspeed.io/app-config-version",
            TrackedDependency::Credentials => "lightspeed.io/credentials-version",
            TrackedDependency::TrustBundle => "lightspeed.io/trust-bundle-version",
            TrackedDependency::CacheSecret => "lightspeed.io/cache-secret-version",
            TrackedDependency::CacheConfig => "lightspeed.io/cache-config-version",
        }
    }

    /// Deployment annotation written by releases that tracked content
    /// hashes. Trust bundles and the cache config were never recorded on
    /// the Deployment.
    pub fn legacy_annotation(&self) -> Option<&'static str> {
        match self {
            TrackedDependency::AppConfig => Some("hash/olsconfig"),
            TrackedDependency::Credentials => Some("hash/llmprovider"),
            TrackedDependency::CacheSecret => Some("hash/postgres-secret"),
            TrackedDependency::TrustBundle | TrackedDependency::CacheConfig => None,
        }
    }
}

impl fmt::Display for TrackedDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackedDependency::AppConfig => "app-config",
            TrackedDependency::Credentials => "credentials",
            TrackedDependency::TrustBundle => "trust-bundle",
            TrackedDependency::CacheSecret => "cache-secret",
            TrackedDependency::CacheConfig => "cache-config",
        };
        write!(f, "{}", name)
    }
}

/// Fresh tokens for the dependencies of one Deployment. The keys of
/// `versions` are the dependencies that Deployment tracks. A `None` version
/// could not be obtained this cycle and counts as changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyTokens {
    pub versions: BTreeMap<TrackedDependency, Option<String>>,
    /// Digests in the format of the legacy hash annotations
    pub hashes: BTreeMap<TrackedDependency, Option<String>>,
}

impl DependencyTokens {
    pub fn version(&self, dependency: TrackedDependency) -> Option<&str> {
        self.versions.get(&dependency).and_then(|v| v.as_deref())
    }

    pub fn hash(&self, dependency: TrackedDependency) -> Option<&str> {
        self.hashes.get(&dependency).and_then(|v| v.as_deref())
    }

    pub fn tracked(&self) -> impl Iterator<Item = TrackedDependency> + '_ {
        self.versions.keys().copied()
    }

    /// Version annotations to record after a successful apply
    pub fn version_stamps(&self) -> BTreeMap<String, String> {
        self.versions
            .iter()
            .filter_map(|(d, v)| {
                v.as_ref()
                    .map(|v| (d.version_annotation().to_string(), v.clone()))
            })
            .collect()
    }
}

/// Read an object back for its resourceVersion. A missing object or a
/// failed read gives no version.
async fn read_back<K, S>(store: &S, namespace: &str, name: &str) -> Option<K>
where
    K: ManagedObject,
    S: ObjectStore,
{
    match store.get::<K>(Some(namespace), name).await {
        Ok(Some(obj)) => Some(obj),
        Ok(None) => {
            warn!("{} {} not found", K::kind_name(), name);
            None
        }
        Err(e) => {
            warn!("Failed to read {} {}: {}", K::kind_name(), name, e);
            None
        }
    }
}

/// Version and legacy digest of the cache secret
async fn cache_secret_tokens<S: ObjectStore>(
    store: &S,
    namespace: &str,
    cache_secret: &str,
) -> (Option<String>, Option<String>) {
    match read_back::<Secret, S>(store, namespace, cache_secret).await {
        Some(secret) => {
            let hash = secret
                .entries()
                .get(CACHE_PASSWORD_KEY)
                .map(|password| sha256_hex(password));
            (secret.resource_version(), hash)
        }
        None => (None, None),
    }
}

/// Legacy digest of the provider credentials: `key=value` lines for every
/// provider in config order. Any unreadable secret leaves it unset.
async fn credentials_digest<S: ObjectStore>(
    store: &S,
    namespace: &str,
    config: &LightspeedConfig,
) -> Option<String> {
    let reads = config
        .spec
        .llm
        .providers
        .iter()
        .map(|p| read_back::<Secret, S>(store, namespace, &p.credentials_secret_ref.name));
    let secrets = join_all(reads).await;

    let mut lines = Vec::new();
    for secret in secrets {
        for (key, value) in secret?.entries() {
            lines.extend_from_slice(key.as_bytes());
            lines.push(b'=');
            lines.extend_from_slice(&value);
            lines.push(b'\n');
        }
    }
    Some(sha256_hex(&lines))
}

/// Gather fresh tokens for the app server Deployment.
///
/// The app config ConfigMap and the cache secret are read again from the
/// store, after the config artifacts were applied this cycle; a failed read
/// leaves that token unset. Credentials and trust bundles are aggregated
/// from what the resolver fetched.
pub async fn collect_tokens<S: ObjectStore>(
    store: &S,
    namespace: &str,
    config: &LightspeedConfig,
    resolved: &ResolvedDependencies,
    desired_app_config: &ConfigMap,
) -> DependencyTokens {
    let cache_secret = &config.spec.ols.conversation_cache.postgres.credentials_secret;
    let mut tokens = DependencyTokens::default();

    let (app_config, (cache_version, cache_hash), credentials_hash) = futures::join!(
        read_back::<ConfigMap, S>(store, namespace, APP_CONFIG_CM_NAME),
        cache_secret_tokens(store, namespace, cache_secret),
        credentials_digest(store, namespace, config),
    );

    tokens.versions.insert(
        TrackedDependency::AppConfig,
        app_config.and_then(|cm| cm.resource_version()),
    );
    let rendered = desired_app_config
        .data
        .as_ref()
        .and_then(|d| d.get(APP_CONFIG_FILENAME));
    tokens.hashes.insert(
        TrackedDependency::AppConfig,
        rendered.map(|r| sha256_hex(r.as_bytes())),
    );

    tokens
        .versions
        .insert(TrackedDependency::CacheSecret, cache_version);
    tokens
        .hashes
        .insert(TrackedDependency::CacheSecret, cache_hash);

    let credentials: Vec<_> = resolved
        .of_kind(ExternalKind::Secret)
        .filter(|o| o.roles.iter().any(|r| *r != DependencyRole::CacheCredentials))
        .collect();
    let bundles: Vec<_> = resolved.of_kind(ExternalKind::ConfigMap).collect();

    for (dependency, objects) in [
        (TrackedDependency::Credentials, &credentials),
        (TrackedDependency::TrustBundle, &bundles),
    ] {
        let version = aggregate_token(objects.iter().map(|o| {
            (
                o.key.name.as_str(),
                o.resource_version.as_deref().unwrap_or_default(),
            )
        }));
        tokens.versions.insert(dependency, Some(version));
    }
    tokens
        .hashes
        .insert(TrackedDependency::Credentials, credentials_hash);

    debug!("Collected app server tokens: {:?}", tokens.versions);
    tokens
}

/// Gather fresh tokens for the conversation cache Deployment, reading the
/// cache ConfigMap and secret back from the store.
pub async fn collect_cache_tokens<S: ObjectStore>(
    store: &S,
    namespace: &str,
    cache_secret: &str,
) -> DependencyTokens {
    let mut tokens = DependencyTokens::default();

    let (cache_config, (secret_version, secret_hash)) = futures::join!(
        read_back::<ConfigMap, S>(store, namespace, CACHE_CONFIG_CM_NAME),
        cache_secret_tokens(store, namespace, cache_secret),
    );

    tokens.versions.insert(
        TrackedDependency::CacheConfig,
        cache_config.and_then(|cm| cm.resource_version()),
    );
    tokens
        .versions
        .insert(TrackedDependency::CacheSecret, secret_version);
    tokens
        .hashes
        .insert(TrackedDependency::CacheSecret, secret_hash);

    debug!("Collected cache server tokens: {:?}", tokens.versions);
    tokens
}

/// A strategy for deciding which dependencies changed since the live
/// Deployment was last written
pub trait ChangeSignal: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the live Deployment carries the annotations this signal reads
    fn applies_to(&self, live: &Deployment) -> bool;

    fn changed(&self, live: &Deployment, tokens: &DependencyTokens) -> Vec<TrackedDependency>;
}

fn has_version_stamp(live: &Deployment) -> bool {
    let annotations = live.annotations();
    TrackedDependency::ALL
        .iter()
        .any(|d| annotations.contains_key(d.version_annotation()))
}

fn has_legacy_hash(live: &Deployment) -> bool {
    let annotations = live.annotations();
    TrackedDependency::ALL
        .iter()
        .filter_map(|d| d.legacy_annotation())
        .any(|a| annotations.contains_key(a))
}

/// Compares recorded resource-version tokens
pub struct VersionTokenSignal;

impl ChangeSignal for VersionTokenSignal {
    fn name(&self) -> &'static str {
        "version-token"
    }

    fn applies_to(&self, _live: &Deployment) -> bool {
        true
    }

    fn changed(&self, live: &Deployment, tokens: &DependencyTokens) -> Vec<TrackedDependency> {
        let annotations = live.annotations();
        tokens
            .tracked()
            .filter(|d| match tokens.version(*d) {
                None => true,
                Some(fresh) => {
                    annotations.get(d.version_annotation()).map(String::as_str) != Some(fresh)
                }
            })
            .collect()
    }
}

/// Compares content hashes recorded by older releases. Only used while the
/// live Deployment has no version stamps at all.
pub struct ContentHashSignal;

impl ChangeSignal for ContentHashSignal {
    fn name(&self) -> &'static str {
        "content-hash"
    }

    fn applies_to(&self, live: &Deployment) -> bool {
        !has_version_stamp(live) && has_legacy_hash(live)
    }

    /// A dependency with no recorded hash is not compared
    fn changed(&self, live: &Deployment, tokens: &DependencyTokens) -> Vec<TrackedDependency> {
        let annotations = live.annotations();
        tokens
            .tracked()
            .filter(|d| {
                match d.legacy_annotation().and_then(|a| annotations.get(a)) {
                    None => false,
                    Some(recorded) => tokens.hash(*d) != Some(recorded.as_str()),
                }
            })
            .collect()
    }
}

/// What the applier has to do with the Deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeReport {
    pub spec_changed: bool,
    pub changed_dependencies: Vec<TrackedDependency>,
    /// Legacy hashes matched; only the version stamps need writing
    pub migrate_stamps: bool,
    pub signal: &'static str,
}

impl ChangeReport {
    pub fn dependencies_changed(&self) -> bool {
        !self.changed_dependencies.is_empty()
    }

    pub fn requires_action(&self) -> bool {
        self.spec_changed || self.dependencies_changed() || self.migrate_stamps
    }
}

/// Evaluate both triggers against the live Deployment
pub fn detect(live: &Deployment, desired: &Deployment, tokens: &DependencyTokens) -> ChangeReport {
    let signals: [&dyn ChangeSignal; 2] = [&ContentHashSignal, &VersionTokenSignal];
    let signal = signals
        .into_iter()
        .find(|s| s.applies_to(live))
        .unwrap_or(&VersionTokenSignal);

    let changed_dependencies = signal.changed(live, tokens);
    let legacy = signal.name() == ContentHashSignal.name();

    ChangeReport {
        spec_changed: !deployment_equal(live, desired),
        migrate_stamps: legacy && changed_dependencies.is_empty(),
        changed_dependencies,
        signal: signal.name(),
    }
}

/// Restart token for the pod template: the current time, or one nanosecond
/// past `previous` when the clock has not moved beyond it.
pub fn next_restart_token(previous: Option<&str>) -> String {
    let now = Utc::now();
    let next = previous
        .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
        .map(|p| p.with_timezone(&Utc))
        .filter(|p| *p >= now)
        .map(|p| p + Duration::nanoseconds(1))
        .unwrap_or(now);
    next.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

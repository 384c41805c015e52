//! External dependency resolution
//!
//! Fetches the Secrets and ConfigMaps a config references but does not own,
//! checks their required keys, stamps them with a watcher annotation and
//! records them in the [`WatchTable`]. Resolution is repeated every cycle.

pub mod data;
mod references;
pub mod telemetry;
mod watch_table;

pub use references::{
    external_references, DependencyRole, ExternalReference, Requirement, AZURE_OPENAI_TYPE,
    CACHE_PASSWORD_KEY, CACHE_REFERRER, KUBERNETES_TOKEN_SENTINEL, MCP_HEADER_KEY,
};
pub use watch_table::WatchTable;

use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};

use crate::adapters::meta::WATCHER_ANNOTATION;
use crate::certs::validate_certificate;
use crate::crd::LightspeedConfig;
use crate::store::{ManagedObject, ObjectStore};
use crate::{Error, Result};
use data::DataObject;

const SERVING_CA_KEY: &str = "ca.crt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExternalKind {
    Secret,
    ConfigMap,
}

impl fmt::Display for ExternalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalKind::Secret => write!(f, "Secret"),
            ExternalKind::ConfigMap => write!(f, "ConfigMap"),
        }
    }
}

/// Identity of an external object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExternalKey {
    pub kind: ExternalKind,
    pub namespace: String,
    pub name: String,
}

impl ExternalKey {
    pub fn new(kind: ExternalKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A fetched and validated external object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedObject {
    pub key: ExternalKey,
    pub roles: BTreeSet<DependencyRole>,
    pub resource_version: Option<String>,
    /// Entry names, sorted
    pub keys: BTreeSet<String>,
    pub content_hash: String,
    /// `ca.crt` of a serving certificate secret, when it carries one
    pub ca_certificate: Option<String>,
}

/// Result of resolving every reference of a config
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedDependencies {
    pub objects: BTreeMap<ExternalKey, ResolvedObject>,
    /// Platform telemetry signal from the pull secret
    pub telemetry_enabled: bool,
}

impl ResolvedDependencies {
    pub fn get(&self, key: &ExternalKey) -> Option<&ResolvedObject> {
        self.objects.get(key)
    }

    pub fn with_role(&self, role: DependencyRole) -> impl Iterator<Item = &ResolvedObject> {
        self.objects.values().filter(move |o| o.roles.contains(&role))
    }

    pub fn of_kind(&self, kind: ExternalKind) -> impl Iterator<Item = &ResolvedObject> {
        self.objects.values().filter(move |o| o.key.kind == kind)
    }

    /// CA bundle of the user serving certificate
    pub fn serving_ca(&self) -> Option<&str> {
        self.with_role(DependencyRole::ServingCert)
            .find_map(|o| o.ca_certificate.as_deref())
    }

    /// Verify every reference was resolved
    pub fn ensure_covers(&self, references: &[ExternalReference]) -> Result<()> {
        match references.iter().find(|r| !self.objects.contains_key(&r.key)) {
            Some(missing) => Err(Error::MissingReference {
                referrer: missing.referrer.clone(),
                kind: missing.role.describe(),
                name: missing.key.name.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl Requirement {
    fn check(
        &self,
        reference: &ExternalReference,
        entries: &BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let missing = |key: &str| Error::MissingKey {
            referrer: reference.referrer.clone(),
            kind: reference.role.describe(),
            name: reference.key.name.clone(),
            key: key.to_string(),
        };
        let invalid = |key: &str, source| Error::InvalidCertificate {
            referrer: reference.referrer.clone(),
            name: reference.key.name.clone(),
            key: key.to_string(),
            source,
        };

        match self {
            Requirement::Keys(keys) => match keys.iter().find(|k| !entries.contains_key(**k)) {
                Some(key) => Err(missing(key)),
                None => Ok(()),
            },
            Requirement::Either(primary, alternative) => {
                if primary.iter().all(|k| entries.contains_key(*k)) {
                    return Ok(());
                }
                let fallback = if alternative.iter().any(|k| entries.contains_key(*k)) {
                    alternative
                } else {
                    primary
                };
                match fallback.iter().find(|k| !entries.contains_key(**k)) {
                    Some(key) => Err(missing(key)),
                    None => Ok(()),
                }
            }
            Requirement::Certificate(key) => {
                let value = entries.get(*key).ok_or_else(|| missing(key))?;
                validate_certificate(value).map_err(|e| invalid(key, e))
            }
            Requirement::Certificates => entries
                .iter()
                .try_for_each(|(key, value)| validate_certificate(value).map_err(|e| invalid(key, e))),
        }
    }
}

/// Resolve every external reference of `config`.
///
/// Fetches run concurrently. Any missing object, missing key or invalid
/// certificate fails the whole resolution with an error naming the object
/// and the part of the config that referenced it.
pub async fn resolve<S: ObjectStore>(
    store: &S,
    config: &LightspeedConfig,
    namespace: &str,
    watches: &WatchTable,
) -> Result<ResolvedDependencies> {
    let owner = config.name_any();
    let references = external_references(config, namespace);

    let mut groups: BTreeMap<ExternalKey, Vec<&ExternalReference>> = BTreeMap::new();
    for reference in &references {
        groups.entry(reference.key.clone()).or_default().push(reference);
    }

    watches.replace_edges(&owner, groups.keys().cloned());

    let fetches = groups.iter().map(|(key, refs)| async {
        match key.kind {
            ExternalKind::Secret => resolve_object::<Secret, S>(store, key, refs, &owner).await,
            ExternalKind::ConfigMap => {
                resolve_object::<ConfigMap, S>(store, key, refs, &owner).await
            }
        }
    });

    let (objects, telemetry_enabled) =
        futures::try_join!(try_join_all(fetches), telemetry::telemetry_enabled(store))?;

    debug!(
        "Resolved {} external objects for {}, telemetry={}",
        objects.len(),
        owner,
        telemetry_enabled
    );

    Ok(ResolvedDependencies {
        objects: objects.into_iter().map(|o| (o.key.clone(), o)).collect(),
        telemetry_enabled,
    })
}

async fn resolve_object<K, S>(
    store: &S,
    key: &ExternalKey,
    references: &[&ExternalReference],
    owner: &str,
) -> Result<ResolvedObject>
where
    K: ManagedObject + DataObject,
    S: ObjectStore,
{
    let first = references[0];
    let obj = store
        .get::<K>(Some(&key.namespace), &key.name)
        .await?
        .ok_or_else(|| Error::MissingReference {
            referrer: first.referrer.clone(),
            kind: first.role.describe(),
            name: key.name.clone(),
        })?;

    let entries = obj.entries();
    for reference in references {
        reference.requirement.check(reference, &entries)?;
    }

    let obj = if references.iter().any(|r| r.stamp) {
        stamp_watcher(store, obj, owner).await?
    } else {
        obj
    };

    let roles: BTreeSet<DependencyRole> = references.iter().map(|r| r.role).collect();
    let ca_certificate = if roles.contains(&DependencyRole::ServingCert) {
        entries
            .get(SERVING_CA_KEY)
            .and_then(|v| String::from_utf8(v.clone()).ok())
    } else {
        None
    };

    Ok(ResolvedObject {
        key: key.clone(),
        roles,
        resource_version: obj.resource_version(),
        keys: entries.keys().cloned().collect(),
        content_hash: data::content_hash(&entries),
        ca_certificate,
    })
}

/// Write the watcher annotation unless it already names `owner`
pub async fn stamp_watcher<K, S>(store: &S, mut obj: K, owner: &str) -> Result<K>
where
    K: ManagedObject,
    S: ObjectStore,
{
    if obj.annotations().get(WATCHER_ANNOTATION).map(String::as_str) == Some(owner) {
        return Ok(obj);
    }

    obj.annotations_mut()
        .insert(WATCHER_ANNOTATION.to_string(), owner.to_string());
    let stamped = store.update(&obj).await?;
    info!(
        "Stamped {} {} with watcher annotation for {}",
        K::kind_name(),
        stamped.name_any(),
        owner
    );
    Ok(stamped)
}

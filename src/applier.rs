//! Convergence applier
//!
//! Applies the smallest write that brings a live object in line with its
//! desired form. Most kinds go through [`ensure`]; Deployments go through
//! [`converge_deployment`], which also owns the restart token and the
//! dependency version stamps.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::ByteString;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::fmt;
use tracing::{debug, info};

use crate::adapters::meta::{CONSOLE_CR_NAME, FORCE_RELOAD_ANNOTATION};
use crate::change::{detect, next_restart_token, ChangeReport, DependencyTokens, TrackedDependency};
use crate::crd::console::{Console, ConsolePlugin};
use crate::crd::monitoring::{PrometheusRule, ServiceMonitor};
use crate::equality;
use crate::resolver::data::DataObject;
use crate::metrics::CONVERGENCE_OUTCOMES;
use crate::store::{ManagedObject, ObjectStore};
use crate::Result;

/// What a convergence step did to one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    /// Updated with a new restart token on the pod template
    Restarted,
    /// Only the version stamps were written
    StampsMigrated,
    Deleted,
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Restarted => "restarted",
            Outcome::StampsMigrated => "stamps-migrated",
            Outcome::Deleted => "deleted",
            Outcome::Skipped => "skipped",
        }
    }

    /// Whether a write was issued
    pub fn wrote(&self) -> bool {
        !matches!(self, Outcome::Skipped)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn record<K: ManagedObject>(name: &str, outcome: Outcome) {
    let kind = K::kind_name();
    CONVERGENCE_OUTCOMES
        .with_label_values(&[kind.as_str(), outcome.as_str()])
        .inc();
    match outcome {
        Outcome::Skipped => debug!(kind = %kind, name, "{} {} unchanged", kind, name),
        _ => info!(kind = %kind, name, outcome = %outcome, "{} {} {}", kind, name, outcome),
    }
}

/// Copy desired labels and annotations onto live metadata and take over
/// the owner references. Keys set by others are left alone.
fn merge_meta(live: &mut ObjectMeta, desired: &ObjectMeta) {
    if let Some(labels) = &desired.labels {
        live.labels
            .get_or_insert_with(Default::default)
            .extend(labels.clone());
    }
    if let Some(annotations) = &desired.annotations {
        live.annotations
            .get_or_insert_with(Default::default)
            .extend(annotations.clone());
    }
    if desired.owner_references.is_some() {
        live.owner_references = desired.owner_references.clone();
    }
}

/// A kind the applier can converge generically
pub trait Convergent: ManagedObject {
    /// Whether `live` already satisfies `desired`
    fn matches(live: &Self, desired: &Self) -> bool;

    /// Write the desired fields onto the live object
    fn merge(live: &mut Self, desired: &Self);
}

impl Convergent for ServiceAccount {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::service_account_equal(live, desired)
    }

    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
    }
}

impl Convergent for ClusterRole {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::cluster_role_equal(live, desired)
    }

    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
        live.rules = desired.rules.clone();
    }
}

impl Convergent for ClusterRoleBinding {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::cluster_role_binding_equal(live, desired)
    }

    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
        live.subjects = desired.subjects.clone();
        live.role_ref = desired.role_ref.clone();
    }
}

impl Convergent for ConfigMap {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::config_map_equal(live, desired)
    }

    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
        live.data = desired.data.clone();
        live.binary_data = desired.binary_data.clone();
    }
}

impl Convergent for Service {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::service_equal(live, desired)
    }

    /// Cluster IPs and other server-assigned fields are kept
    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
        let desired_spec = desired.spec.clone().unwrap_or_default();
        let spec = live.spec.get_or_insert_with(Default::default);
        spec.selector = desired_spec.selector;
        spec.ports = desired_spec.ports;
    }
}

impl Convergent for NetworkPolicy {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::network_policy_equal(live, desired)
    }

    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
        live.spec = desired.spec.clone();
    }
}

impl Convergent for Secret {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::secret_equal(live, desired)
    }

    /// Data populated by the platform is kept when nothing is desired
    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
        live.type_ = desired.type_.clone();
        if equality::secret_has_payload(desired) {
            live.data = Some(
                desired
                    .entries()
                    .into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            );
            live.string_data = None;
        }
    }
}

impl Convergent for PersistentVolumeClaim {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::persistent_volume_claim_equal(live, desired)
    }

    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
    }
}

impl Convergent for ConsolePlugin {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::console_plugin_equal(live, desired)
    }

    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
        live.spec = desired.spec.clone();
    }
}

impl Convergent for ServiceMonitor {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::service_monitor_equal(live, desired)
    }

    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
        live.spec = desired.spec.clone();
    }
}

impl Convergent for PrometheusRule {
    fn matches(live: &Self, desired: &Self) -> bool {
        equality::prometheus_rule_equal(live, desired)
    }

    fn merge(live: &mut Self, desired: &Self) {
        merge_meta(&mut live.metadata, &desired.metadata);
        live.spec = desired.spec.clone();
    }
}

/// Create the object when absent, update it when it differs, otherwise
/// leave it alone. Returns the object as stored afterwards.
pub async fn ensure<K, S>(store: &S, desired: &K) -> Result<(K, Outcome)>
where
    K: Convergent,
    S: ObjectStore,
{
    let name = desired.name_any();
    let namespace = desired.meta().namespace.clone();

    let (obj, outcome) = match store.get::<K>(namespace.as_deref(), &name).await? {
        None => (store.create(desired).await?, Outcome::Created),
        Some(live) if K::matches(&live, desired) => (live, Outcome::Skipped),
        Some(mut live) => {
            K::merge(&mut live, desired);
            (store.update(&live).await?, Outcome::Updated)
        }
    };

    record::<K>(&name, outcome);
    Ok((obj, outcome))
}

/// Create the object when absent; an existing one is returned untouched
pub async fn ensure_present<K, S>(store: &S, desired: &K) -> Result<(K, Outcome)>
where
    K: ManagedObject,
    S: ObjectStore,
{
    let name = desired.name_any();
    let namespace = desired.meta().namespace.clone();

    let (obj, outcome) = match store.get::<K>(namespace.as_deref(), &name).await? {
        Some(live) => (live, Outcome::Skipped),
        None => (store.create(desired).await?, Outcome::Created),
    };

    record::<K>(&name, outcome);
    Ok((obj, outcome))
}

/// Add `plugin` to the plugins enabled on the cluster console.
///
/// Clusters without the console operator have no `Console` object; the
/// plugin is then left unregistered.
pub async fn enable_console_plugin<S: ObjectStore>(store: &S, plugin: &str) -> Result<Outcome> {
    let Some(mut console) = store.get::<Console>(None, CONSOLE_CR_NAME).await? else {
        info!("Console {} not found, not enabling plugin {}", CONSOLE_CR_NAME, plugin);
        record::<Console>(CONSOLE_CR_NAME, Outcome::Skipped);
        return Ok(Outcome::Skipped);
    };

    let outcome = if console.spec.plugins.iter().any(|p| p == plugin) {
        Outcome::Skipped
    } else {
        console.spec.plugins.push(plugin.to_string());
        store.update(&console).await?;
        Outcome::Updated
    };

    record::<Console>(CONSOLE_CR_NAME, outcome);
    Ok(outcome)
}

/// Remove `plugin` from the plugins enabled on the cluster console
pub async fn disable_console_plugin<S: ObjectStore>(store: &S, plugin: &str) -> Result<Outcome> {
    let Some(mut console) = store.get::<Console>(None, CONSOLE_CR_NAME).await? else {
        record::<Console>(CONSOLE_CR_NAME, Outcome::Skipped);
        return Ok(Outcome::Skipped);
    };

    let before = console.spec.plugins.len();
    console.spec.plugins.retain(|p| p != plugin);
    let outcome = if console.spec.plugins.len() == before {
        Outcome::Skipped
    } else {
        store.update(&console).await?;
        Outcome::Updated
    };

    record::<Console>(CONSOLE_CR_NAME, outcome);
    Ok(outcome)
}

/// Delete the object if it exists
pub async fn ensure_absent<K, S>(store: &S, namespace: Option<&str>, name: &str) -> Result<Outcome>
where
    K: ManagedObject,
    S: ObjectStore,
{
    let outcome = if store.delete::<K>(namespace, name).await? {
        Outcome::Deleted
    } else {
        Outcome::Skipped
    };
    record::<K>(name, outcome);
    Ok(outcome)
}

/// Result of converging a Deployment
#[derive(Clone, Debug)]
pub struct DeploymentConvergence {
    pub deployment: Deployment,
    pub outcome: Outcome,
    /// `None` when the Deployment was created this cycle
    pub change: Option<ChangeReport>,
}

fn restart_token(deployment: &Deployment) -> Option<String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(FORCE_RELOAD_ANNOTATION).cloned())
}

fn set_restart_token(deployment: &mut Deployment, token: String) {
    let spec = deployment.spec.get_or_insert_with(Default::default);
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
        .insert(FORCE_RELOAD_ANNOTATION.to_string(), token);
}

/// Record fresh version stamps and drop the legacy hash annotations
fn write_stamps(deployment: &mut Deployment, tokens: &DependencyTokens) {
    let annotations = deployment.annotations_mut();
    for legacy in TrackedDependency::ALL
        .iter()
        .filter_map(|d| d.legacy_annotation())
    {
        annotations.remove(legacy);
    }
    annotations.extend(tokens.version_stamps());
}

/// Converge a Deployment.
///
/// A structural change replaces the live spec with the desired one while
/// carrying over the live restart token. A dependency change writes a new
/// restart token, which rolls the pods even when the spec is unchanged.
/// Version stamps are written with every write and never on their own
/// unless legacy hashes are being migrated.
pub async fn converge_deployment<S: ObjectStore>(
    store: &S,
    desired: &Deployment,
    tokens: &DependencyTokens,
) -> Result<DeploymentConvergence> {
    let name = desired.name_any();
    let namespace = desired.namespace();

    let Some(live) = store
        .get::<Deployment>(namespace.as_deref(), &name)
        .await?
    else {
        let mut created = desired.clone();
        write_stamps(&mut created, tokens);
        let deployment = store.create(&created).await?;
        record::<Deployment>(&name, Outcome::Created);
        return Ok(DeploymentConvergence {
            deployment,
            outcome: Outcome::Created,
            change: None,
        });
    };

    let report = detect(&live, desired, tokens);
    if !report.requires_action() {
        record::<Deployment>(&name, Outcome::Skipped);
        return Ok(DeploymentConvergence {
            deployment: live,
            outcome: Outcome::Skipped,
            change: Some(report),
        });
    }

    let previous_token = restart_token(&live);
    let mut next = live.clone();

    if report.spec_changed {
        merge_meta(&mut next.metadata, &desired.metadata);
        next.spec = desired.spec.clone();
        if let Some(token) = previous_token.clone() {
            set_restart_token(&mut next, token);
        }
    }
    if report.dependencies_changed() {
        info!(
            changed = ?report.changed_dependencies,
            signal = report.signal,
            "Dependencies of {} changed, restarting pods",
            name
        );
        set_restart_token(&mut next, next_restart_token(previous_token.as_deref()));
    }
    write_stamps(&mut next, tokens);

    let outcome = if report.dependencies_changed() {
        Outcome::Restarted
    } else if report.spec_changed {
        Outcome::Updated
    } else {
        Outcome::StampsMigrated
    };

    let deployment = store.update(&next).await?;
    record::<Deployment>(&name, outcome);
    Ok(DeploymentConvergence {
        deployment,
        outcome,
        change: Some(report),
    })
}

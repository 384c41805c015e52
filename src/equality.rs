//! Equality oracle
//!
//! Decides whether a live object already matches its desired form. The
//! comparison is semantic: lists the API server may reorder are compared as
//! sets keyed by name, unset and empty collections are the same thing, and
//! fields the server fills in on its own are ignored.

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, PersistentVolumeClaim, Probe, Secret, Service,
    ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::{BTreeMap, BTreeSet};

use crate::crd::console::ConsolePlugin;
use crate::crd::monitoring::{PrometheusRule, ServiceMonitor};
use crate::resolver::data::DataObject;

fn list<T>(v: &Option<Vec<T>>) -> &[T] {
    v.as_deref().unwrap_or_default()
}

fn map_or_empty(v: &Option<BTreeMap<String, String>>) -> BTreeMap<String, String> {
    v.clone().unwrap_or_default()
}

/// Every entry of `desired` is present with the same value in `live`
pub fn is_subset(
    desired: &Option<BTreeMap<String, String>>,
    live: &Option<BTreeMap<String, String>>,
) -> bool {
    let live = map_or_empty(live);
    map_or_empty(desired)
        .iter()
        .all(|(k, v)| live.get(k) == Some(v))
}

/// Compare two lists as sets keyed by name. Duplicate names on either side
/// make the lists unequal.
fn keyed_equal<T>(
    a: &[T],
    b: &[T],
    name: impl Fn(&T) -> &str,
    eq: impl Fn(&T, &T) -> bool,
) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let b_by_name: BTreeMap<&str, &T> = b.iter().map(|item| (name(item), item)).collect();
    if b_by_name.len() != b.len() {
        return false;
    }
    let mut seen = BTreeSet::new();
    a.iter().all(|item| {
        seen.insert(name(item))
            && b_by_name
                .get(name(item))
                .is_some_and(|other| eq(item, other))
    })
}

/// Fill in the defaults the API server applies to a Deployment
pub fn set_deployment_defaults(deployment: &mut Deployment) {
    let spec = deployment.spec.get_or_insert_with(Default::default);
    spec.replicas.get_or_insert(1);

    let strategy = spec.strategy.get_or_insert_with(DeploymentStrategy::default);
    let strategy_type = strategy
        .type_
        .get_or_insert_with(|| "RollingUpdate".to_string());
    if strategy_type.as_str() == "RollingUpdate" {
        let rolling = strategy
            .rolling_update
            .get_or_insert_with(RollingUpdateDeployment::default);
        rolling
            .max_unavailable
            .get_or_insert_with(|| IntOrString::String("25%".to_string()));
        rolling
            .max_surge
            .get_or_insert_with(|| IntOrString::String("25%".to_string()));
    }

    spec.revision_history_limit.get_or_insert(10);
    spec.progress_deadline_seconds.get_or_insert(600);
}

/// Volumes match by name and source. Only the referenced object (or the
/// emptyDir medium) is compared; modes and items are left to the server.
pub fn volumes_equal(a: &[Volume], b: &[Volume]) -> bool {
    keyed_equal(a, b, |v| v.name.as_str(), volume_source_equal)
}

fn volume_source_equal(a: &Volume, b: &Volume) -> bool {
    if let (Some(x), Some(y)) = (&a.secret, &b.secret) {
        x.secret_name == y.secret_name
    } else if let (Some(x), Some(y)) = (&a.config_map, &b.config_map) {
        x.name == y.name
    } else if let (Some(x), Some(y)) = (&a.empty_dir, &b.empty_dir) {
        x.medium == y.medium
    } else if let (Some(x), Some(y)) = (&a.persistent_volume_claim, &b.persistent_volume_claim) {
        x.claim_name == y.claim_name
    } else {
        false
    }
}

pub fn env_equal(a: &[EnvVar], b: &[EnvVar]) -> bool {
    keyed_equal(a, b, |e| e.name.as_str(), |a, b| a == b)
}

pub fn volume_mounts_equal(a: &[VolumeMount], b: &[VolumeMount]) -> bool {
    keyed_equal(a, b, |m| m.name.as_str(), |a, b| a == b)
}

fn ports_equal(a: &[ContainerPort], b: &[ContainerPort]) -> bool {
    let normalize = |p: &ContainerPort| {
        let mut p = p.clone();
        p.protocol.get_or_insert_with(|| "TCP".to_string());
        p
    };
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| normalize(a) == normalize(b))
}

/// Probe handlers must match exactly. Timing fields that are unset or zero
/// on either side are not compared.
pub fn probe_equal(a: Option<&Probe>, b: Option<&Probe>) -> bool {
    let (a, b) = match (a, b) {
        (None, None) => return true,
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };

    if a.exec != b.exec
        || a.grpc != b.grpc
        || a.http_get != b.http_get
        || a.tcp_socket != b.tcp_socket
    {
        return false;
    }

    let timings = |p: &Probe| {
        [
            p.initial_delay_seconds,
            p.timeout_seconds,
            p.period_seconds,
            p.success_threshold,
            p.failure_threshold,
        ]
    };
    let comparable = timings(a).into_iter().zip(timings(b)).all(|pair| match pair {
        (Some(x), Some(y)) if x != 0 && y != 0 => x == y,
        _ => true,
    });

    comparable && a.termination_grace_period_seconds == b.termination_grace_period_seconds
}

pub fn container_equal(a: &Container, b: &Container) -> bool {
    a.name == b.name
        && a.image == b.image
        && ports_equal(list(&a.ports), list(&b.ports))
        && env_equal(list(&a.env), list(&b.env))
        && list(&a.args) == list(&b.args)
        && list(&a.command) == list(&b.command)
        && volume_mounts_equal(list(&a.volume_mounts), list(&b.volume_mounts))
        && a.resources.clone().unwrap_or_default() == b.resources.clone().unwrap_or_default()
        && a.security_context == b.security_context
        && a.image_pull_policy == b.image_pull_policy
        && probe_equal(a.liveness_probe.as_ref(), b.liveness_probe.as_ref())
        && probe_equal(a.readiness_probe.as_ref(), b.readiness_probe.as_ref())
        && probe_equal(a.startup_probe.as_ref(), b.startup_probe.as_ref())
}

pub fn containers_equal(a: &[Container], b: &[Container]) -> bool {
    keyed_equal(a, b, |c| c.name.as_str(), container_equal)
}

/// Compare the parts of a Deployment the operator manages. Both sides are
/// defaulted first so server-filled fields do not register as drift.
pub fn deployment_equal(live: &Deployment, desired: &Deployment) -> bool {
    let mut live = live.clone();
    let mut desired = desired.clone();
    set_deployment_defaults(&mut live);
    set_deployment_defaults(&mut desired);

    let (Some(a), Some(b)) = (live.spec.as_ref(), desired.spec.as_ref()) else {
        return false;
    };
    let pod_a = a.template.spec.clone().unwrap_or_default();
    let pod_b = b.template.spec.clone().unwrap_or_default();
    let template_labels = |d: &DeploymentSpec| {
        d.template.metadata.as_ref().and_then(|m| m.labels.clone())
    };

    a.replicas == b.replicas
        && a.strategy == b.strategy
        && a.revision_history_limit == b.revision_history_limit
        && a.progress_deadline_seconds == b.progress_deadline_seconds
        && a.selector.match_labels == b.selector.match_labels
        && is_subset(&template_labels(b), &template_labels(a))
        && map_or_empty(&pod_a.node_selector) == map_or_empty(&pod_b.node_selector)
        && list(&pod_a.tolerations) == list(&pod_b.tolerations)
        && volumes_equal(list(&pod_a.volumes), list(&pod_b.volumes))
        && containers_equal(&pod_a.containers, &pod_b.containers)
        && containers_equal(list(&pod_a.init_containers), list(&pod_b.init_containers))
        && pod_a.service_account_name == pod_b.service_account_name
}

pub fn config_map_equal(live: &ConfigMap, desired: &ConfigMap) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels)
        && map_or_empty(&live.data) == map_or_empty(&desired.data)
        && live.binary_data.clone().unwrap_or_default()
            == desired.binary_data.clone().unwrap_or_default()
}

pub fn service_equal(live: &Service, desired: &Service) -> bool {
    let (Some(a), Some(b)) = (live.spec.as_ref(), desired.spec.as_ref()) else {
        return false;
    };
    is_subset(&desired.metadata.labels, &live.metadata.labels)
        && is_subset(&desired.metadata.annotations, &live.metadata.annotations)
        && map_or_empty(&a.selector) == map_or_empty(&b.selector)
        && list(&a.ports) == list(&b.ports)
}

pub fn network_policy_equal(live: &NetworkPolicy, desired: &NetworkPolicy) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels) && live.spec == desired.spec
}

pub fn service_account_equal(live: &ServiceAccount, desired: &ServiceAccount) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels)
}

pub fn cluster_role_equal(live: &ClusterRole, desired: &ClusterRole) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels)
        && list(&live.rules) == list(&desired.rules)
}

pub fn cluster_role_binding_equal(
    live: &ClusterRoleBinding,
    desired: &ClusterRoleBinding,
) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels)
        && list(&live.subjects) == list(&desired.subjects)
        && live.role_ref == desired.role_ref
}

/// Whether the desired secret carries a payload of its own. Token secrets
/// get theirs from the platform.
pub fn secret_has_payload(secret: &Secret) -> bool {
    secret.data.as_ref().is_some_and(|d| !d.is_empty())
        || secret.string_data.as_ref().is_some_and(|d| !d.is_empty())
}

/// Type and metadata always; entries only when the desired secret has any
pub fn secret_equal(live: &Secret, desired: &Secret) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels)
        && is_subset(&desired.metadata.annotations, &live.metadata.annotations)
        && live.type_ == desired.type_
        && (!secret_has_payload(desired) || live.entries() == desired.entries())
}

/// Claims are immutable past creation apart from growing; only metadata is
/// compared.
pub fn persistent_volume_claim_equal(
    live: &PersistentVolumeClaim,
    desired: &PersistentVolumeClaim,
) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels)
}

pub fn console_plugin_equal(live: &ConsolePlugin, desired: &ConsolePlugin) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels) && live.spec == desired.spec
}

pub fn service_monitor_equal(live: &ServiceMonitor, desired: &ServiceMonitor) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels) && live.spec == desired.spec
}

pub fn prometheus_rule_equal(live: &PrometheusRule, desired: &PrometheusRule) -> bool {
    is_subset(&desired.metadata.labels, &live.metadata.labels) && live.spec == desired.spec
}

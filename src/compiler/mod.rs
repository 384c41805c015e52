//! Desired-state compiler
//!
//! Turns a config object plus its resolved external dependencies into the
//! complete set of objects the operator should own. Compilation is pure:
//! the same inputs always produce the same set, and nothing is read from
//! the cluster here.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::adapters::app_config::build_app_config_map;
use crate::adapters::cache_builder::{
    build_cache_bootstrap_secret, build_cache_config_map, build_cache_deployment, build_cache_pvc,
};
use crate::adapters::console_builder::{
    build_console_config_map, build_console_deployment, build_console_plugin,
};
use crate::adapters::deployment_builder::build_deployment;
use crate::adapters::exporter_config::{build_exporter_config_map, data_collection_enabled};
use crate::adapters::meta::EXPORTER_CONFIG_CM_NAME;
use crate::adapters::monitoring_builder::{
    build_metrics_reader_secret, build_prometheus_rule, build_service_monitor,
};
use crate::adapters::network_policy_builder::{
    build_cache_network_policy, build_console_network_policy, build_network_policy,
};
use crate::adapters::rbac_builder::{
    build_cluster_role, build_cluster_role_binding, build_service_account,
};
use crate::adapters::service_builder::{
    build_cache_service, build_console_service, build_service,
};
use crate::config::OperatorConfig;
use crate::crd::console::ConsolePlugin;
use crate::crd::monitoring::{PrometheusRule, ServiceMonitor};
use crate::crd::LightspeedConfig;
use crate::resolver::{external_references, ResolvedDependencies};
use crate::store::ManagedObject;
use crate::{Error, Result};

/// Identity of a managed object within the desired set
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: String,
    pub name: String,
}

impl ObjectKey {
    pub fn of<K: ManagedObject>(name: &str) -> Self {
        Self {
            kind: K::kind_name(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Kinds that can live in a [`DesiredResourceSet`]
pub trait DesiredKind: ManagedObject + Into<DesiredObject> {
    fn from_desired(obj: &DesiredObject) -> Option<&Self>;
}

macro_rules! desired_objects {
    ($($variant:ident),* $(,)?) => {
        /// A compiled object of any managed kind
        #[derive(Clone, Debug)]
        pub enum DesiredObject {
            $($variant($variant),)*
        }

        impl DesiredObject {
            pub fn key(&self) -> ObjectKey {
                match self {
                    $(DesiredObject::$variant(o) => ObjectKey::of::<$variant>(&o.name_any()),)*
                }
            }
        }

        $(
            impl From<$variant> for DesiredObject {
                fn from(obj: $variant) -> Self {
                    DesiredObject::$variant(obj)
                }
            }

            impl DesiredKind for $variant {
                fn from_desired(obj: &DesiredObject) -> Option<&Self> {
                    match obj {
                        DesiredObject::$variant(o) => Some(o),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )*
    };
}

desired_objects!(
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    ConfigMap,
    Deployment,
    Service,
    NetworkPolicy,
    Secret,
    PersistentVolumeClaim,
    ServiceMonitor,
    PrometheusRule,
    ConsolePlugin,
);

/// Objects that must exist, plus objects that must not
#[derive(Clone, Debug, Default)]
pub struct DesiredResourceSet {
    objects: BTreeMap<ObjectKey, DesiredObject>,
    absent: BTreeSet<ObjectKey>,
}

impl DesiredResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object; a second object under the same kind and name is an
    /// error and leaves the first in place.
    pub fn insert(&mut self, obj: impl Into<DesiredObject>) -> Result<()> {
        let obj = obj.into();
        let key = obj.key();
        if self.objects.contains_key(&key) || self.absent.contains(&key) {
            return Err(Error::DuplicateObject {
                kind: key.kind,
                name: key.name,
            });
        }
        self.objects.insert(key, obj);
        Ok(())
    }

    pub fn mark_absent<K: ManagedObject>(&mut self, name: &str) -> Result<()> {
        let key = ObjectKey::of::<K>(name);
        if self.objects.contains_key(&key) {
            return Err(Error::DuplicateObject {
                kind: key.kind,
                name: key.name,
            });
        }
        self.absent.insert(key);
        Ok(())
    }

    pub fn get<K: DesiredKind>(&self, name: &str) -> Option<&K> {
        self.objects
            .get(&ObjectKey::of::<K>(name))
            .and_then(K::from_desired)
    }

    /// Like [`get`](Self::get) but an error when missing
    pub fn require<K: DesiredKind>(&self, name: &str) -> Result<&K> {
        self.get(name).ok_or_else(|| {
            Error::ValidationError(format!(
                "desired state has no {} {}",
                K::kind_name(),
                name
            ))
        })
    }

    pub fn is_absent<K: ManagedObject>(&self, name: &str) -> bool {
        self.absent.contains(&ObjectKey::of::<K>(name))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.objects.keys()
    }

    pub fn absent(&self) -> impl Iterator<Item = &ObjectKey> {
        self.absent.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Compiles desired state for one operator deployment
pub struct DesiredStateCompiler<'a> {
    operator: &'a OperatorConfig,
}

impl<'a> DesiredStateCompiler<'a> {
    pub fn new(operator: &'a OperatorConfig) -> Self {
        Self { operator }
    }

    /// Identity objects only; these need no external dependencies
    pub fn compile_identity(&self, config: &LightspeedConfig) -> Result<DesiredResourceSet> {
        let mut set = DesiredResourceSet::new();
        self.add_identity(&mut set, config)?;
        Ok(set)
    }

    fn add_identity(
        &self,
        set: &mut DesiredResourceSet,
        config: &LightspeedConfig,
    ) -> Result<()> {
        set.insert(build_service_account(config, self.operator))?;
        set.insert(build_cluster_role(config))?;
        set.insert(build_cluster_role_binding(config, self.operator))?;
        Ok(())
    }

    /// Conversation cache objects; these read nothing besides the config
    pub fn compile_cache(&self, config: &LightspeedConfig) -> Result<DesiredResourceSet> {
        let mut set = DesiredResourceSet::new();
        self.add_cache(&mut set, config)?;
        Ok(set)
    }

    // A claim left over from disabled storage is kept: it holds user data.
    fn add_cache(&self, set: &mut DesiredResourceSet, config: &LightspeedConfig) -> Result<()> {
        let operator = self.operator;
        set.insert(build_cache_config_map(config, operator))?;
        set.insert(build_cache_bootstrap_secret(config, operator))?;
        if let Some(pvc) = build_cache_pvc(config, operator) {
            set.insert(pvc)?;
        }
        set.insert(build_cache_deployment(config, operator)?)?;
        set.insert(build_cache_service(config, operator))?;
        set.insert(build_cache_network_policy(config, operator))?;
        Ok(())
    }

    fn add_console(
        &self,
        set: &mut DesiredResourceSet,
        config: &LightspeedConfig,
        resolved: &ResolvedDependencies,
    ) -> Result<()> {
        let operator = self.operator;
        set.insert(build_console_config_map(config, operator))?;
        set.insert(build_console_deployment(config, operator)?)?;
        set.insert(build_console_service(config, operator))?;
        set.insert(build_console_network_policy(config, operator))?;
        set.insert(build_console_plugin(config, operator, resolved.serving_ca()))?;
        Ok(())
    }

    /// The full desired set.
    ///
    /// Every external reference of `config` must be present in `resolved`;
    /// a missing one fails with the same error the resolver would give.
    pub fn compile(
        &self,
        config: &LightspeedConfig,
        resolved: &ResolvedDependencies,
    ) -> Result<DesiredResourceSet> {
        let operator = self.operator;
        resolved.ensure_covers(&external_references(config, &operator.namespace))?;

        let mut set = DesiredResourceSet::new();
        self.add_identity(&mut set, config)?;
        self.add_cache(&mut set, config)?;

        set.insert(build_app_config_map(config, resolved, operator)?)?;
        if data_collection_enabled(config, resolved.telemetry_enabled) {
            set.insert(build_exporter_config_map(config, operator)?)?;
        } else {
            set.mark_absent::<ConfigMap>(EXPORTER_CONFIG_CM_NAME)?;
        }

        set.insert(build_deployment(config, operator, resolved.telemetry_enabled)?)?;
        set.insert(build_service(config, operator))?;
        set.insert(build_network_policy(config, operator))?;

        set.insert(build_metrics_reader_secret(config, operator))?;
        if operator.prometheus_available {
            set.insert(build_service_monitor(config, operator))?;
            set.insert(build_prometheus_rule(config, operator))?;
        }

        self.add_console(&mut set, config, resolved)?;

        Ok(set)
    }
}

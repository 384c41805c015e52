//! Reconcile orchestration for LightspeedConfig
//!
//! One cycle walks the managed objects in dependency order: service
//! account, RBAC, conversation cache, config artifacts, workload, network
//! policy, console plugin, then the observability objects. Desired state is
//! recompiled from scratch every cycle. A failure before the observability
//! step aborts the cycle; observability failures are reported but do not
//! fail it.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::ResourceExt;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::status::{self, Workloads};
use crate::adapters::cache_builder::build_cache_secret;
use crate::adapters::meta::{
    APP_CONFIG_CM_NAME, APP_SERVER_NAME, CACHE_BOOTSTRAP_SECRET_NAME, CACHE_CONFIG_CM_NAME,
    CACHE_PVC_NAME, CACHE_SERVER_NAME, CONSOLE_CR_NAME, CONSOLE_PLUGIN_NAME,
    EXPORTER_CONFIG_CM_NAME, METRICS_READER_SECRET_NAME, PROMETHEUS_RULE_NAME,
    SAR_ROLE_BINDING_NAME, SAR_ROLE_NAME, SERVICE_MONITOR_NAME,
};
use crate::applier::{
    converge_deployment, enable_console_plugin, ensure, ensure_absent, ensure_present,
    Convergent, Outcome,
};
use crate::change::{collect_cache_tokens, collect_tokens, ChangeReport, DependencyTokens};
use crate::compiler::{DesiredKind, DesiredResourceSet, DesiredStateCompiler, ObjectKey};
use crate::config::OperatorConfig;
use crate::crd::console::{Console, ConsolePlugin};
use crate::crd::monitoring::{PrometheusRule, ServiceMonitor};
use crate::crd::LightspeedConfig;
use crate::resolver::{resolve, stamp_watcher, ResolvedDependencies, WatchTable};
use crate::store::ObjectStore;
use crate::{Error, Result};

/// Steps of a reconcile cycle, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    ServiceAccount,
    Rbac,
    Cache,
    ConfigArtifacts,
    Workload,
    NetworkPolicy,
    ConsolePlugin,
    Observability,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::ServiceAccount => "service-account",
            Step::Rbac => "rbac",
            Step::Cache => "cache",
            Step::ConfigArtifacts => "config-artifacts",
            Step::Workload => "workload",
            Step::NetworkPolicy => "network-policy",
            Step::ConsolePlugin => "console-plugin",
            Step::Observability => "observability",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcomes of the objects handled by one step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepResult {
    pub step: Step,
    pub outcomes: Vec<(ObjectKey, Outcome)>,
}

/// Everything a finished cycle produced
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub steps: Vec<StepResult>,
    /// Failures of the observability step, which do not fail the cycle
    pub observability_errors: Vec<String>,
    /// App server Deployment as stored after the workload step
    pub deployment: Option<Deployment>,
    pub change: Option<ChangeReport>,
    pub cache_deployment: Option<Deployment>,
    pub cache_change: Option<ChangeReport>,
    pub console_deployment: Option<Deployment>,
    pub resolved: Option<ResolvedDependencies>,
}

impl CycleReport {
    fn push(&mut self, step: Step, outcomes: Vec<(ObjectKey, Outcome)>) {
        self.steps.push(StepResult { step, outcomes });
    }

    /// Outcome recorded for an object, if it was handled
    pub fn outcome(&self, key: &ObjectKey) -> Option<Outcome> {
        self.steps
            .iter()
            .flat_map(|s| s.outcomes.iter())
            .find(|(k, _)| k == key)
            .map(|(_, o)| *o)
    }

    /// Whether any step wrote to the store
    pub fn wrote(&self) -> bool {
        self.steps
            .iter()
            .flat_map(|s| s.outcomes.iter())
            .any(|(_, o)| o.wrote())
    }
}

fn checkpoint(cancel: &CancellationToken, step: Step) -> Result<()> {
    if cancel.is_cancelled() {
        info!("Reconcile cancelled before step {}", step);
        return Err(Error::Cancelled(step.name()));
    }
    debug!("Starting step {}", step);
    Ok(())
}

async fn ensure_desired<K, S>(
    store: &S,
    desired: &DesiredResourceSet,
    name: &str,
) -> Result<(ObjectKey, Outcome)>
where
    K: Convergent + DesiredKind,
    S: ObjectStore,
{
    let (_, outcome) = ensure(store, desired.require::<K>(name)?).await?;
    Ok((ObjectKey::of::<K>(name), outcome))
}

/// Optional objects are skipped when they were not compiled
async fn ensure_optional<K, S>(
    store: &S,
    desired: &DesiredResourceSet,
    name: &str,
) -> Result<Option<(ObjectKey, Outcome)>>
where
    K: Convergent + DesiredKind,
    S: ObjectStore,
{
    match desired.get::<K>(name) {
        Some(obj) => {
            let (_, outcome) = ensure(store, obj).await?;
            Ok(Some((ObjectKey::of::<K>(name), outcome)))
        }
        None => Ok(None),
    }
}

/// Drives reconcile cycles against an object store
pub struct Reconciler<S> {
    store: Arc<S>,
    operator: Arc<OperatorConfig>,
    watches: WatchTable,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: Arc<S>, operator: Arc<OperatorConfig>, watches: WatchTable) -> Self {
        Self {
            store,
            operator,
            watches,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn operator(&self) -> &OperatorConfig {
        &self.operator
    }

    pub fn watches(&self) -> &WatchTable {
        &self.watches
    }

    /// Run one cycle and write the resulting status conditions. A cancelled
    /// cycle leaves the status untouched.
    pub async fn reconcile(
        &self,
        config: &LightspeedConfig,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        let result = self.run_cycle(config, cancel).await;
        if matches!(result, Err(Error::Cancelled(_))) {
            return result;
        }

        let workloads = match &result {
            Ok(report) => Workloads {
                app_server: report.deployment.clone(),
                cache: report.cache_deployment.clone(),
                console: report.console_deployment.clone(),
            },
            Err(_) => {
                let (app_server, cache, console) = futures::join!(
                    self.read_deployment(APP_SERVER_NAME),
                    self.read_deployment(CACHE_SERVER_NAME),
                    self.read_deployment(CONSOLE_PLUGIN_NAME),
                );
                Workloads {
                    app_server,
                    cache,
                    console,
                }
            }
        };

        let existing = config
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();
        let conditions = status::build_conditions(
            existing,
            &result,
            &workloads,
            config.metadata.generation,
        );

        match status::write_status(self.store.as_ref(), config, conditions).await {
            Ok(_) => result,
            // The cycle error wins over the status error
            Err(e) => match result {
                Ok(_) => Err(e),
                Err(cycle) => {
                    warn!("Failed to write status: {}", e);
                    Err(cycle)
                }
            },
        }
    }

    async fn read_deployment(&self, name: &str) -> Option<Deployment> {
        self.store
            .get::<Deployment>(Some(&self.operator.namespace), name)
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to read deployment {} for status: {}", name, e);
                None
            })
    }

    /// Run the ordered steps of one cycle, checking for cancellation before
    /// each step.
    pub async fn run_cycle(
        &self,
        config: &LightspeedConfig,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        let store = self.store.as_ref();
        let namespace = self.operator.namespace.as_str();
        let compiler = DesiredStateCompiler::new(&self.operator);
        let mut report = CycleReport::default();

        info!("Reconciling LightspeedConfig {}", config.name_any());

        checkpoint(cancel, Step::ServiceAccount)?;
        let identity = compiler.compile_identity(config)?;
        let sa = ensure_desired::<ServiceAccount, _>(store, &identity, APP_SERVER_NAME).await?;
        report.push(Step::ServiceAccount, vec![sa]);

        checkpoint(cancel, Step::Rbac)?;
        let role = ensure_desired::<ClusterRole, _>(store, &identity, SAR_ROLE_NAME).await?;
        let binding =
            ensure_desired::<ClusterRoleBinding, _>(store, &identity, SAR_ROLE_BINDING_NAME)
                .await?;
        report.push(Step::Rbac, vec![role, binding]);

        checkpoint(cancel, Step::Cache)?;
        let cache_secret = &config.spec.ols.conversation_cache.postgres.credentials_secret;
        // A generated password is never rotated by the operator. The stamp
        // goes on before the cache tokens are read so resolution does not
        // move the version afterwards.
        let (secret, password) =
            ensure_present(store, &build_cache_secret(config, &self.operator)).await?;
        stamp_watcher(store, secret, &config.name_any()).await?;
        let cache = compiler.compile_cache(config)?;
        let (cache_config, bootstrap, claim) = futures::try_join!(
            ensure_desired::<ConfigMap, _>(store, &cache, CACHE_CONFIG_CM_NAME),
            ensure_desired::<Secret, _>(store, &cache, CACHE_BOOTSTRAP_SECRET_NAME),
            ensure_optional::<PersistentVolumeClaim, _>(store, &cache, CACHE_PVC_NAME),
        )?;
        let cache_tokens = collect_cache_tokens(store, namespace, cache_secret).await;
        let (cache_deployment, cache_service, cache_policy) = futures::try_join!(
            converge_deployment(
                store,
                cache.require::<Deployment>(CACHE_SERVER_NAME)?,
                &cache_tokens
            ),
            ensure_desired::<Service, _>(store, &cache, CACHE_SERVER_NAME),
            ensure_desired::<NetworkPolicy, _>(store, &cache, CACHE_SERVER_NAME),
        )?;
        let mut outcomes = vec![
            (ObjectKey::of::<Secret>(cache_secret), password),
            cache_config,
            bootstrap,
        ];
        outcomes.extend(claim);
        outcomes.extend([
            (ObjectKey::of::<Deployment>(CACHE_SERVER_NAME), cache_deployment.outcome),
            cache_service,
            cache_policy,
        ]);
        report.push(Step::Cache, outcomes);
        report.cache_deployment = Some(cache_deployment.deployment);
        report.cache_change = cache_deployment.change;

        checkpoint(cancel, Step::ConfigArtifacts)?;
        let resolved = resolve(store, config, namespace, &self.watches).await?;
        let desired = compiler.compile(config, &resolved)?;
        let exporter_absent = desired.is_absent::<ConfigMap>(EXPORTER_CONFIG_CM_NAME);
        let mut outcomes =
            vec![ensure_desired::<ConfigMap, _>(store, &desired, APP_CONFIG_CM_NAME).await?];
        if !exporter_absent {
            outcomes.push(
                ensure_desired::<ConfigMap, _>(store, &desired, EXPORTER_CONFIG_CM_NAME).await?,
            );
        }
        report.push(Step::ConfigArtifacts, outcomes);

        checkpoint(cancel, Step::Workload)?;
        let tokens = collect_tokens(
            store,
            namespace,
            config,
            &resolved,
            desired.require::<ConfigMap>(APP_CONFIG_CM_NAME)?,
        )
        .await;
        let (deployment, service) = futures::try_join!(
            converge_deployment(store, desired.require::<Deployment>(APP_SERVER_NAME)?, &tokens),
            ensure_desired::<Service, _>(store, &desired, APP_SERVER_NAME),
        )?;
        let mut outcomes = vec![
            (ObjectKey::of::<Deployment>(APP_SERVER_NAME), deployment.outcome),
            service,
        ];
        // Removed only once the pods no longer mount it
        if exporter_absent {
            let outcome =
                ensure_absent::<ConfigMap, _>(store, Some(namespace), EXPORTER_CONFIG_CM_NAME)
                    .await?;
            outcomes.push((ObjectKey::of::<ConfigMap>(EXPORTER_CONFIG_CM_NAME), outcome));
        }
        report.push(Step::Workload, outcomes);
        report.deployment = Some(deployment.deployment);
        report.change = deployment.change;

        checkpoint(cancel, Step::NetworkPolicy)?;
        let policy = ensure_desired::<NetworkPolicy, _>(store, &desired, APP_SERVER_NAME).await?;
        report.push(Step::NetworkPolicy, vec![policy]);

        checkpoint(cancel, Step::ConsolePlugin)?;
        let (console_config, console_policy) = futures::try_join!(
            ensure_desired::<ConfigMap, _>(store, &desired, CONSOLE_PLUGIN_NAME),
            ensure_desired::<NetworkPolicy, _>(store, &desired, CONSOLE_PLUGIN_NAME),
        )?;
        let untracked = DependencyTokens::default();
        let (console_deployment, console_service) = futures::try_join!(
            converge_deployment(
                store,
                desired.require::<Deployment>(CONSOLE_PLUGIN_NAME)?,
                &untracked
            ),
            ensure_desired::<Service, _>(store, &desired, CONSOLE_PLUGIN_NAME),
        )?;
        let plugin = ensure_desired::<ConsolePlugin, _>(store, &desired, CONSOLE_PLUGIN_NAME).await?;
        let activation = enable_console_plugin(store, CONSOLE_PLUGIN_NAME).await?;
        report.push(
            Step::ConsolePlugin,
            vec![
                console_config,
                console_policy,
                (ObjectKey::of::<Deployment>(CONSOLE_PLUGIN_NAME), console_deployment.outcome),
                console_service,
                plugin,
                (ObjectKey::of::<Console>(CONSOLE_CR_NAME), activation),
            ],
        );
        report.console_deployment = Some(console_deployment.deployment);

        checkpoint(cancel, Step::Observability)?;
        let (secret, monitor, rule) = futures::join!(
            ensure_optional::<Secret, _>(store, &desired, METRICS_READER_SECRET_NAME),
            ensure_optional::<ServiceMonitor, _>(store, &desired, SERVICE_MONITOR_NAME),
            ensure_optional::<PrometheusRule, _>(store, &desired, PROMETHEUS_RULE_NAME),
        );
        let mut outcomes = Vec::new();
        for result in [secret, monitor, rule] {
            match result {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => {
                    warn!("Observability step failed: {}", e);
                    report.observability_errors.push(e.to_string());
                }
            }
        }
        report.push(Step::Observability, outcomes);

        report.resolved = Some(resolved);
        info!(
            "Reconciled LightspeedConfig {} (wrote={})",
            config.name_any(),
            report.wrote()
        );
        Ok(report)
    }
}

//! Controller for LightspeedConfig resources

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::{
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event},
        reflector::ObjectRef,
        watcher::Config,
    },
    Api, Resource, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::adapters::meta::CONSOLE_PLUGIN_NAME;
use crate::applier::disable_console_plugin;
use crate::controllers::Context;
use crate::crd::console::ConsolePlugin;
use crate::crd::{LightspeedConfig, SINGLETON_NAME};
use crate::metrics::prometheus::{RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS};
use crate::resolver::telemetry::{PULL_SECRET_NAME, PULL_SECRET_NAMESPACE};
use crate::resolver::{ExternalKey, ExternalKind, WatchTable};
use crate::Error;

/// Finalizer name for cleanup
pub const FINALIZER: &str = "lightspeed.io/finalizer";

const KIND: &str = "LightspeedConfig";

/// Map an owned object back to the config that owns it
fn owner_of<K: Resource>(obj: K) -> Option<ObjectRef<LightspeedConfig>> {
    obj.owner_references()
        .iter()
        .find(|r| r.kind == KIND)
        .map(|r| ObjectRef::new(&r.name))
}

/// Map an external Secret or ConfigMap to the configs that consume it
fn consumers_of<K: Resource>(
    watches: &WatchTable,
    kind: ExternalKind,
    obj: &K,
) -> Vec<ObjectRef<LightspeedConfig>> {
    let key = ExternalKey::new(kind, &obj.namespace().unwrap_or_default(), &obj.name_any());
    watches
        .owners_for(&key, obj.annotations())
        .iter()
        .map(|owner| ObjectRef::new(owner))
        .collect()
}

/// Run the LightspeedConfig controller
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let namespace = ctx.reconciler.operator().namespace.clone();
    let configs: Api<LightspeedConfig> = Api::all(client.clone());

    info!("Starting LightspeedConfig controller");

    let secret_watches = ctx.reconciler.watches().clone();
    let config_map_watches = ctx.reconciler.watches().clone();

    Controller::new(configs, Config::default().any_semantic())
        .watches(
            Api::<Deployment>::namespaced(client.clone(), &namespace),
            Config::default(),
            owner_of::<Deployment>,
        )
        .watches(
            Api::<Service>::namespaced(client.clone(), &namespace),
            Config::default(),
            owner_of::<Service>,
        )
        .watches(
            Api::<ConfigMap>::namespaced(client.clone(), &namespace),
            Config::default(),
            move |cm| {
                let mut targets = consumers_of(&config_map_watches, ExternalKind::ConfigMap, &cm);
                targets.extend(owner_of(cm));
                targets
            },
        )
        .watches(
            Api::<Secret>::namespaced(client.clone(), &namespace),
            Config::default(),
            move |secret| {
                let mut targets = consumers_of(&secret_watches, ExternalKind::Secret, &secret);
                targets.extend(owner_of(secret));
                targets
            },
        )
        .watches(
            Api::<ConsolePlugin>::all(client.clone()),
            Config::default(),
            owner_of::<ConsolePlugin>,
        )
        .watches(
            Api::<Secret>::namespaced(client.clone(), PULL_SECRET_NAMESPACE),
            Config::default().fields(&format!("metadata.name={}", PULL_SECRET_NAME)),
            |_| Some(ObjectRef::<LightspeedConfig>::new(SINGLETON_NAME)),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("Reconciled {:?}", o),
                Err(e) => error!("Reconcile failed: {:?}", e),
            }
        })
        .await;

    info!("LightspeedConfig controller stopped");
}

/// Reconcile a LightspeedConfig resource
#[instrument(skip(config, ctx), fields(name = %config.name_any()))]
async fn reconcile(config: Arc<LightspeedConfig>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = config.name_any();
    if name != SINGLETON_NAME {
        warn!(
            "Ignoring LightspeedConfig {}, only {} is reconciled",
            name, SINGLETON_NAME
        );
        return Ok(Action::await_change());
    }

    let start = std::time::Instant::now();
    RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let configs: Api<LightspeedConfig> = Api::all(ctx.client.clone());
    let result = finalizer(&configs, FINALIZER, config, |event| async {
        match event {
            Event::Apply(config) => apply(&config, &ctx).await,
            Event::Cleanup(config) => cleanup(&config, &ctx).await,
        }
    })
    .await;

    let duration = start.elapsed().as_secs_f64();
    RECONCILE_DURATION.with_label_values(&[KIND]).observe(duration);

    match &result {
        Ok(_) => {
            ctx.reset_backoff(&name);
            info!("Successfully reconciled {} in {:.2}s", name, duration);
        }
        Err(e) => error!("Failed to reconcile {}: {:?}", name, e),
    }

    Ok(result?)
}

async fn apply(config: &LightspeedConfig, ctx: &Context) -> Result<Action, Error> {
    match ctx.reconciler.reconcile(config, &ctx.shutdown).await {
        Ok(_) => Ok(Action::requeue(ctx.reconciler.operator().reconcile_interval)),
        Err(Error::Cancelled(step)) => {
            info!("Reconcile of {} stopped before {}", config.name_any(), step);
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// Managed objects go away with their owner references; the dependency
/// edges and the console plugin registration are dropped here.
async fn cleanup(config: &LightspeedConfig, ctx: &Context) -> Result<Action, Error> {
    let name = config.name_any();
    info!("Cleaning up LightspeedConfig {}", name);
    disable_console_plugin(ctx.reconciler.store(), CONSOLE_PLUGIN_NAME).await?;
    ctx.reconciler.watches().remove_owner(&name);
    Ok(Action::await_change())
}

/// Requeue with per-object exponential backoff
fn error_policy(config: Arc<LightspeedConfig>, err: &Error, ctx: Arc<Context>) -> Action {
    let name = config.name_any();
    RECONCILIATION_ERRORS
        .with_label_values(&[KIND, err.reason()])
        .inc();

    let delay: Duration = ctx.next_backoff(&name);
    error!(
        "Reconciliation error for {}: {}; retrying in {}s",
        name,
        err,
        delay.as_secs()
    );
    Action::requeue(delay)
}

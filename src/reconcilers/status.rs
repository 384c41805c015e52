//! Status conditions written back onto the LightspeedConfig

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::debug;

use super::lightspeed::CycleReport;
use crate::crd::{Condition, LightspeedConfig, LightspeedConfigStatus};
use crate::resolver::CACHE_REFERRER;
use crate::store::ObjectStore;
use crate::{Error, Result};

pub const CONDITION_API_READY: &str = "ApiReady";
pub const CONDITION_CACHE_READY: &str = "CacheReady";
pub const CONDITION_CONSOLE_PLUGIN_READY: &str = "ConsolePluginReady";
pub const CONDITION_RECONCILED: &str = "Reconciled";

const STATUS_TRUE: &str = "True";
const STATUS_FALSE: &str = "False";

/// Deployments the readiness conditions are derived from
#[derive(Clone, Debug, Default)]
pub struct Workloads {
    pub app_server: Option<Deployment>,
    pub cache: Option<Deployment>,
    pub console: Option<Deployment>,
}

fn condition(type_: &str, status: &str, reason: &str, message: impl Into<String>) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time: Utc::now(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation: None,
    }
}

/// Insert or replace a condition by type. The transition time of the
/// existing condition is kept when its status does not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition_time = existing.last_transition_time;
            }
            *existing = new;
        }
        None => conditions.push(new),
    }
}

/// Compare condition lists by type, status, reason and message
pub fn conditions_equivalent(a: &[Condition], b: &[Condition]) -> bool {
    let key = |c: &Condition| (c.type_.clone(), c.status.clone(), c.reason.clone(), c.message.clone());
    let mut a: Vec<_> = a.iter().map(key).collect();
    let mut b: Vec<_> = b.iter().map(key).collect();
    a.sort();
    b.sort();
    a == b
}

fn deployment_condition(type_: &str, deployment: Option<&Deployment>, what: &str) -> Condition {
    let Some(deployment) = deployment else {
        return condition(
            type_,
            STATUS_FALSE,
            "DeploymentNotFound",
            format!("{} deployment does not exist", what),
        );
    };

    let status = deployment.status.clone().unwrap_or_default();
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let available = status.available_replicas.unwrap_or(0);
    let message = format!("{}/{} replicas available", available, desired);

    if available > 0 {
        condition(type_, STATUS_TRUE, "DeploymentAvailable", message)
    } else {
        condition(type_, STATUS_FALSE, "DeploymentNotAvailable", message)
    }
}

/// A cycle that failed on the cache credentials reports that failure;
/// otherwise readiness follows the postgres Deployment.
fn cache_ready(result: &Result<CycleReport>, deployment: Option<&Deployment>) -> Condition {
    match result {
        Err(e) if e.referrer() == Some(CACHE_REFERRER) => {
            condition(CONDITION_CACHE_READY, STATUS_FALSE, e.reason(), e.to_string())
        }
        _ => deployment_condition(CONDITION_CACHE_READY, deployment, "conversation cache"),
    }
}

fn reconciled(result: &Result<CycleReport>) -> Condition {
    match result {
        Ok(report) if report.observability_errors.is_empty() => condition(
            CONDITION_RECONCILED,
            STATUS_TRUE,
            "ReconcileSucceeded",
            "all managed objects converged",
        ),
        // Observability failures do not block the workload
        Ok(report) => condition(
            CONDITION_RECONCILED,
            STATUS_TRUE,
            "ObservabilityDegraded",
            report.observability_errors.join("; "),
        ),
        Err(e) => condition(CONDITION_RECONCILED, STATUS_FALSE, e.reason(), e.to_string()),
    }
}

/// Compute the conditions for a finished cycle on top of `existing`
pub fn build_conditions(
    existing: &[Condition],
    result: &Result<CycleReport>,
    workloads: &Workloads,
    generation: Option<i64>,
) -> Vec<Condition> {
    let mut conditions = existing.to_vec();
    let computed = [
        deployment_condition(CONDITION_API_READY, workloads.app_server.as_ref(), "app server"),
        cache_ready(result, workloads.cache.as_ref()),
        deployment_condition(
            CONDITION_CONSOLE_PLUGIN_READY,
            workloads.console.as_ref(),
            "console plugin",
        ),
        reconciled(result),
    ];
    for mut c in computed {
        c.observed_generation = generation;
        set_condition(&mut conditions, c);
    }
    conditions
}

/// Write the status when it differs from what is stored. Returns whether
/// a write happened.
pub async fn write_status<S: ObjectStore>(
    store: &S,
    config: &LightspeedConfig,
    conditions: Vec<Condition>,
) -> Result<bool> {
    let existing = config
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    if conditions_equivalent(existing, &conditions) {
        debug!("Status of {} unchanged", config.name_any());
        return Ok(false);
    }

    let status = serde_json::to_value(LightspeedConfigStatus { conditions }).map_err(Error::from)?;
    store
        .patch_status::<LightspeedConfig>(None, &config.name_any(), &status)
        .await?;
    Ok(true)
}

//! Platform telemetry detection from the cluster pull secret

use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use super::data::DataObject;
use crate::store::ObjectStore;
use crate::{Error, Result};

pub const PULL_SECRET_NAMESPACE: &str = "openshift-config";
pub const PULL_SECRET_NAME: &str = "pull-secret";
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
pub const TELEMETRY_AUTH_HOST: &str = "cloud.openshift.com";

/// Telemetry is on when the pull secret exists and carries credentials for
/// the telemetry host. A missing secret means off; any other read failure
/// is returned.
pub async fn telemetry_enabled<S: ObjectStore>(store: &S) -> Result<bool> {
    let Some(secret) = store
        .get::<Secret>(Some(PULL_SECRET_NAMESPACE), PULL_SECRET_NAME)
        .await?
    else {
        debug!(
            "Pull secret {}/{} not found, telemetry disabled",
            PULL_SECRET_NAMESPACE, PULL_SECRET_NAME
        );
        return Ok(false);
    };

    let entries = secret.entries();
    let raw = entries.get(DOCKER_CONFIG_KEY).ok_or_else(|| Error::MissingKey {
        referrer: "telemetry".to_string(),
        kind: "pull secret",
        name: format!("{}/{}", PULL_SECRET_NAMESPACE, PULL_SECRET_NAME),
        key: DOCKER_CONFIG_KEY.to_string(),
    })?;

    pull_secret_enables_telemetry(raw)
}

/// Inspect a `.dockerconfigjson` payload for the telemetry host entry
pub fn pull_secret_enables_telemetry(raw: &[u8]) -> Result<bool> {
    let doc: serde_json::Value = serde_json::from_slice(raw).map_err(|e| {
        Error::ValidationError(format!(
            "pull secret {}/{} is not valid JSON: {}",
            PULL_SECRET_NAMESPACE, PULL_SECRET_NAME, e
        ))
    })?;

    Ok(doc
        .get("auths")
        .and_then(|auths| auths.get(TELEMETRY_AUTH_HOST))
        .is_some())
}

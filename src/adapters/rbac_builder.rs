//! Identity of the app server: its ServiceAccount and the cluster role it
//! needs for access reviews, token reviews and telemetry detection.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};

use super::meta::{
    app_server_labels, owned_meta, APP_SERVER_NAME, SAR_ROLE_BINDING_NAME, SAR_ROLE_NAME,
};
use crate::config::OperatorConfig;
use crate::crd::LightspeedConfig;
use crate::resolver::telemetry::PULL_SECRET_NAME;

fn policy_rule(group: &str, resource: &str, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

pub fn build_service_account(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(
            config,
            APP_SERVER_NAME,
            Some(&operator.namespace),
            app_server_labels(),
        ),
        ..Default::default()
    }
}

pub fn build_cluster_role(config: &LightspeedConfig) -> ClusterRole {
    let mut pull_secret = policy_rule("", "secrets", &["get"]);
    pull_secret.resource_names = Some(vec![PULL_SECRET_NAME.to_string()]);

    ClusterRole {
        metadata: owned_meta(config, SAR_ROLE_NAME, None, app_server_labels()),
        rules: Some(vec![
            policy_rule("authorization.k8s.io", "subjectaccessreviews", &["create"]),
            policy_rule("authentication.k8s.io", "tokenreviews", &["create"]),
            policy_rule("config.openshift.io", "clusterversions", &["get", "list"]),
            pull_secret,
        ]),
        ..Default::default()
    }
}

pub fn build_cluster_role_binding(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: owned_meta(config, SAR_ROLE_BINDING_NAME, None, app_server_labels()),
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: APP_SERVER_NAME.to_string(),
            namespace: Some(operator.namespace.clone()),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: SAR_ROLE_NAME.to_string(),
        },
    }
}

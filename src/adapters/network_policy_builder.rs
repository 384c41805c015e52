//! NetworkPolicies restricting ingress to the operand pods

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use std::collections::BTreeMap;

use super::meta::{
    app_server_labels, cache_server_labels, console_plugin_labels, owned_meta, APP_SERVER_NAME,
    APP_SERVER_PORT, CACHE_SERVER_NAME, CACHE_SERVER_PORT, CONSOLE_PLUGIN_NAME,
    CONSOLE_PLUGIN_PORT,
};
use crate::config::OperatorConfig;
use crate::crd::LightspeedConfig;

const MONITORING_NAMESPACE: &str = "openshift-monitoring";
const CONSOLE_NAMESPACE: &str = "openshift-console";

fn match_labels(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

fn in_values(key: &str, value: &str) -> LabelSelectorRequirement {
    LabelSelectorRequirement {
        key: key.to_string(),
        operator: "In".to_string(),
        values: Some(vec![value.to_string()]),
    }
}

fn rule(peer: NetworkPolicyPeer, port: i32) -> NetworkPolicyIngressRule {
    NetworkPolicyIngressRule {
        from: Some(vec![peer]),
        ports: Some(vec![NetworkPolicyPort {
            protocol: Some("TCP".to_string()),
            port: Some(IntOrString::Int(port)),
            ..Default::default()
        }]),
    }
}

/// Ingress is allowed from platform prometheus, the console and the
/// ingress routers, all on the https port.
pub fn build_network_policy(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> NetworkPolicy {
    let prometheus = NetworkPolicyPeer {
        pod_selector: Some(LabelSelector {
            match_expressions: Some(vec![
                in_values("app.kubernetes.io/name", "prometheus"),
                in_values("prometheus", "k8s"),
            ]),
            ..Default::default()
        }),
        namespace_selector: Some(match_labels(&[(
            "kubernetes.io/metadata.name",
            MONITORING_NAMESPACE,
        )])),
        ..Default::default()
    };

    let console = console_peer();

    let ingress = NetworkPolicyPeer {
        namespace_selector: Some(match_labels(&[(
            "network.openshift.io/policy-group",
            "ingress",
        )])),
        ..Default::default()
    };

    ingress_policy(
        config,
        operator,
        APP_SERVER_NAME,
        app_server_labels(),
        vec![
            rule(prometheus, APP_SERVER_PORT),
            rule(console, APP_SERVER_PORT),
            rule(ingress, APP_SERVER_PORT),
        ],
    )
}

/// Only the app server pods reach the database
pub fn build_cache_network_policy(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> NetworkPolicy {
    let app_server = NetworkPolicyPeer {
        pod_selector: Some(LabelSelector {
            match_labels: Some(app_server_labels()),
            ..Default::default()
        }),
        ..Default::default()
    };

    ingress_policy(
        config,
        operator,
        CACHE_SERVER_NAME,
        cache_server_labels(),
        vec![rule(app_server, CACHE_SERVER_PORT)],
    )
}

/// Only the platform console fetches the plugin assets
pub fn build_console_network_policy(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> NetworkPolicy {
    ingress_policy(
        config,
        operator,
        CONSOLE_PLUGIN_NAME,
        console_plugin_labels(),
        vec![rule(console_peer(), CONSOLE_PLUGIN_PORT)],
    )
}

fn console_peer() -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(match_labels(&[("app", "console")])),
        namespace_selector: Some(match_labels(&[(
            "kubernetes.io/metadata.name",
            CONSOLE_NAMESPACE,
        )])),
        ..Default::default()
    }
}

fn ingress_policy(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
    name: &str,
    labels: BTreeMap<String, String>,
    ingress: Vec<NetworkPolicyIngressRule>,
) -> NetworkPolicy {
    NetworkPolicy {
        metadata: owned_meta(config, name, Some(&operator.namespace), labels.clone()),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            ingress: Some(ingress),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

//! Observability objects: metrics reader token, ServiceMonitor and
//! PrometheusRule for the app server.

use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;

use super::meta::{
    app_server_labels, owned_meta, APP_SERVER_NAME, METRICS_READER_SA_NAME,
    METRICS_READER_SECRET_NAME, PROMETHEUS_RULE_NAME, SERVICE_MONITOR_NAME,
};
use crate::config::OperatorConfig;
use crate::crd::monitoring::{
    MatchLabelsSelector, MonitorAuthorization, MonitorEndpoint, MonitorTlsConfig,
    PrometheusRule, PrometheusRuleSpec, RecordingRule, RuleGroup, SecretKeyRef, ServiceMonitor,
    ServiceMonitorSpec,
};
use crate::crd::LightspeedConfig;

const METRICS_PATH: &str = "/metrics";

pub fn build_metrics_reader_secret(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> Secret {
    let labels = BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "service-account-token".to_string(),
        ),
        ("app.kubernetes.io/component".to_string(), "metrics".to_string()),
        (
            "app.kubernetes.io/part-of".to_string(),
            "lightspeed-operator".to_string(),
        ),
    ]);
    let mut metadata = owned_meta(
        config,
        METRICS_READER_SECRET_NAME,
        Some(&operator.namespace),
        labels,
    );
    metadata.annotations = Some(BTreeMap::from([(
        "kubernetes.io/service-account.name".to_string(),
        METRICS_READER_SA_NAME.to_string(),
    )]));

    Secret {
        metadata,
        type_: Some("kubernetes.io/service-account-token".to_string()),
        ..Default::default()
    }
}

pub fn build_service_monitor(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> ServiceMonitor {
    let mut labels = app_server_labels();
    labels.insert(
        "monitoring.openshift.io/collection-profile".to_string(),
        "full".to_string(),
    );
    labels.insert("app.kubernetes.io/component".to_string(), "metrics".to_string());
    labels.insert("openshift.io/user-monitoring".to_string(), "false".to_string());

    let endpoint = MonitorEndpoint {
        port: "https".to_string(),
        path: METRICS_PATH.to_string(),
        interval: "30s".to_string(),
        scheme: "https".to_string(),
        tls_config: Some(MonitorTlsConfig {
            ca_file: "/etc/prometheus/configmaps/serving-certs-ca-bundle/service-ca.crt"
                .to_string(),
            cert_file: "/etc/prometheus/secrets/metrics-client-certs/tls.crt".to_string(),
            key_file: "/etc/prometheus/secrets/metrics-client-certs/tls.key".to_string(),
            insecure_skip_verify: false,
            server_name: format!("{}.{}.svc", APP_SERVER_NAME, operator.namespace),
        }),
        authorization: Some(MonitorAuthorization {
            type_: "Bearer".to_string(),
            credentials: SecretKeyRef {
                name: METRICS_READER_SECRET_NAME.to_string(),
                key: "token".to_string(),
            },
        }),
    };

    let mut monitor = ServiceMonitor::new(
        SERVICE_MONITOR_NAME,
        ServiceMonitorSpec {
            endpoints: vec![endpoint],
            job_label: Some("app.kubernetes.io/name".to_string()),
            selector: MatchLabelsSelector {
                match_labels: app_server_labels(),
            },
        },
    );
    monitor.metadata = owned_meta(
        config,
        SERVICE_MONITOR_NAME,
        Some(&operator.namespace),
        labels,
    );
    monitor
}

fn status_code_rule(class: &str) -> RecordingRule {
    RecordingRule {
        record: format!("ols:rest_api_query_calls_total:{}", class),
        expr: format!(
            "sum by(status_code) (ols_rest_api_calls_total{{path=\"/v1/streaming_query\",status_code=~\"{}..\"}})",
            &class[..1]
        ),
        labels: BTreeMap::from([("status_code".to_string(), class.to_string())]),
    }
}

pub fn build_prometheus_rule(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> PrometheusRule {
    let mut labels = app_server_labels();
    labels.insert("app.kubernetes.io/component".to_string(), "metrics".to_string());

    let mut rule = PrometheusRule::new(
        PROMETHEUS_RULE_NAME,
        PrometheusRuleSpec {
            groups: vec![RuleGroup {
                name: "ols.operations.rules".to_string(),
                rules: vec![
                    status_code_rule("2xx"),
                    status_code_rule("4xx"),
                    status_code_rule("5xx"),
                    RecordingRule {
                        record: "ols:provider_model_configuration".to_string(),
                        expr: "max by (provider,model) (ols_provider_model_configuration)"
                            .to_string(),
                        labels: BTreeMap::new(),
                    },
                ],
            }],
        },
    );
    rule.metadata = owned_meta(
        config,
        PROMETHEUS_RULE_NAME,
        Some(&operator.namespace),
        labels,
    );
    rule
}

//! Console plugin objects: the nginx Deployment serving the plugin assets
//! and the ConsolePlugin registering it with the platform console

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSecurityContext, PodSpec,
    PodTemplateSpec, SeccompProfile, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

use super::deployment_builder::{
    apply_scheduling, resources_or_default, restricted_security_context, PodStorage,
    VOLUME_DEFAULT_MODE,
};
use super::meta::{
    console_plugin_labels, owned_meta, APP_SERVER_NAME, APP_SERVER_PORT,
    CONSOLE_CERT_SECRET_NAME, CONSOLE_PLUGIN_NAME, CONSOLE_PLUGIN_PORT, CONSOLE_PROXY_ALIAS,
};
use crate::config::OperatorConfig;
use crate::crd::console::{
    ConsolePlugin, ConsolePluginSpec, PluginBackend, PluginI18n, PluginProxy, PluginService,
    ProxyEndpoint, ProxyService,
};
use crate::crd::LightspeedConfig;
use crate::Result;

const NGINX_CONFIG_FILENAME: &str = "nginx.conf";
const CERT_VOLUME: &str = "lightspeed-console-plugin-cert";
const NGINX_CONFIG_VOLUME: &str = "nginx-config";
const NGINX_TEMP_VOLUME: &str = "nginx-temp";

fn nginx_config() -> String {
    format!(
        r#"error_log /dev/stdout info;
events {{}}
http {{
  include /etc/nginx/mime.types;
  default_type application/octet-stream;
  keepalive_timeout 65;
  client_body_temp_path /tmp/nginx/client_body;
  proxy_temp_path /tmp/nginx/proxy;
  fastcgi_temp_path /tmp/nginx/fastcgi;
  uwsgi_temp_path /tmp/nginx/uwsgi;
  scgi_temp_path /tmp/nginx/scgi;
  server {{
    listen {port} ssl;
    listen [::]:{port} ssl;
    ssl_certificate /var/cert/tls.crt;
    ssl_certificate_key /var/cert/tls.key;
    root /usr/share/nginx/html;
  }}
}}
"#,
        port = CONSOLE_PLUGIN_PORT
    )
}

fn console_meta(config: &LightspeedConfig, operator: &OperatorConfig) -> ObjectMeta {
    owned_meta(
        config,
        CONSOLE_PLUGIN_NAME,
        Some(&operator.namespace),
        console_plugin_labels(),
    )
}

pub fn build_console_config_map(config: &LightspeedConfig, operator: &OperatorConfig) -> ConfigMap {
    ConfigMap {
        metadata: console_meta(config, operator),
        data: Some(BTreeMap::from([(
            NGINX_CONFIG_FILENAME.to_string(),
            nginx_config(),
        )])),
        ..Default::default()
    }
}

fn console_storage() -> Result<PodStorage> {
    let mut storage = PodStorage::default();
    storage.secret(
        CERT_VOLUME.to_string(),
        CONSOLE_CERT_SECRET_NAME,
        "/var/cert".to_string(),
    )?;
    storage.add(
        Volume {
            name: NGINX_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: CONSOLE_PLUGIN_NAME.to_string(),
                default_mode: Some(VOLUME_DEFAULT_MODE),
                ..Default::default()
            }),
            ..Default::default()
        },
        Some(VolumeMount {
            name: NGINX_CONFIG_VOLUME.to_string(),
            mount_path: "/etc/nginx/nginx.conf".to_string(),
            sub_path: Some(NGINX_CONFIG_FILENAME.to_string()),
            read_only: Some(true),
            ..Default::default()
        }),
    )?;
    storage.empty_dir(NGINX_TEMP_VOLUME, Some("/tmp/nginx".to_string()))?;
    Ok(storage)
}

pub fn build_console_deployment(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
) -> Result<Deployment> {
    let overrides = &config.spec.ols.deployment.console;
    let labels = console_plugin_labels();
    let storage = console_storage()?;

    let container = Container {
        name: CONSOLE_PLUGIN_NAME.to_string(),
        image: Some(operator.images.console_plugin.clone()),
        image_pull_policy: Some("Always".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: CONSOLE_PLUGIN_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        security_context: Some(restricted_security_context()),
        volume_mounts: Some(storage.mounts()),
        resources: Some(resources_or_default(
            overrides.resources.as_ref(),
            "100Mi",
            "10m",
            "50Mi",
        )),
        ..Default::default()
    };

    let mut pod_spec = PodSpec {
        containers: vec![container],
        volumes: Some(storage.volumes()),
        security_context: Some(PodSecurityContext {
            run_as_non_root: Some(true),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    apply_scheduling(&mut pod_spec, overrides);

    Ok(Deployment {
        metadata: console_meta(config, operator),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            revision_history_limit: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the cluster-scoped ConsolePlugin.
///
/// The console proxies `ols` requests to the app server with the user's
/// token; `ca` is the bundle trusted for the app server certificate when
/// it comes from a user TLS secret.
pub fn build_console_plugin(
    config: &LightspeedConfig,
    operator: &OperatorConfig,
    ca: Option<&str>,
) -> ConsolePlugin {
    let spec = ConsolePluginSpec {
        backend: PluginBackend {
            type_: "Service".to_string(),
            service: Some(PluginService {
                name: CONSOLE_PLUGIN_NAME.to_string(),
                namespace: operator.namespace.clone(),
                port: CONSOLE_PLUGIN_PORT,
                base_path: "/".to_string(),
            }),
        },
        display_name: "Lightspeed Console Plugin".to_string(),
        i18n: PluginI18n {
            load_type: "Preload".to_string(),
        },
        proxy: vec![PluginProxy {
            alias: CONSOLE_PROXY_ALIAS.to_string(),
            authorization: "UserToken".to_string(),
            endpoint: ProxyEndpoint {
                type_: "Service".to_string(),
                service: Some(ProxyService {
                    name: APP_SERVER_NAME.to_string(),
                    namespace: operator.namespace.clone(),
                    port: APP_SERVER_PORT,
                }),
            },
            ca_certificate: ca.map(str::to_string),
        }],
    };

    let mut plugin = ConsolePlugin::new(CONSOLE_PLUGIN_NAME, spec);
    plugin.metadata = owned_meta(config, CONSOLE_PLUGIN_NAME, None, console_plugin_labels());
    plugin
}

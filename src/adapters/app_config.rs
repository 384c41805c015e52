//! Application server configuration document
//!
//! Renders `olsconfig.yaml`, the file the app server reads at startup, from
//! the config object and the resolved external dependencies.

use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::exporter_config::data_collection_enabled;
use super::meta::{
    app_server_labels, owned_meta, API_KEY_MOUNT_ROOT, APP_CONFIG_CM_NAME, APP_CONFIG_FILENAME,
    CACHE_SERVER_NAME, CERTS_MOUNT_ROOT, CERT_BUNDLE_DIR, CREDENTIALS_MOUNT_ROOT,
    MCP_HEADERS_MOUNT_ROOT, MCP_SERVER_PORT, PROXY_CA_DIR, PROXY_CA_FILENAME, RAG_MOUNT_PATH, ROOT_CA_CM_NAME,
    ROOT_CA_DIR, SERVING_CERT_SECRET_NAME, USER_CA_DIR, USER_DATA_MOUNT_PATH,
};
use crate::config::{OperatorConfig, PlatformVersion};
use crate::crd::{LightspeedConfig, PostgresCacheSpec, FEATURE_GATE_MCP_SERVER};
use crate::resolver::{
    ExternalKey, ExternalKind, ResolvedDependencies, AZURE_OPENAI_TYPE, CACHE_PASSWORD_KEY,
    KUBERNETES_TOKEN_SENTINEL, MCP_HEADER_KEY,
};
use crate::Result;

const DEFAULT_LOG_LEVEL: &str = "INFO";
const EMBEDDINGS_MODEL_PATH: &str = "/app-root/embeddings_model";
const QUOTA_SCHEDULER_PERIOD: u32 = 300;

const INTROSPECTION_SERVER_NAME: &str = "openshift";
const INTROSPECTION_TIMEOUT: u32 = 60;
const INTROSPECTION_SSE_READ_TIMEOUT: u32 = 30;
const AUTH_HEADER: &str = "Authorization";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfigDocument {
    pub llm_providers: Vec<ProviderConfig>,
    pub ols_config: OlsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_collector_config: Option<UserDataCollectorConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_openai_config: Option<AzureOpenAiConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AzureOpenAiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub credentials_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_size: Option<u32>,
    #[serde(default, skip_serializing_if = "ModelParameters::is_empty")]
    pub parameters: ModelParameters,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_for_response: Option<u32>,
}

impl ModelParameters {
    fn is_empty(&self) -> bool {
        self.max_tokens_for_response.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    pub logging_config: LoggingConfig,
    pub conversation_cache: ConversationCacheConfig,
    pub tls_config: TlsConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_filters: Vec<QueryFilter>,
    pub reference_content: ReferenceContent,
    pub user_data_collection: UserDataCollection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_ca: Vec<String>,
    pub certificate_directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_handlers: Option<QuotaHandlersConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub app_log_level: String,
    pub lib_log_level: String,
    pub uvicorn_log_level: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationCacheConfig {
    #[serde(rename = "type")]
    pub type_: String,
    pub postgres: PostgresConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub dbname: String,
    pub password_path: String,
    pub ssl_mode: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub tls_certificate_path: String,
    pub tls_key_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub name: String,
    pub pattern: String,
    pub replace_with: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceContent {
    pub embeddings_model_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<ReferenceIndex>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceIndex {
    pub product_docs_index_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product_docs_index_id: String,
    pub product_docs_origin: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDataCollection {
    pub feedback_disabled: bool,
    pub feedback_storage: String,
    pub transcripts_disabled: bool,
    pub transcripts_storage: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_ca_cert_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaHandlersConfig {
    pub storage: PostgresConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub limiters: Vec<LimiterConfig>,
    #[serde(default)]
    pub enable_token_history: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub period: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub initial_quota: u64,
    pub quota_increase: u64,
    pub period: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDataCollectorConfig {
    pub data_storage: String,
    pub log_level: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse: Option<McpHttpTransport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streamable_http: Option<McpHttpTransport>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct McpHttpTransport {
    pub url: String,
    pub timeout: u32,
    pub sse_read_timeout: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Postgres section shared by the conversation cache and quota storage
fn postgres_config(postgres: &PostgresCacheSpec, namespace: &str) -> PostgresConfig {
    PostgresConfig {
        host: postgres
            .host
            .clone()
            .unwrap_or_else(|| format!("{}.{}.svc", CACHE_SERVER_NAME, namespace)),
        port: postgres.port,
        user: postgres.user.clone(),
        dbname: postgres.db_name.clone(),
        password_path: format!(
            "{}/{}/{}",
            CREDENTIALS_MOUNT_ROOT, postgres.credentials_secret, CACHE_PASSWORD_KEY
        ),
        ssl_mode: postgres.ssl_mode.clone(),
    }
}

/// Reference indexes: user indexes first, then the platform documentation
/// unless the config asks for its own content only.
fn reference_indexes(config: &LightspeedConfig, version: PlatformVersion) -> Vec<ReferenceIndex> {
    let ols = &config.spec.ols;
    let mut indexes: Vec<ReferenceIndex> = ols
        .rag
        .iter()
        .enumerate()
        .map(|(i, rag)| ReferenceIndex {
            product_docs_index_path: format!("{}/rag-{}", RAG_MOUNT_PATH, i),
            product_docs_index_id: rag.index_id.clone(),
            product_docs_origin: rag.image.clone(),
        })
        .collect();

    if !ols.byok_rag_only {
        indexes.push(ReferenceIndex {
            product_docs_index_path: format!("/app-root/vector_db/ocp_product_docs/{}", version),
            product_docs_index_id: format!("ocp-product-docs-{}_{}", version.major, version.minor),
            product_docs_origin: format!("Red Hat OpenShift {} documentation", version),
        });
    }
    indexes
}

fn extra_ca_paths(
    config: &LightspeedConfig,
    resolved: &ResolvedDependencies,
    namespace: &str,
) -> Vec<String> {
    let mut paths = Vec::new();
    let root = ExternalKey::new(ExternalKind::ConfigMap, namespace, ROOT_CA_CM_NAME);
    if let Some(obj) = resolved.get(&root) {
        paths.extend(
            obj.keys
                .iter()
                .map(|k| format!("{}/{}/{}", CERTS_MOUNT_ROOT, ROOT_CA_DIR, k)),
        );
    }

    if let Some(ca) = &config.spec.ols.additional_ca_config_map_ref {
        let key = ExternalKey::new(ExternalKind::ConfigMap, namespace, &ca.name);
        if let Some(obj) = resolved.get(&key) {
            paths.extend(
                obj.keys
                    .iter()
                    .map(|k| format!("{}/{}/{}", CERTS_MOUNT_ROOT, USER_CA_DIR, k)),
            );
        }
    }
    paths
}

fn proxy_config(config: &LightspeedConfig) -> Option<ProxyConfig> {
    let proxy = config.spec.ols.proxy_config.as_ref()?;
    let proxy_url = proxy.proxy_url.clone().filter(|u| !u.is_empty());
    let proxy_ca_cert_path = proxy
        .proxy_ca_certificate_ref
        .as_ref()
        .filter(|r| !r.name.is_empty())
        .map(|_| {
            format!(
                "{}/{}/{}",
                CERTS_MOUNT_ROOT, PROXY_CA_DIR, PROXY_CA_FILENAME
            )
        });

    if proxy_url.is_none() && proxy_ca_cert_path.is_none() {
        return None;
    }
    Some(ProxyConfig {
        proxy_url,
        proxy_ca_cert_path,
    })
}

fn quota_handlers(config: &LightspeedConfig, namespace: &str) -> Option<QuotaHandlersConfig> {
    let quota = config.spec.ols.quota_handlers_config.as_ref()?;
    if quota.limiters_config.is_empty() && !quota.enable_token_history {
        return None;
    }

    Some(QuotaHandlersConfig {
        storage: postgres_config(&config.spec.ols.conversation_cache.postgres, namespace),
        scheduler: SchedulerConfig {
            period: QUOTA_SCHEDULER_PERIOD,
        },
        limiters: quota
            .limiters_config
            .iter()
            .map(|l| LimiterConfig {
                name: l.name.clone(),
                type_: l.type_.clone(),
                initial_quota: l.initial_quota,
                quota_increase: l.quota_increase,
                period: l.period.clone(),
            })
            .collect(),
        enable_token_history: quota.enable_token_history,
    })
}

fn mcp_servers(config: &LightspeedConfig) -> Vec<McpServerConfig> {
    let spec = &config.spec;
    let mut servers = Vec::new();

    if spec.ols.introspection_enabled {
        servers.push(McpServerConfig {
            name: INTROSPECTION_SERVER_NAME.to_string(),
            transport: "streamable_http".to_string(),
            sse: None,
            streamable_http: Some(McpHttpTransport {
                url: format!("http://localhost:{}/mcp", MCP_SERVER_PORT),
                timeout: INTROSPECTION_TIMEOUT,
                sse_read_timeout: INTROSPECTION_SSE_READ_TIMEOUT,
                headers: BTreeMap::from([(
                    AUTH_HEADER.to_string(),
                    KUBERNETES_TOKEN_SENTINEL.to_string(),
                )]),
            }),
        });
    }

    if !spec.feature_enabled(FEATURE_GATE_MCP_SERVER) {
        return servers;
    }

    for server in &spec.mcp_servers {
        let Some(http) = &server.streamable_http else {
            continue;
        };
        let headers = http
            .headers
            .iter()
            .map(|(name, value)| {
                let value = if value == KUBERNETES_TOKEN_SENTINEL {
                    value.clone()
                } else {
                    format!("{}/{}/{}", MCP_HEADERS_MOUNT_ROOT, value, MCP_HEADER_KEY)
                };
                (name.clone(), value)
            })
            .collect();
        let transport = McpHttpTransport {
            url: http.url.clone(),
            timeout: http.timeout,
            sse_read_timeout: http.sse_read_timeout,
            headers,
        };

        servers.push(if http.enable_sse {
            McpServerConfig {
                name: server.name.clone(),
                transport: "sse".to_string(),
                sse: Some(transport),
                streamable_http: None,
            }
        } else {
            McpServerConfig {
                name: server.name.clone(),
                transport: "streamable_http".to_string(),
                sse: None,
                streamable_http: Some(transport),
            }
        });
    }
    servers
}

/// Build the app server configuration document
pub fn build_app_config(
    config: &LightspeedConfig,
    resolved: &ResolvedDependencies,
    operator: &OperatorConfig,
) -> AppConfigDocument {
    let spec = &config.spec;
    let ols = &spec.ols;
    let namespace = operator.namespace.as_str();

    let llm_providers = spec
        .llm
        .providers
        .iter()
        .map(|provider| {
            let credentials_path = format!(
                "{}/{}",
                API_KEY_MOUNT_ROOT, provider.credentials_secret_ref.name
            );
            let models = provider
                .models
                .iter()
                .map(|m| ModelConfig {
                    name: m.name.clone(),
                    url: m.url.clone(),
                    context_window_size: m.context_window_size,
                    parameters: ModelParameters {
                        max_tokens_for_response: m.parameters.max_tokens_for_response,
                    },
                })
                .collect();

            if provider.type_ == AZURE_OPENAI_TYPE {
                ProviderConfig {
                    name: provider.name.clone(),
                    type_: provider.type_.clone(),
                    models,
                    api_version: provider.api_version.clone(),
                    azure_openai_config: Some(AzureOpenAiConfig {
                        url: provider.url.clone(),
                        credentials_path,
                        deployment_name: provider.deployment_name.clone(),
                    }),
                    ..Default::default()
                }
            } else {
                ProviderConfig {
                    name: provider.name.clone(),
                    type_: provider.type_.clone(),
                    url: provider.url.clone(),
                    credentials_path: Some(credentials_path),
                    models,
                    project_id: provider.project_id.clone(),
                    ..Default::default()
                }
            }
        })
        .collect();

    let log_level = ols
        .log_level
        .clone()
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    let collection = data_collection_enabled(config, resolved.telemetry_enabled);
    let tls_dir = format!("{}/{}", CERTS_MOUNT_ROOT, SERVING_CERT_SECRET_NAME);

    let ols_config = OlsConfig {
        default_model: ols.default_model.clone(),
        default_provider: ols.default_provider.clone(),
        logging_config: LoggingConfig {
            app_log_level: log_level.clone(),
            lib_log_level: log_level.clone(),
            uvicorn_log_level: log_level,
        },
        conversation_cache: ConversationCacheConfig {
            type_: "postgres".to_string(),
            postgres: postgres_config(&ols.conversation_cache.postgres, namespace),
        },
        tls_config: TlsConfig {
            tls_certificate_path: format!("{}/tls.crt", tls_dir),
            tls_key_path: format!("{}/tls.key", tls_dir),
        },
        query_filters: ols
            .query_filters
            .iter()
            .map(|f| QueryFilter {
                name: f.name.clone(),
                pattern: f.pattern.clone(),
                replace_with: f.replace_with.clone(),
            })
            .collect(),
        reference_content: ReferenceContent {
            embeddings_model_path: EMBEDDINGS_MODEL_PATH.to_string(),
            indexes: reference_indexes(config, operator.platform_version),
        },
        user_data_collection: UserDataCollection {
            feedback_disabled: ols.user_data_collection.feedback_disabled || !collection,
            feedback_storage: format!("{}/feedback", USER_DATA_MOUNT_PATH),
            transcripts_disabled: ols.user_data_collection.transcripts_disabled || !collection,
            transcripts_storage: format!("{}/transcripts", USER_DATA_MOUNT_PATH),
        },
        extra_ca: extra_ca_paths(config, resolved, namespace),
        certificate_directory: format!("{}/{}", CERTS_MOUNT_ROOT, CERT_BUNDLE_DIR),
        proxy_config: proxy_config(config),
        quota_handlers: quota_handlers(config, namespace),
    };

    let user_data_collector_config = collection.then(|| UserDataCollectorConfig {
        data_storage: USER_DATA_MOUNT_PATH.to_string(),
        log_level: spec
            .ols_data_collector
            .log_level
            .clone()
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
    });

    AppConfigDocument {
        llm_providers,
        ols_config,
        user_data_collector_config,
        mcp_servers: mcp_servers(config),
    }
}

/// Build the ConfigMap carrying `olsconfig.yaml`
pub fn build_app_config_map(
    config: &LightspeedConfig,
    resolved: &ResolvedDependencies,
    operator: &OperatorConfig,
) -> Result<ConfigMap> {
    let document = build_app_config(config, resolved, operator);
    let rendered = serde_yaml::to_string(&document)?;

    Ok(ConfigMap {
        metadata: owned_meta(
            config,
            APP_CONFIG_CM_NAME,
            Some(&operator.namespace),
            app_server_labels(),
        ),
        data: Some(BTreeMap::from([(
            APP_CONFIG_FILENAME.to_string(),
            rendered,
        )])),
        ..Default::default()
    })
}

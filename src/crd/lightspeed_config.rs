//! LightspeedConfig Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The only LightspeedConfig name the operator acts on
pub const SINGLETON_NAME: &str = "cluster";

/// Feature gate enabling user supplied tool servers
pub const FEATURE_GATE_MCP_SERVER: &str = "MCPServer";

/// LightspeedConfig resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lightspeed.io",
    version = "v1alpha1",
    kind = "LightspeedConfig",
    plural = "lightspeedconfigs",
    singular = "lightspeedconfig",
    shortname = "lsc",
    status = "LightspeedConfigStatus",
    printcolumn = r#"{"name": "Reconciled", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Reconciled\")].status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LightspeedConfigSpec {
    /// Language model providers
    pub llm: LlmSpec,

    /// Application server settings
    #[serde(default)]
    pub ols: OlsSpec,

    /// Data collector sidecar settings
    #[serde(default)]
    pub ols_data_collector: DataCollectorSpec,

    /// User supplied tool servers, honoured when the MCPServer gate is on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerSpec>,

    /// Enabled feature gates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<String>,
}

impl LightspeedConfigSpec {
    pub fn feature_enabled(&self, gate: &str) -> bool {
        self.feature_gates.iter().any(|g| g == gate)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LlmSpec {
    pub providers: Vec<ProviderSpec>,
}

/// Reference to an object in the operator namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct LocalRef {
    pub name: String,
}

/// Language model provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Provider name referenced by defaultProvider
    pub name: String,

    /// Provider type (openai, azure_openai, watsonx, bam, rhoai_vllm, rhelai_vllm, fake_provider)
    #[serde(rename = "type")]
    pub type_: String,

    /// Provider API URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Secret holding the provider credentials
    pub credentials_secret_ref: LocalRef,

    /// Models served by this provider
    #[serde(default)]
    pub models: Vec<ModelSpec>,

    /// Watsonx project ID
    #[serde(rename = "projectID", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Azure OpenAI deployment name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,

    /// Azure OpenAI API version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_size: Option<u32>,

    #[serde(default)]
    pub parameters: ModelParametersSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelParametersSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_for_response: Option<u32>,
}

/// Application server settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OlsSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,

    /// Application log level (defaults to INFO)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Conversation cache backend
    #[serde(default)]
    pub conversation_cache: ConversationCacheSpec,

    /// Workload overrides
    #[serde(default)]
    pub deployment: WorkloadSpec,

    /// User provided serving certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfigSpec>,

    /// ConfigMap with additional trusted CA certificates
    #[serde(
        rename = "additionalCAConfigMapRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_ca_config_map_ref: Option<LocalRef>,

    /// Outbound proxy settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<ProxyConfigSpec>,

    /// Regex filters applied to user queries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_filters: Vec<QueryFilterSpec>,

    #[serde(default)]
    pub user_data_collection: UserDataCollectionSpec,

    /// Run the cluster introspection tool server sidecar
    #[serde(default)]
    pub introspection_enabled: bool,

    /// Bring-your-own-knowledge indexes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rag: Vec<RagSpec>,

    /// Skip the platform documentation index
    #[serde(default, rename = "byokRAGOnly")]
    pub byok_rag_only: bool,

    /// Token quota limiters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_handlers_config: Option<QuotaHandlersSpec>,

    /// Persistent storage for the conversation cache; an emptyDir is used
    /// when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Requested volume size (defaults to 1Gi)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Storage class; the cluster default class when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCacheSpec {
    #[serde(default)]
    pub postgres: PostgresCacheSpec,
}

/// Postgres cache backend connection
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresCacheSpec {
    #[serde(default = "default_postgres_user")]
    pub user: String,

    #[serde(default = "default_postgres_db")]
    pub db_name: String,

    /// Secret holding the database password under key `password`
    #[serde(default = "default_postgres_secret")]
    pub credentials_secret: String,

    /// Database host; defaults to the in-namespace postgres service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default = "default_postgres_port")]
    pub port: u16,

    #[serde(default = "default_postgres_ssl_mode")]
    pub ssl_mode: String,

    #[serde(default = "default_postgres_shared_buffers")]
    pub shared_buffers: String,

    #[serde(default = "default_postgres_max_connections")]
    pub max_connections: u32,
}

impl Default for PostgresCacheSpec {
    fn default() -> Self {
        Self {
            user: default_postgres_user(),
            db_name: default_postgres_db(),
            credentials_secret: default_postgres_secret(),
            host: None,
            port: default_postgres_port(),
            ssl_mode: default_postgres_ssl_mode(),
            shared_buffers: default_postgres_shared_buffers(),
            max_connections: default_postgres_max_connections(),
        }
    }
}

fn default_postgres_user() -> String {
    "postgres".to_string()
}

fn default_postgres_db() -> String {
    "postgres".to_string()
}

fn default_postgres_secret() -> String {
    "lightspeed-postgres-secret".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_ssl_mode() -> String {
    "require".to_string()
}

fn default_postgres_shared_buffers() -> String {
    "256MB".to_string()
}

fn default_postgres_max_connections() -> u32 {
    2000
}

/// Workload overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Application server replicas (defaults to 1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub api: ContainerOverrides,

    #[serde(default)]
    pub data_collector: ContainerOverrides,

    #[serde(default)]
    pub mcp_server: ContainerOverrides,

    /// Conversation cache pod
    #[serde(default)]
    pub database: ContainerOverrides,

    /// Console plugin pod
    #[serde(default)]
    pub console: ContainerOverrides,
}

/// Per-container scheduling and resource overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirementsSpec>,

    /// Applies to the whole pod; ignored for app server sidecars
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<TolerationSpec>,

    /// Applies to the whole pod; ignored for app server sidecars
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Toleration specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TolerationSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Toleration operator (Exists, Equal)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Toleration effect (NoSchedule, PreferNoSchedule, NoExecute)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// Resource requirements specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    /// Resource limits (cpu, memory)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,

    /// Resource requests (cpu, memory)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfigSpec {
    /// Secret with `tls.crt` and `tls.key`
    pub key_cert_secret_ref: LocalRef,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ProxyConfigSpec {
    #[serde(rename = "proxyURL", skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,

    /// ConfigMap holding `proxy-ca.crt`
    #[serde(
        rename = "proxyCACertificateRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub proxy_ca_certificate_ref: Option<LocalRef>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilterSpec {
    pub name: String,
    pub pattern: String,
    pub replace_with: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserDataCollectionSpec {
    #[serde(default)]
    pub feedback_disabled: bool,

    #[serde(default)]
    pub transcripts_disabled: bool,
}

/// Index image copied into the shared retrieval volume
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RagSpec {
    pub image: String,

    /// Directory inside the image holding the index
    #[serde(default = "default_rag_index_path")]
    pub index_path: String,

    #[serde(default, rename = "indexID")]
    pub index_id: String,
}

fn default_rag_index_path() -> String {
    "/rag/vector_db".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaHandlersSpec {
    #[serde(default)]
    pub limiters_config: Vec<LimiterSpec>,

    #[serde(default)]
    pub enable_token_history: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LimiterSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub type_: String,

    pub initial_quota: u64,

    #[serde(default)]
    pub quota_increase: u64,

    /// Period the quota applies to, e.g. `1d`
    pub period: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataCollectorSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// User supplied tool server
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct McpServerSpec {
    pub name: String,

    #[serde(rename = "streamableHTTP", skip_serializing_if = "Option::is_none")]
    pub streamable_http: Option<McpStreamableHttpSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct McpStreamableHttpSpec {
    pub url: String,

    #[serde(default = "default_mcp_timeout")]
    pub timeout: u32,

    #[serde(default = "default_mcp_sse_read_timeout")]
    pub sse_read_timeout: u32,

    /// Header name to secret name, or `kubernetes` for the pod identity token
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, rename = "enableSSE")]
    pub enable_sse: bool,
}

fn default_mcp_timeout() -> u32 {
    5
}

fn default_mcp_sse_read_timeout() -> u32 {
    10
}

/// LightspeedConfig status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LightspeedConfigStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (ApiReady, CacheReady, ConsolePluginReady, Reconciled)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Machine readable reason
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

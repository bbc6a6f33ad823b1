use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub schema: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub dashboard: DashboardConfig,

    #[serde(default)]
    pub debug: bool,

    /// Middlewares applied to every route, outermost, before any
    /// route-level middleware.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub middlewares: Vec<ComponentConfig>,

    /// Plugins applied to every route, ahead of route-level plugins.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub plugins: Vec<ComponentConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Per-request deadline in seconds. 0 disables the deadline.
    #[serde(default)]
    pub timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            timeout: 0,
        }
    }
}

fn default_server_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "default_dashboard_port")]
    pub port: u16,

    #[serde(default)]
    pub timeout: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enable: false,
            port: default_dashboard_port(),
            timeout: 0,
        }
    }
}

fn default_dashboard_port() -> u16 {
    9091
}

/// A named plugin or middleware instance with its free-form config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,

    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: String,

    pub method: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub plugins: Vec<ComponentConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub middlewares: Vec<ComponentConfig>,

    pub upstreams: Vec<UpstreamConfig>,

    /// "merge", "array", or "" (use the first upstream's response).
    #[serde(default)]
    pub aggregate: String,

    #[serde(default)]
    pub allow_partial_results: bool,

    /// Reserved for a future response-body transform stage.
    #[serde(default)]
    pub transform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub name: String,

    pub url: String,

    /// Override for the forwarded method. Empty means "use the inbound method".
    #[serde(default)]
    pub method: String,

    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout: u64,

    /// Static header overrides. Only applied to names that are also forwarded.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub headers: HashMap<String, String>,

    /// Exact names, `"*"` (all), or `"prefix*"` globs.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub forward_headers: Vec<String>,

    /// Exact keys or `"*"` (all). Prefix globs are treated as exact keys.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub forward_query_strings: Vec<String>,

    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_upstream_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// When non-empty, only these statuses count as policy-success.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allowed_statuses: Vec<u16>,

    /// An empty upstream body is a policy violation.
    #[serde(default)]
    pub require_body: Option<bool>,

    /// Legacy spelling with inverted meaning. `require_body` wins when both
    /// are present.
    #[serde(default)]
    pub allow_empty_body: Option<bool>,

    /// Applied to the observed status before the allowed-status check.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub map_status_codes: HashMap<u16, u16>,

    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl PolicyConfig {
    /// Resolve the `require_body` / legacy `allow_empty_body` pair.
    pub fn requires_body(&self) -> bool {
        match (self.require_body, self.allow_empty_body) {
            (Some(require), _) => require,
            (None, Some(allow)) => !allow,
            (None, None) => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub retry_on_statuses: Vec<u16>,

    #[serde(default)]
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_breaker_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_breaker_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_breaker_max_failures(),
            reset_timeout_ms: default_breaker_reset_timeout_ms(),
        }
    }
}

fn default_breaker_max_failures() -> u32 {
    5
}

fn default_breaker_reset_timeout_ms() -> u64 {
    30_000
}

pub const AGGREGATE_MERGE: &str = "merge";
pub const AGGREGATE_ARRAY: &str = "array";

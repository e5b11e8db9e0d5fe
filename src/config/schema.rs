//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway name, used in logs and inspection output.
    pub name: String,

    /// Free-form configuration version.
    pub version: String,

    /// Listener configuration (bind address, body limits).
    pub listener: ListenerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Reload polling settings.
    pub reload: ReloadConfig,

    /// Route definitions mapping requests to services.
    pub routes: Vec<RouteConfig>,

    /// Backend service definitions.
    pub services: Vec<ServiceConfig>,
}

impl GatewayConfig {
    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum request body size accepted from clients.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:6060".to_string(),
        }
    }
}

/// Hot reload configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReloadConfig {
    /// How often the config source is polled for a new digest.
    pub poll_interval_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

/// Route configuration: one forwarding policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouteConfig {
    /// Optional route identifier for logging/metrics.
    #[serde(default)]
    pub name: Option<String>,

    /// Host to match. `None`, empty or `*` match any host; `*.example.com`
    /// matches any subdomain.
    #[serde(default)]
    pub match_host: Option<String>,

    /// Path to match. A trailing `*` makes it a prefix match.
    pub match_path: String,

    /// Service that receives matched requests.
    pub target_service: String,

    /// Per-request deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Ordered middleware list; the first entry runs first on the way in.
    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfig>,
}

impl RouteConfig {
    /// Stable identity of the route across reloads.
    ///
    /// Named routes use their name; anonymous ones are keyed by what they match.
    pub fn key(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!(
                "{}{}->{}",
                self.match_host.as_deref().unwrap_or("*"),
                self.match_path,
                self.target_service
            ),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// A middleware entry in a route's chain.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MiddlewareConfig {
    /// Registered middleware name (e.g. "bbr", "circuitbreaker").
    pub name: String,

    /// Middleware specific parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl MiddlewareConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Backend service definition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServiceConfig {
    /// Unique service name referenced by routes.
    pub name: String,

    /// Discovery DSN, e.g. `dns:///orders.internal:8080?interval_ms=5000`.
    #[serde(default)]
    pub discovery_dsn: Option<String>,

    /// Static endpoint list, used when no DSN is given.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Load balancing policy across endpoints.
    #[serde(default)]
    pub load_balance: LoadBalancePolicy,

    /// Maximum concurrent requests per endpoint.
    #[serde(default = "default_max_endpoint_conns")]
    pub max_connections_per_endpoint: usize,
}

impl ServiceConfig {
    /// A service backed by a fixed list of addresses.
    pub fn with_endpoints<I, S>(name: impl Into<String>, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            discovery_dsn: None,
            endpoints: addresses
                .into_iter()
                .map(|a| EndpointConfig::Address(a.into()))
                .collect(),
            load_balance: LoadBalancePolicy::default(),
            max_connections_per_endpoint: default_max_endpoint_conns(),
        }
    }

    /// A service resolved through a discovery DSN.
    pub fn with_discovery(name: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            discovery_dsn: Some(dsn.into()),
            endpoints: Vec::new(),
            load_balance: LoadBalancePolicy::default(),
            max_connections_per_endpoint: default_max_endpoint_conns(),
        }
    }
}

fn default_max_endpoint_conns() -> usize {
    1024
}

/// Static endpoint: either a bare address or an address with a weight.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EndpointConfig {
    Address(String),
    Weighted { address: String, weight: u32 },
}

impl EndpointConfig {
    pub fn address(&self) -> &str {
        match self {
            EndpointConfig::Address(address) => address,
            EndpointConfig::Weighted { address, .. } => address,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            EndpointConfig::Address(_) => 1,
            EndpointConfig::Weighted { weight, .. } => *weight,
        }
    }
}

/// Endpoint selection policy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    #[default]
    RoundRobin,
    LeastConn,
    Weighted,
}

//! Service discovery subsystem.
//!
//! # Data Flow
//! ```text
//! ServiceConfig.discovery_dsn ("scheme://host:port/target?opts")
//!     → DiscoveryRegistry (scheme → resolver builder)
//!     → Resolver::resolve   (initial endpoint set)
//!     → Resolver::subscribe (watch channel of later sets)
//!     → load_balancer::pool applies each set to the client pool
//! ```
//!
//! # Design Decisions
//! - Resolvers are pluggable by DSN scheme; the registry is a value built at
//!   startup, not a process global
//! - Updates are pushed as whole endpoint sets; the pool diffs them
//! - Resolution failures never abort a reload; they surface per request as 503

pub mod dns;
pub mod static_list;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use url::Url;

pub use dns::DnsResolver;
pub use static_list::StaticResolver;

/// A network endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// `host:port`
    pub address: String,
    pub weight: u32,
    pub healthy: bool,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            weight: 1,
            healthy: true,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Errors from DSN handling and name resolution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid discovery DSN `{dsn}`: {reason}")]
    InvalidDsn { dsn: String, reason: String },

    #[error("no resolver registered for scheme `{0}`")]
    UnknownScheme(String),

    #[error("failed to resolve `{target}`: {reason}")]
    Resolve { target: String, reason: String },
}

/// Maps a logical service name to its live endpoint set.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Current endpoint set for `target`.
    async fn resolve(&self, target: &str) -> Result<Vec<Endpoint>, DiscoveryError>;

    /// Endpoint sets pushed whenever the membership of `target` changes.
    fn subscribe(&self, target: &str) -> Result<watch::Receiver<Vec<Endpoint>>, DiscoveryError>;
}

/// Builds a resolver from a parsed DSN.
pub type ResolverBuilder =
    Arc<dyn Fn(&Url) -> Result<Arc<dyn Resolver>, DiscoveryError> + Send + Sync>;

/// Scheme → resolver builder table, populated at startup.
#[derive(Clone, Default)]
pub struct DiscoveryRegistry {
    builders: HashMap<String, ResolverBuilder>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `static` and `dns` schemes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("static", |dsn: &Url| {
            Ok(Arc::new(StaticResolver::from_dsn(dsn)?) as Arc<dyn Resolver>)
        });
        registry.register("dns", |dsn: &Url| {
            Ok(Arc::new(DnsResolver::from_dsn(dsn)?) as Arc<dyn Resolver>)
        });
        registry
    }

    /// Register (or replace) the builder for `scheme`.
    pub fn register<F>(&mut self, scheme: &str, builder: F)
    where
        F: Fn(&Url) -> Result<Arc<dyn Resolver>, DiscoveryError> + Send + Sync + 'static,
    {
        if self
            .builders
            .insert(scheme.to_string(), Arc::new(builder))
            .is_some()
        {
            tracing::warn!(scheme = %scheme, "Discovery scheme registered twice, keeping the latest");
        }
    }

    /// Build the resolver a DSN asks for.
    pub fn create(&self, dsn: &str) -> Result<Arc<dyn Resolver>, DiscoveryError> {
        let url = Url::parse(dsn).map_err(|e| DiscoveryError::InvalidDsn {
            dsn: dsn.to_string(),
            reason: e.to_string(),
        })?;
        let builder = self
            .builders
            .get(url.scheme())
            .ok_or_else(|| DiscoveryError::UnknownScheme(url.scheme().to_string()))?;
        builder(&url)
    }

    pub fn schemes(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }
}

/// The name a DSN asks to resolve: its path when present, else the service name.
pub fn resolution_target(dsn: &str, service: &str) -> String {
    Url::parse(dsn)
        .ok()
        .map(|url| url.path().trim_matches('/').to_string())
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| service.to_string())
}

/// Read a millisecond duration query parameter.
pub(crate) fn query_millis(dsn: &Url, key: &str) -> Result<Option<u64>, DiscoveryError> {
    dsn.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| {
            v.parse::<u64>().map_err(|e| DiscoveryError::InvalidDsn {
                dsn: dsn.to_string(),
                reason: format!("`{}`: {}", key, e),
            })
        })
        .transpose()
}

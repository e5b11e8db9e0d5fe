//! Middleware subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     MiddlewareRegistry::with_builtins() (+ embedder registrations)
//!     → shared read-only with the snapshot compiler
//!
//! Per route, per snapshot:
//!     RouteConfig.middlewares [{name, params}, ...]
//!     → registry lookup (unknown name = BuildError)
//!     → factory(BuildContext) → Middleware
//!     → chain.rs folds them around the backend transport
//!
//! Per request:
//!     Chain → m1 → m2 → ... → BackendTransport
//! ```
//!
//! # Design Decisions
//! - Names are resolved once at compile time, never per request
//! - The registry is a value passed by `Arc`, not a process global
//! - State that must outlive a reload (breakers, limiters) comes from the
//!   state arena through `BuildContext::route_state`

pub mod chain;
pub mod logging;
pub mod rewrite;
pub mod trace;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::MiddlewareConfig;
use crate::proxy::error::{BuildError, ProxyError};
use crate::proxy::state::StateArena;
use crate::resilience::{bbr, circuit_breaker};
use crate::security::auth;

pub use chain::{Chain, ChainBuilder};

/// One hop of request forwarding.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError>;
}

/// Shared handle to a hop.
pub type Transport = Arc<dyn RoundTrip>;

/// A decorator around the next hop.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Transport) -> Transport;
}

/// Turns a middleware's configuration into a decorator.
pub type Factory =
    Arc<dyn Fn(&BuildContext<'_>) -> Result<Arc<dyn Middleware>, BuildError> + Send + Sync>;

/// Everything a factory may look at while building one middleware.
pub struct BuildContext<'a> {
    route: &'a str,
    service: &'a str,
    config: &'a MiddlewareConfig,
    arena: &'a StateArena,
    touched: &'a Mutex<HashSet<String>>,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        route: &'a str,
        service: &'a str,
        config: &'a MiddlewareConfig,
        arena: &'a StateArena,
        touched: &'a Mutex<HashSet<String>>,
    ) -> Self {
        Self {
            route,
            service,
            config,
            arena,
            touched,
        }
    }

    pub fn route(&self) -> &str {
        self.route
    }

    pub fn service(&self) -> &str {
        self.service
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Deserialize the params map into `T`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, BuildError> {
        serde_json::from_value(Value::Object(self.config.params.clone())).map_err(|e| {
            BuildError::InvalidParams {
                route: self.route.to_string(),
                middleware: self.config.name.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// State owned by this route's middleware, reused by later snapshots that
    /// declare the same middleware with the same params.
    pub fn route_state<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.state_at(self.route, init)
    }

    /// State shared by every route declaring this middleware with the same params.
    pub fn global_state<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.state_at("*", init)
    }

    fn state_at<T, F>(&self, owner: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let params = serde_json::to_string(&self.config.params).unwrap_or_default();
        let key = format!("{}|{}|{}", owner, self.config.name, params);
        self.touched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone());
        self.arena.get_or_insert(&key, init)
    }
}

/// Name → factory table. Populated at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct MiddlewareRegistry {
    factories: HashMap<String, Factory>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in middleware kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(bbr::NAME, bbr::factory);
        registry.register(circuit_breaker::NAME, circuit_breaker::factory);
        registry.register(auth::NAME, auth::factory);
        registry.register(logging::NAME, logging::factory);
        registry.register(rewrite::NAME, rewrite::factory);
        registry.register(trace::NAME, trace::factory);
        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&BuildContext<'_>) -> Result<Arc<dyn Middleware>, BuildError> + Send + Sync + 'static,
    {
        if self
            .factories
            .insert(name.to_string(), Arc::new(factory))
            .is_some()
        {
            tracing::warn!(middleware = %name, "Middleware registered twice, keeping the latest");
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Factory> {
        self.factories.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Adapter for middlewares that are a closure over the next hop.
pub struct WrapFn<F>(pub F);

impl<F> Middleware for WrapFn<F>
where
    F: Fn(Transport) -> Transport + Send + Sync,
{
    fn wrap(&self, next: Transport) -> Transport {
        (self.0)(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = MiddlewareRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["auth", "bbr", "circuitbreaker", "logging", "rewrite", "tracing"]
        );
        assert!(registry.lookup("bbr").is_some());
        assert!(registry.lookup("jwt").is_none());
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Params {
        limit: u32,
    }

    #[test]
    fn test_context_params_and_state() {
        let arena = StateArena::default();
        let touched = Mutex::new(HashSet::new());
        let good = MiddlewareConfig::new("limit").with_param("limit", 5);
        let ctx = BuildContext::new("r1", "svc", &good, &arena, &touched);

        assert_eq!(ctx.params::<Params>().unwrap().limit, 5);
        let a = ctx.route_state(|| 1u64);
        let b = ctx.route_state(|| 2u64);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(touched.lock().unwrap().len(), 1);

        let bad = MiddlewareConfig::new("limit").with_param("limt", 5);
        let ctx = BuildContext::new("r1", "svc", &bad, &arena, &touched);
        assert!(matches!(
            ctx.params::<Params>(),
            Err(BuildError::InvalidParams { middleware, .. }) if middleware == "limit"
        ));
    }
}

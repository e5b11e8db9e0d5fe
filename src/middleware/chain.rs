//! Chain compilation.
//!
//! A chain is the route's middlewares folded around a terminal transport.
//! The first declared middleware is outermost: it sees the request first
//! and the response last.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, Response};

use crate::config::RouteConfig;
use crate::middleware::{BuildContext, Middleware, MiddlewareRegistry, Transport};
use crate::proxy::error::{BuildError, ProxyError};
use crate::proxy::state::StateArena;

/// Executable, immutable request pipeline of one route.
pub struct Chain {
    route: String,
    middlewares: Vec<String>,
    entry: Transport,
}

impl Chain {
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Middleware names in execution order.
    pub fn middlewares(&self) -> &[String] {
        &self.middlewares
    }

    pub async fn handle(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        self.entry.round_trip(request).await
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("route", &self.route)
            .field("middlewares", &self.middlewares)
            .finish()
    }
}

/// Compiles route chains against one registry and state arena.
pub struct ChainBuilder<'a> {
    registry: &'a MiddlewareRegistry,
    arena: &'a StateArena,
    touched: Mutex<HashSet<String>>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(registry: &'a MiddlewareRegistry, arena: &'a StateArena) -> Self {
        Self {
            registry,
            arena,
            touched: Mutex::new(HashSet::new()),
        }
    }

    /// Build every middleware of `route` in declared order, failing on the
    /// first unknown name or bad params, then wrap them around `terminal`.
    pub fn compile(&self, route: &RouteConfig, terminal: Transport) -> Result<Chain, BuildError> {
        let key = route.key();
        let mut built: Vec<Arc<dyn Middleware>> = Vec::with_capacity(route.middlewares.len());

        for config in &route.middlewares {
            let factory =
                self.registry
                    .lookup(&config.name)
                    .ok_or_else(|| BuildError::UnknownMiddleware {
                        route: key.clone(),
                        name: config.name.clone(),
                    })?;
            let ctx = BuildContext::new(
                &key,
                &route.target_service,
                config,
                self.arena,
                &self.touched,
            );
            built.push(factory(&ctx)?);
        }

        let entry = built
            .iter()
            .rev()
            .fold(terminal, |next, middleware| middleware.wrap(next));

        Ok(Chain {
            route: key,
            middlewares: route.middlewares.iter().map(|m| m.name.clone()).collect(),
            entry,
        })
    }

    /// Arena keys used by the chains compiled so far.
    pub fn into_state_keys(self) -> HashSet<String> {
        self.touched
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

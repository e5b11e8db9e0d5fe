//! The data plane: holds the live snapshot and serves requests through it.
//!
//! # Concurrency
//! - Requests load the current snapshot once and keep it for their lifetime
//! - Updates compile off to the side and publish with a single atomic swap
//! - Updates are serialized; a failed build leaves the live snapshot untouched

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::watcher::{BoxError, ConfigHandler};
use crate::config::GatewayConfig;
use crate::discovery::DiscoveryRegistry;
use crate::http::request::RequestIdExt;
use crate::load_balancer::ClientFactory;
use crate::middleware::MiddlewareRegistry;
use crate::observability::metrics;
use crate::proxy::error::{BuildError, ProxyError};
use crate::proxy::snapshot::{CompiledRoute, Snapshot, SnapshotCompiler};
use crate::proxy::state::StateArena;
use crate::resilience::bbr::{BbrLimiter, BbrStats};
use crate::resilience::circuit_breaker::{CircuitState, RouteBreakers};
use crate::resilience::timeouts::Deadline;

pub struct ProxyEngine {
    current: ArcSwap<Snapshot>,
    compiler: SnapshotCompiler,
    reload_lock: Mutex<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    pub key: String,
    pub service: String,
    pub middlewares: Vec<String>,
    pub endpoints: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub route: String,
    pub target: String,
    pub state: CircuitState,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub label: String,
    #[serde(flatten)]
    pub stats: BbrStats,
}

/// Read-only view of the engine for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub name: String,
    pub version: String,
    pub digest: String,
    pub routes: Vec<RouteStatus>,
    pub circuits: Vec<CircuitStatus>,
    pub limiters: Vec<LimiterStatus>,
}

impl ProxyEngine {
    pub fn new(registry: MiddlewareRegistry, discovery: DiscoveryRegistry) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::empty()),
            compiler: SnapshotCompiler::new(
                Arc::new(registry),
                Arc::new(ClientFactory::new(discovery)),
                Arc::new(StateArena::new()),
            ),
            reload_lock: Mutex::new(()),
        }
    }

    /// Engine with every built-in middleware and resolver.
    pub fn with_builtins() -> Self {
        Self::new(
            MiddlewareRegistry::with_builtins(),
            DiscoveryRegistry::with_builtins(),
        )
    }

    /// The snapshot currently serving traffic.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn clients(&self) -> &ClientFactory {
        &self.compiler.clients
    }

    /// Compile `config` and make it live.
    ///
    /// On error nothing changes: the previous snapshot keeps serving and no
    /// shared state is released.
    pub async fn update(&self, config: &GatewayConfig, digest: &str) -> Result<Arc<Snapshot>, BuildError> {
        let _serialized = self.reload_lock.lock().await;
        let started = Instant::now();

        let snapshot = match self.compiler.compile(config, digest).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                // Drop state the aborted build created; the live snapshot's
                // entries were only read.
                self.compiler
                    .arena
                    .retain_keys(self.current.load().state_keys());
                tracing::error!(digest = %digest, error = %e, "Snapshot build failed");
                return Err(e);
            }
        };

        let previous = self.current.swap(snapshot.clone());

        // Entries only the replaced snapshot used are released; in-flight
        // requests on it keep their own references.
        self.compiler.arena.retain_keys(snapshot.state_keys());
        self.compiler.clients.install(snapshot.pools());

        tracing::info!(
            name = %snapshot.name,
            version = %snapshot.version,
            digest = %digest,
            previous = %previous.digest,
            routes = snapshot.route_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot applied"
        );
        Ok(snapshot)
    }

    fn route_for(snapshot: &Snapshot, request: &Request<Body>) -> Option<Arc<CompiledRoute>> {
        let host = request.routing_host();
        let route = snapshot.find(host.as_deref(), request.uri().path()).cloned();
        if route.is_none() {
            tracing::debug!(
                host = host.as_deref().unwrap_or(""),
                path = %request.uri().path(),
                "No route matched"
            );
        }
        route
    }

    /// Run `request` through the route's chain under its deadline.
    async fn forward(route: &CompiledRoute, mut request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let deadline = Deadline::after(route.timeout);
        request.extensions_mut().insert(deadline);

        let work = AssertUnwindSafe(route.chain.handle(request)).catch_unwind();
        match tokio::time::timeout_at(deadline.0, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                tracing::error!(route = %route.key, "Request handling panicked");
                Err(ProxyError::Internal("request handling panicked".to_string()))
            }
            Err(_) => Err(ProxyError::Timeout),
        }
    }

    /// Route and forward one request.
    pub async fn dispatch(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let snapshot = self.current.load_full();
        match Self::route_for(&snapshot, &request) {
            Some(route) => Self::forward(&route, request).await,
            None => Err(ProxyError::NoRoute),
        }
    }

    /// `dispatch` plus the error mapping and request metrics.
    pub async fn serve(&self, request: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let method = request.method().clone();
        let snapshot = self.current.load_full();
        let route = Self::route_for(&snapshot, &request);
        let label = route.as_ref().map(|r| r.key.as_str()).unwrap_or("none");

        let result = match &route {
            Some(route) => Self::forward(route, request).await,
            None => Err(ProxyError::NoRoute),
        };
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::record_error(label, e.kind());
                e.into_response()
            }
        };

        metrics::record_request(label, method.as_str(), response.status().as_u16(), started.elapsed());
        response
    }

    pub fn status(&self) -> EngineStatus {
        let snapshot = self.current.load_full();
        let live = snapshot.state_keys();

        let routes = snapshot
            .routes()
            .map(|route| {
                let pool = snapshot.pool(&route.service);
                RouteStatus {
                    key: route.key.clone(),
                    service: route.service.clone(),
                    middlewares: route.chain.middlewares().to_vec(),
                    endpoints: pool.map(|p| p.members().len()).unwrap_or(0),
                    available: pool.map(|p| p.available()).unwrap_or(0),
                }
            })
            .collect();

        let circuits = self
            .compiler
            .arena
            .entries_of::<RouteBreakers>()
            .into_iter()
            .filter(|(key, _)| live.contains(key))
            .flat_map(|(_, breakers)| {
                let route = breakers.route().to_string();
                let pool = snapshot
                    .routes()
                    .find(|r| r.key == route)
                    .and_then(|r| snapshot.pool(&r.service));
                if let Some(pool) = pool {
                    breakers.sync_members(&pool.members());
                }
                breakers
                    .states()
                    .into_iter()
                    .map(move |(target, state)| CircuitStatus {
                        route: route.clone(),
                        target,
                        state,
                    })
            })
            .collect();

        let limiters = self
            .compiler
            .arena
            .entries_of::<BbrLimiter>()
            .into_iter()
            .filter(|(key, _)| live.contains(key))
            .map(|(_, limiter)| LimiterStatus {
                label: limiter.label().to_string(),
                stats: limiter.stats(),
            })
            .collect();

        EngineStatus {
            name: snapshot.name.clone(),
            version: snapshot.version.clone(),
            digest: snapshot.digest.clone(),
            routes,
            circuits,
            limiters,
        }
    }
}

#[async_trait]
impl ConfigHandler for ProxyEngine {
    async fn on_change(&self, config: &GatewayConfig, digest: &str) -> Result<(), BoxError> {
        self.update(config, digest).await?;
        Ok(())
    }
}

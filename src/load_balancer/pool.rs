//! Client pools and the per-service pool cache.
//!
//! # Responsibilities
//! - Hold the live endpoint set of one service (copy-on-update)
//! - Apply load balancing algorithms to select backends
//! - Memoize one pool per service and keep it current from discovery
//! - Own the shared upstream HTTP client

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use axum::body::Body;
use dashmap::DashMap;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::sync::watch;

use crate::config::ServiceConfig;
use crate::discovery::{resolution_target, DiscoveryError, DiscoveryRegistry, Endpoint, Resolver};
use crate::load_balancer::{
    backend::{Backend, BackendConnectionGuard},
    balancer_for, LoadBalancer,
};
use crate::observability::metrics;
use crate::proxy::error::BuildError;

/// Upstream HTTP client shared by every pool.
pub type HttpClient = Client<HttpConnector, Body>;

/// Load-balanced endpoint set of one service.
#[derive(Debug)]
pub struct ClientPool {
    service: String,
    /// Serialized service config the pool was built from.
    fingerprint: String,
    balancer: Box<dyn LoadBalancer>,
    max_connections: usize,
    members: ArcSwap<Vec<Arc<Backend>>>,
    last_error: ArcSwapOption<String>,
    /// Dropped together with the pool; ends the discovery watch task.
    alive: watch::Sender<()>,
}

impl ClientPool {
    pub fn new(service: &ServiceConfig) -> Self {
        Self {
            service: service.name.clone(),
            fingerprint: fingerprint(service),
            balancer: balancer_for(service.load_balance),
            max_connections: service.max_connections_per_endpoint,
            members: ArcSwap::from_pointee(Vec::new()),
            last_error: ArcSwapOption::empty(),
            alive: watch::channel(()).0,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether this pool was built from `service` as configured now.
    pub fn built_from(&self, service: &ServiceConfig) -> bool {
        self.fingerprint == fingerprint(service)
    }

    /// Replace the member set.
    ///
    /// Backends are reused by address so their counters survive; removed
    /// backends are marked draining and only live on in in-flight guards.
    pub fn apply(&self, endpoints: &[Endpoint]) {
        let current = self.members.load_full();
        let mut next: Vec<Arc<Backend>> = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            if next.iter().any(|b| b.address == endpoint.address) {
                continue;
            }
            match current.iter().find(|b| b.address == endpoint.address) {
                Some(existing) => {
                    existing.refresh(endpoint);
                    next.push(existing.clone());
                }
                None => match Backend::from_endpoint(endpoint, self.max_connections) {
                    Ok(backend) => next.push(Arc::new(backend)),
                    Err(e) => tracing::warn!(
                        service = %self.service,
                        endpoint = %endpoint.address,
                        error = %e,
                        "Ignoring invalid endpoint address"
                    ),
                },
            }
        }

        let mut removed = 0;
        for old in current.iter() {
            if !next.iter().any(|b| Arc::ptr_eq(b, old)) {
                old.drain();
                removed += 1;
            }
        }
        let added = next
            .iter()
            .filter(|b| !current.iter().any(|old| Arc::ptr_eq(old, b)))
            .count();

        let total = next.len();
        self.members.store(Arc::new(next));
        self.last_error.store(None);
        metrics::set_pool_members(&self.service, total);

        if added > 0 || removed > 0 {
            tracing::info!(service = %self.service, added, removed, total, "Service membership changed");
        }
    }

    /// Record a discovery failure, reported while the pool has no members.
    pub fn set_error(&self, reason: impl Into<String>) {
        self.last_error.store(Some(Arc::new(reason.into())));
    }

    pub fn last_error(&self) -> Option<Arc<String>> {
        self.last_error.load_full()
    }

    /// Current members, in discovery order.
    pub fn members(&self) -> Arc<Vec<Arc<Backend>>> {
        self.members.load_full()
    }

    /// Number of members that could take a request right now.
    pub fn available(&self) -> usize {
        self.members.load().iter().filter(|b| b.is_available()).count()
    }

    /// Select a backend that is available and accepted by `admit`.
    /// Returns a guard that decrements the active count on drop.
    pub fn select(
        &self,
        admit: &mut dyn FnMut(&Arc<Backend>) -> bool,
    ) -> Option<BackendConnectionGuard> {
        let members = self.members.load();
        let mut reserved = None;
        let _picked = self.balancer.pick(members.as_slice(), &mut |backend| {
            if !backend.is_available() {
                return false;
            }
            let Some(guard) = backend.try_create_guard() else {
                return false;
            };
            if admit(backend) {
                reserved = Some(guard);
                true
            } else {
                false
            }
        });
        reserved
    }
}

fn fingerprint(service: &ServiceConfig) -> String {
    serde_json::to_string(service).unwrap_or_default()
}

/// Memoizes one client pool per service name.
///
/// Pools are prepared while a snapshot compiles and only enter the cache
/// through [`ClientFactory::install`] once that snapshot is live, so a failed
/// build never displaces the pools traffic is using.
pub struct ClientFactory {
    discovery: DiscoveryRegistry,
    resolvers: DashMap<String, Arc<dyn Resolver>>,
    pools: DashMap<String, Arc<ClientPool>>,
    client: HttpClient,
}

impl ClientFactory {
    pub fn new(discovery: DiscoveryRegistry) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            discovery,
            resolvers: DashMap::new(),
            pools: DashMap::new(),
            client,
        }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Pool for `service`: the cached one while its configuration is
    /// unchanged, otherwise a new pool that stays private until installed.
    ///
    /// Resolution failures leave the pool empty with the error recorded;
    /// only an unusable DSN fails the build.
    pub async fn prepare(&self, service: &ServiceConfig) -> Result<Arc<ClientPool>, BuildError> {
        if let Some(cached) = self.pools.get(&service.name) {
            if cached.built_from(service) {
                return Ok(cached.clone());
            }
        }
        self.build_pool(service).await
    }

    /// Make `pools` the cached set and forget every other service.
    pub fn install(&self, pools: &HashMap<String, Arc<ClientPool>>) {
        self.pools.retain(|name, _| {
            let kept = pools.contains_key(name);
            if !kept {
                tracing::debug!(service = %name, "Dropping unused client pool");
            }
            kept
        });
        for (name, pool) in pools {
            let fresh = self
                .pools
                .get(name)
                .map_or(true, |cached| !Arc::ptr_eq(cached.value(), pool));
            if fresh {
                self.pools.insert(name.clone(), pool.clone());
            }
        }
    }

    /// Cached pool by service name.
    pub fn pool(&self, service: &str) -> Option<Arc<ClientPool>> {
        self.pools.get(service).map(|pool| pool.clone())
    }

    async fn build_pool(&self, service: &ServiceConfig) -> Result<Arc<ClientPool>, BuildError> {
        let pool = Arc::new(ClientPool::new(service));

        let Some(dsn) = service.discovery_dsn.as_deref() else {
            let endpoints: Vec<Endpoint> = service
                .endpoints
                .iter()
                .map(|e| Endpoint::new(e.address()).with_weight(e.weight()))
                .collect();
            pool.apply(&endpoints);
            return Ok(pool);
        };

        let resolver = self.resolver(dsn).map_err(|source| BuildError::Discovery {
            service: service.name.clone(),
            source,
        })?;
        let target = resolution_target(dsn, &service.name);

        match resolver.resolve(&target).await {
            Ok(endpoints) => pool.apply(&endpoints),
            Err(e) => {
                tracing::warn!(service = %service.name, error = %e, "Initial resolution failed, starting with an empty pool");
                pool.set_error(e.to_string());
            }
        }

        match resolver.subscribe(&target) {
            Ok(updates) => spawn_watch(&pool, updates),
            Err(e) => {
                tracing::warn!(service = %service.name, error = %e, "Discovery subscription failed, membership is static")
            }
        }

        Ok(pool)
    }

    fn resolver(&self, dsn: &str) -> Result<Arc<dyn Resolver>, DiscoveryError> {
        if let Some(resolver) = self.resolvers.get(dsn) {
            return Ok(resolver.clone());
        }
        let resolver = self.discovery.create(dsn)?;
        Ok(self
            .resolvers
            .entry(dsn.to_string())
            .or_insert(resolver)
            .clone())
    }
}

/// Apply pushed endpoint sets until the pool or the resolver goes away.
fn spawn_watch(pool: &Arc<ClientPool>, mut updates: watch::Receiver<Vec<Endpoint>>) {
    let weak = Arc::downgrade(pool);
    let mut alive = pool.alive.subscribe();
    let service = pool.service.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        tracing::debug!(service = %service, "Discovery stream closed");
                        break;
                    }
                    let endpoints = updates.borrow_and_update().clone();
                    match weak.upgrade() {
                        Some(pool) => pool.apply(&endpoints),
                        None => break,
                    }
                }
                _ = alive.changed() => break,
            }
        }
    });
}

//! Immutable, fully compiled view of one configuration.
//!
//! A snapshot owns everything a request needs: the route table, each route's
//! chain and the pools the chains forward to. Building happens off to the
//! side; a half-built snapshot is never visible to traffic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::validation::validate_config;
use crate::config::GatewayConfig;
use crate::load_balancer::{ClientFactory, ClientPool};
use crate::middleware::chain::{Chain, ChainBuilder};
use crate::middleware::MiddlewareRegistry;
use crate::proxy::error::BuildError;
use crate::proxy::state::StateArena;
use crate::proxy::transport::BackendTransport;
use crate::routing::{RouteMatcher, Router};

/// A route ready to serve traffic.
#[derive(Debug)]
pub struct CompiledRoute {
    pub key: String,
    pub service: String,
    pub timeout: Duration,
    pub chain: Chain,
}

#[derive(Debug)]
pub struct Snapshot {
    pub name: String,
    pub version: String,
    pub digest: String,
    router: Router<Arc<CompiledRoute>>,
    pools: HashMap<String, Arc<ClientPool>>,
    state_keys: HashSet<String>,
}

impl Snapshot {
    /// The snapshot served before any configuration was applied: no routes.
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            digest: String::new(),
            router: Router::default(),
            pools: HashMap::new(),
            state_keys: HashSet::new(),
        }
    }

    pub fn find(&self, host: Option<&str>, path: &str) -> Option<&Arc<CompiledRoute>> {
        self.router.find(host, path)
    }

    /// Routes in match precedence order.
    pub fn routes(&self) -> impl Iterator<Item = &Arc<CompiledRoute>> {
        self.router.iter()
    }

    pub fn route_count(&self) -> usize {
        self.router.len()
    }

    pub fn pool(&self, service: &str) -> Option<&Arc<ClientPool>> {
        self.pools.get(service)
    }

    /// Pools by service name.
    pub fn pools(&self) -> &HashMap<String, Arc<ClientPool>> {
        &self.pools
    }

    /// Shared-state entries the chains of this snapshot hold.
    pub fn state_keys(&self) -> &HashSet<String> {
        &self.state_keys
    }
}

/// Turns a `GatewayConfig` into a `Snapshot`.
pub struct SnapshotCompiler {
    pub registry: Arc<MiddlewareRegistry>,
    pub clients: Arc<ClientFactory>,
    pub arena: Arc<StateArena>,
}

impl SnapshotCompiler {
    pub fn new(
        registry: Arc<MiddlewareRegistry>,
        clients: Arc<ClientFactory>,
        arena: Arc<StateArena>,
    ) -> Self {
        Self {
            registry,
            clients,
            arena,
        }
    }

    /// Build every route of `config`. Any failure aborts the whole build.
    pub async fn compile(&self, config: &GatewayConfig, digest: &str) -> Result<Snapshot, BuildError> {
        validate_config(config).map_err(BuildError::Validation)?;

        let builder = ChainBuilder::new(&self.registry, &self.arena);
        let mut pools: HashMap<String, Arc<ClientPool>> = HashMap::new();
        let mut routes = Vec::with_capacity(config.routes.len());

        for route in &config.routes {
            let key = route.key();
            let service = config
                .service(&route.target_service)
                .ok_or_else(|| BuildError::UnknownService {
                    route: key.clone(),
                    service: route.target_service.clone(),
                })?;

            let pool = match pools.get(&service.name) {
                Some(pool) => pool.clone(),
                None => {
                    let pool = self.clients.prepare(service).await?;
                    pools.insert(service.name.clone(), pool.clone());
                    pool
                }
            };

            let terminal = Arc::new(BackendTransport::new(
                &key,
                pool,
                self.clients.client().clone(),
            ));
            let chain = builder.compile(route, terminal)?;

            tracing::debug!(
                route = %key,
                service = %service.name,
                middlewares = ?chain.middlewares(),
                "Route compiled"
            );

            routes.push((
                RouteMatcher::new(route.match_host.as_deref(), &route.match_path),
                Arc::new(CompiledRoute {
                    key,
                    service: service.name.clone(),
                    timeout: Duration::from_millis(route.timeout_ms),
                    chain,
                }),
            ));
        }

        Ok(Snapshot {
            name: config.name.clone(),
            version: config.version.clone(),
            digest: digest.to_string(),
            router: Router::new(routes),
            pools,
            state_keys: builder.into_state_keys(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MiddlewareConfig, RouteConfig, ServiceConfig};
    use crate::discovery::DiscoveryRegistry;

    fn compiler() -> SnapshotCompiler {
        SnapshotCompiler::new(
            Arc::new(MiddlewareRegistry::with_builtins()),
            Arc::new(ClientFactory::new(DiscoveryRegistry::with_builtins())),
            Arc::new(StateArena::new()),
        )
    }

    fn route(path: &str, service: &str) -> RouteConfig {
        RouteConfig {
            name: None,
            match_host: None,
            match_path: path.to_string(),
            target_service: service.to_string(),
            timeout_ms: 1_000,
            middlewares: Vec::new(),
        }
    }

    fn config(routes: Vec<RouteConfig>) -> GatewayConfig {
        GatewayConfig {
            name: "gw".to_string(),
            routes,
            services: vec![
                ServiceConfig::with_endpoints("a", ["127.0.0.1:9001"]),
                ServiceConfig::with_endpoints("b", ["127.0.0.1:9002"]),
            ],
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_compiles_routes_and_shares_pools() {
        let compiler = compiler();
        let snapshot = compiler
            .compile(
                &config(vec![route("/a/*", "a"), route("/a/exact", "a"), route("/*", "b")]),
                "d1",
            )
            .await
            .unwrap();

        assert_eq!(snapshot.route_count(), 3);
        assert_eq!(snapshot.digest, "d1");
        assert_eq!(snapshot.pools().len(), 2);
        assert_eq!(snapshot.find(None, "/a/exact").unwrap().key, "*/a/exact->a");
        assert_eq!(snapshot.find(None, "/a/other").unwrap().service, "a");
        assert_eq!(snapshot.find(None, "/z").unwrap().service, "b");
    }

    #[tokio::test]
    async fn test_unknown_middleware_fails_whole_build() {
        let compiler = compiler();
        let mut bad = route("/x", "a");
        bad.middlewares.push(MiddlewareConfig::new("nope"));

        let err = compiler
            .compile(&config(vec![route("/ok", "a"), bad]), "d")
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownMiddleware { .. }));
    }

    #[tokio::test]
    async fn test_state_keys_collected() {
        let compiler = compiler();
        let mut limited = route("/x", "a");
        limited.name = Some("limited".to_string());
        limited.middlewares.push(MiddlewareConfig::new("bbr"));

        let snapshot = compiler.compile(&config(vec![limited]), "d").await.unwrap();
        assert_eq!(snapshot.state_keys().len(), 1);
        assert!(snapshot
            .state_keys()
            .iter()
            .all(|k| k.starts_with("limited|bbr|")));
        assert!(Snapshot::empty().find(None, "/x").is_none());
    }
}

//! In-memory resolver.
//!
//! Seeded from the DSN query (`static://local?svc-a=10.0.0.1:80,10.0.0.2:80`)
//! and updatable at runtime through [`StaticResolver::set_endpoints`], which
//! pushes the new set to every subscriber.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use url::Url;

use crate::discovery::{DiscoveryError, Endpoint, Resolver};

#[derive(Debug, Default)]
pub struct StaticResolver {
    services: DashMap<String, watch::Sender<Vec<Endpoint>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dsn(dsn: &Url) -> Result<Self, DiscoveryError> {
        let resolver = Self::new();
        for (service, addresses) in dsn.query_pairs() {
            let endpoints = addresses
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(Endpoint::new)
                .collect();
            resolver.set_endpoints(&service, endpoints);
        }
        Ok(resolver)
    }

    /// Replace the endpoint set of `service` and notify subscribers.
    pub fn set_endpoints(&self, service: &str, endpoints: Vec<Endpoint>) {
        self.services
            .entry(service.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .send_replace(endpoints);
        tracing::debug!(service = %service, "Static endpoints updated");
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, target: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
        self.services
            .get(target)
            .map(|tx| tx.borrow().clone())
            .ok_or_else(|| DiscoveryError::Resolve {
                target: target.to_string(),
                reason: "service is not registered".to_string(),
            })
    }

    fn subscribe(&self, target: &str) -> Result<watch::Receiver<Vec<Endpoint>>, DiscoveryError> {
        Ok(self
            .services
            .entry(target.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .subscribe())
    }
}

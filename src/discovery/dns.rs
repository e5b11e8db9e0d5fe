//! DNS resolver.
//!
//! `dns:///orders.internal:8080?interval_ms=5000&port=8080`
//!
//! Resolves through the system resolver and re-polls on an interval, pushing
//! only when the address set changes. A poll task lives as long as somebody
//! is subscribed to its target.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use url::Url;

use crate::discovery::{query_millis, DiscoveryError, Endpoint, Resolver};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct DnsResolver {
    interval: Duration,
    default_port: Option<u16>,
    channels: Arc<DashMap<String, watch::Receiver<Vec<Endpoint>>>>,
}

impl DnsResolver {
    pub fn new(interval: Duration, default_port: Option<u16>) -> Self {
        Self {
            interval,
            default_port,
            channels: Arc::new(DashMap::new()),
        }
    }

    pub fn from_dsn(dsn: &Url) -> Result<Self, DiscoveryError> {
        let interval = query_millis(dsn, "interval_ms")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INTERVAL);
        let default_port = dsn
            .query_pairs()
            .find(|(k, _)| k == "port")
            .map(|(_, v)| {
                v.parse::<u16>().map_err(|e| DiscoveryError::InvalidDsn {
                    dsn: dsn.to_string(),
                    reason: format!("`port`: {}", e),
                })
            })
            .transpose()?;
        Ok(Self::new(interval, default_port))
    }

    fn qualified(&self, target: &str) -> String {
        match self.default_port {
            Some(port) if !target.contains(':') => format!("{}:{}", target, port),
            _ => target.to_string(),
        }
    }
}

async fn lookup(target: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
    let addrs = tokio::net::lookup_host(target)
        .await
        .map_err(|e| DiscoveryError::Resolve {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

    let mut endpoints: Vec<Endpoint> = addrs.map(|a| Endpoint::new(a.to_string())).collect();
    endpoints.sort_by(|a, b| a.address.cmp(&b.address));
    endpoints.dedup();
    Ok(endpoints)
}

async fn poll(
    target: String,
    tx: watch::Sender<Vec<Endpoint>>,
    channels: Arc<DashMap<String, watch::Receiver<Vec<Endpoint>>>>,
    interval: Duration,
) {
    loop {
        match lookup(&target).await {
            Ok(endpoints) => {
                let changed = tx.send_if_modified(|current| {
                    if *current != endpoints {
                        *current = endpoints;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    tracing::info!(target = %target, endpoints = tx.borrow().len(), "DNS endpoints changed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "DNS poll failed; keeping previous endpoints"),
        }

        tokio::time::sleep(interval).await;

        // The registry keeps one receiver of its own.
        if channels
            .remove_if(&target, |_, _| tx.receiver_count() <= 1)
            .is_some()
        {
            tracing::debug!(target = %target, "No DNS subscribers left, stopping poll");
            return;
        }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, target: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
        lookup(&self.qualified(target)).await
    }

    fn subscribe(&self, target: &str) -> Result<watch::Receiver<Vec<Endpoint>>, DiscoveryError> {
        let target = self.qualified(target);
        if let Some(rx) = self.channels.get(&target) {
            return Ok(rx.clone());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| DiscoveryError::Resolve {
            target: target.clone(),
            reason: e.to_string(),
        })?;

        let rx = self
            .channels
            .entry(target.clone())
            .or_insert_with(|| {
                let (tx, rx) = watch::channel(Vec::new());
                runtime.spawn(poll(target.clone(), tx, self.channels.clone(), self.interval));
                rx
            })
            .clone();
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_dsn() {
        let dsn = Url::parse("dns:///orders.internal?interval_ms=250&port=8080").unwrap();
        let resolver = DnsResolver::from_dsn(&dsn).unwrap();
        assert_eq!(resolver.interval, Duration::from_millis(250));
        assert_eq!(resolver.qualified("orders.internal"), "orders.internal:8080");
        assert_eq!(resolver.qualified("orders.internal:9090"), "orders.internal:9090");

        let bad = Url::parse("dns:///x?interval_ms=soon").unwrap();
        assert!(DnsResolver::from_dsn(&bad).is_err());
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let resolver = DnsResolver::new(Duration::from_millis(50), None);
        let endpoints = resolver.resolve("127.0.0.1:8080").await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::new("127.0.0.1:8080")]);
    }

    #[tokio::test]
    async fn test_subscription_receives_initial_set() {
        let resolver = DnsResolver::new(Duration::from_millis(50), None);
        let mut rx = resolver.subscribe("127.0.0.1:9000").unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_slice(), &[Endpoint::new("127.0.0.1:9000")]);

        // Shared channel for the same target.
        let rx2 = resolver.subscribe("127.0.0.1:9000").unwrap();
        assert_eq!(rx2.borrow().len(), 1);
    }
}

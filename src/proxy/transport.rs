//! Terminal hop of every chain: pick an endpoint and forward.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderName, HeaderValue, Request, Response, Uri, Version};
use hyper::body::Incoming;

use crate::load_balancer::{ClientPool, HttpClient};
use crate::middleware::RoundTrip;
use crate::observability::metrics;
use crate::proxy::error::ProxyError;
use crate::resilience::circuit_breaker::{BreakerPermit, EndpointBreakers};
use crate::resilience::classify;
use crate::resilience::timeouts::{within, Deadline};

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

pub struct BackendTransport {
    route: String,
    pool: Arc<ClientPool>,
    client: HttpClient,
}

impl BackendTransport {
    pub fn new(route: &str, pool: Arc<ClientPool>, client: HttpClient) -> Self {
        Self {
            route: route.to_string(),
            pool,
            client,
        }
    }

    /// Why no endpoint could be selected.
    fn unavailable(&self, breaker_rejected: bool) -> ProxyError {
        let service = self.pool.service().to_string();
        if breaker_rejected {
            metrics::record_rejection(&self.route, "circuit_open");
            return ProxyError::CircuitOpen(service);
        }
        match self.pool.last_error() {
            Some(reason) if self.pool.members().is_empty() => ProxyError::Discovery {
                service,
                reason: reason.to_string(),
            },
            _ => ProxyError::NoHealthyEndpoint(service),
        }
    }
}

fn upstream_uri(original: &Uri, authority: &axum::http::uri::Authority) -> Result<Uri, ProxyError> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme("http")
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))
}

#[async_trait]
impl RoundTrip for BackendTransport {
    async fn round_trip(&self, mut request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let deadline = Deadline::of(&request);
        let breakers = request.extensions_mut().remove::<EndpointBreakers>();
        if let Some(EndpointBreakers(set)) = &breakers {
            set.sync_members(&self.pool.members());
        }

        let mut permit: Option<BreakerPermit> = None;
        let mut breaker_rejected = false;
        let guard = self.pool.select(&mut |backend| match &breakers {
            None => true,
            Some(EndpointBreakers(set)) => match set.get(&backend.address).try_acquire() {
                Some(p) => {
                    permit = Some(p);
                    true
                }
                None => {
                    breaker_rejected = true;
                    false
                }
            },
        });
        let Some(guard) = guard else {
            let err = self.unavailable(breaker_rejected);
            tracing::debug!(route = %self.route, service = %self.pool.service(), error = %err, "No endpoint selected");
            return Err(err);
        };

        let (mut parts, body) = request.into_parts();
        parts.uri = upstream_uri(&parts.uri, &guard.authority)?;
        parts.version = Version::HTTP_11;
        for name in HOP_BY_HOP.iter() {
            parts.headers.remove(name);
        }
        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            let forwarded = match parts.headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{}, {}", prior, peer.ip()),
                None => peer.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                parts.headers.insert(X_FORWARDED_FOR, value);
            }
        }

        let endpoint = guard.address.clone();
        let upstream = Request::from_parts(parts, body);
        tracing::trace!(route = %self.route, endpoint = %endpoint, uri = %upstream.uri(), "Forwarding");

        let result = within(deadline, async {
            self.client
                .request(upstream)
                .await
                .map(|response: Response<Incoming>| {
                    let (parts, body) = response.into_parts();
                    Response::from_parts(parts, Body::new(body))
                })
                .map_err(|e| ProxyError::Upstream {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })
        })
        .await;

        if let Err(e) = &result {
            tracing::warn!(route = %self.route, endpoint = %endpoint, error = %e, "Upstream request failed");
        }
        if let Some(permit) = permit {
            match classify(&result) {
                Some(outcome) => permit.record(outcome),
                None => permit.release(),
            }
        }
        drop(guard);
        result
    }
}

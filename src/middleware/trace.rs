//! Request correlation: a span per request plus `x-request-id` and W3C
//! `traceparent` propagation to the backend and back to the client.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, Response};
use serde::Deserialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::http::request::X_REQUEST_ID;
use crate::middleware::{BuildContext, Middleware, RoundTrip, Transport};
use crate::proxy::error::{BuildError, ProxyError};

pub const NAME: &str = "tracing";

const TRACEPARENT: &str = "traceparent";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceParams {
    /// Emit and forward `traceparent`.
    pub traceparent: bool,
    /// Copy the correlation headers onto the response.
    pub echo: bool,
}

impl Default for TraceParams {
    fn default() -> Self {
        Self {
            traceparent: true,
            echo: true,
        }
    }
}

/// Parsed W3C trace context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub flags: String,
}

impl TraceContext {
    /// Parse `00-<32 hex>-<16 hex>-<2 hex>`; all-zero ids are invalid.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        let hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
        let zero = |s: &str| s.bytes().all(|b| b == b'0');
        if version != "00"
            || parts.next().is_some()
            || !hex(trace_id, 32)
            || !hex(span_id, 16)
            || !hex(flags, 2)
            || zero(trace_id)
            || zero(span_id)
        {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
            flags: flags.to_ascii_lowercase(),
        })
    }

    /// A new root context.
    pub fn root() -> Self {
        Self {
            trace_id: format!("{:032x}", rand::random::<u128>().max(1)),
            span_id: new_span_id(),
            flags: "01".to_string(),
        }
    }

    /// Child of `self` for the hop to the backend.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            flags: self.flags.clone(),
        }
    }

    pub fn header_value(&self) -> String {
        format!("00-{}-{}-{}", self.trace_id, self.span_id, self.flags)
    }
}

fn new_span_id() -> String {
    format!("{:016x}", rand::random::<u64>().max(1))
}

struct Trace {
    route: String,
    params: TraceParams,
}

struct TraceLayer(Arc<Trace>);

struct TraceTransport {
    trace: Arc<Trace>,
    next: Transport,
}

impl Middleware for TraceLayer {
    fn wrap(&self, next: Transport) -> Transport {
        Arc::new(TraceTransport {
            trace: self.0.clone(),
            next,
        })
    }
}

fn header(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(value).ok()
}

#[async_trait]
impl RoundTrip for TraceTransport {
    async fn round_trip(&self, mut request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let request_id = request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let context = if self.trace.params.traceparent {
            let incoming = request
                .headers()
                .get(TRACEPARENT)
                .and_then(|v| v.to_str().ok())
                .and_then(TraceContext::parse);
            Some(incoming.map(|c| c.child()).unwrap_or_else(TraceContext::root))
        } else {
            None
        };

        let headers = request.headers_mut();
        if let Some(value) = header(&request_id) {
            headers.insert(HeaderName::from_static(X_REQUEST_ID), value);
        }
        if let Some(value) = context.as_ref().and_then(|c| header(&c.header_value())) {
            headers.insert(HeaderName::from_static(TRACEPARENT), value);
        }

        let span = tracing::info_span!(
            "gateway.request",
            route = %self.trace.route,
            request_id = %request_id,
            trace_id = context.as_ref().map(|c| c.trace_id.as_str()).unwrap_or(""),
            method = %request.method(),
            path = %request.uri().path(),
        );

        let mut response = self.next.round_trip(request).instrument(span).await?;

        if self.trace.params.echo {
            let headers = response.headers_mut();
            if let Some(value) = header(&request_id) {
                headers.insert(HeaderName::from_static(X_REQUEST_ID), value);
            }
            if let Some(value) = context.as_ref().and_then(|c| header(&c.header_value())) {
                headers.insert(HeaderName::from_static(TRACEPARENT), value);
            }
        }
        Ok(response)
    }
}

pub fn factory(ctx: &BuildContext<'_>) -> Result<Arc<dyn Middleware>, BuildError> {
    let params: TraceParams = ctx.params()?;
    Ok(Arc::new(TraceLayer(Arc::new(Trace {
        route: ctx.route().to_string(),
        params,
    }))))
}

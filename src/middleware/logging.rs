//! Access log middleware: one structured line per request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use serde::Deserialize;
use tokio::time::Instant;

use crate::http::request::RequestIdExt;
use crate::middleware::{BuildContext, Middleware, RoundTrip, Transport};
use crate::proxy::error::{BuildError, ProxyError};

pub const NAME: &str = "logging";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingParams {
    pub level: AccessLogLevel,
    /// Requests slower than this are logged at warn.
    pub slow_ms: Option<u64>,
}

struct AccessLog {
    route: String,
    level: AccessLogLevel,
    slow: Option<Duration>,
}

struct AccessLogTransport {
    log: Arc<AccessLog>,
    next: Transport,
}

struct AccessLogLayer(Arc<AccessLog>);

impl Middleware for AccessLogLayer {
    fn wrap(&self, next: Transport) -> Transport {
        Arc::new(AccessLogTransport {
            log: self.0.clone(),
            next,
        })
    }
}

#[async_trait]
impl RoundTrip for AccessLogTransport {
    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let start = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let request_id = request.request_id().unwrap_or("-").to_string();

        let result = self.next.round_trip(request).await;

        let latency_ms = start.elapsed().as_millis() as u64;
        let status = match &result {
            Ok(response) => response.status(),
            Err(e) => e.status(),
        };
        let error = result.as_ref().err().map(|e| e.to_string());
        let route = &self.log.route;

        let level = match self.log.slow {
            Some(slow) if start.elapsed() >= slow => AccessLogLevel::Warn,
            _ => self.log.level,
        };
        macro_rules! access {
            ($mac:ident) => {
                tracing::$mac!(
                    route = %route,
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    status = status.as_u16(),
                    latency_ms,
                    error = error.as_deref().unwrap_or(""),
                    "access"
                )
            };
        }
        match level {
            AccessLogLevel::Trace => access!(trace),
            AccessLogLevel::Debug => access!(debug),
            AccessLogLevel::Info => access!(info),
            AccessLogLevel::Warn => access!(warn),
        }

        result
    }
}

pub fn factory(ctx: &BuildContext<'_>) -> Result<Arc<dyn Middleware>, BuildError> {
    let params: LoggingParams = ctx.params()?;
    Ok(Arc::new(AccessLogLayer(Arc::new(AccessLog {
        route: ctx.route().to_string(),
        level: params.level,
        slow: params.slow_ms.map(Duration::from_millis),
    }))))
}

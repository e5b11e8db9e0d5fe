//! Error types of the proxy core.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::config::validation::ValidationError;
use crate::discovery::DiscoveryError;

/// Per-request failure, terminated locally into a synthetic response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("no matching route found")]
    NoRoute,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("circuit open for `{0}`")]
    CircuitOpen(String),

    #[error("no healthy endpoint for service `{0}`")]
    NoHealthyEndpoint(String),

    #[error("discovery failed for service `{service}`: {reason}")]
    Discovery { service: String, reason: String },

    #[error("upstream {endpoint} failed: {reason}")]
    Upstream { endpoint: String, reason: String },

    #[error("upstream deadline exceeded")]
    Timeout,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute => StatusCode::NOT_FOUND,
            ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::CircuitOpen(_)
            | ProxyError::NoHealthyEndpoint(_)
            | ProxyError::Discovery { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label used for rejection metrics and access logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::NoRoute => "no_route",
            ProxyError::RateLimited => "rate_limited",
            ProxyError::CircuitOpen(_) => "circuit_open",
            ProxyError::NoHealthyEndpoint(_) => "no_healthy_endpoint",
            ProxyError::Discovery { .. } => "discovery",
            ProxyError::Upstream { .. } => "upstream",
            ProxyError::Timeout => "timeout",
            ProxyError::Forbidden(_) => "forbidden",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::Internal(_) => "internal",
        }
    }

    /// Whether this error says something about backend health.
    ///
    /// Admission rejections (limiter, breaker, auth) never count against a
    /// backend.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, ProxyError::Upstream { .. } | ProxyError::Timeout)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Snapshot compilation failure. Aborts the whole reload.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("route `{route}`: unknown middleware `{name}`")]
    UnknownMiddleware { route: String, name: String },

    #[error("route `{route}`: invalid params for middleware `{middleware}`: {reason}")]
    InvalidParams {
        route: String,
        middleware: String,
        reason: String,
    },

    #[error("route `{route}` targets undeclared service `{service}`")]
    UnknownService { route: String, service: String },

    #[error("service `{service}`: {source}")]
    Discovery {
        service: String,
        #[source]
        source: DiscoveryError,
    },

    #[error("invalid configuration: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

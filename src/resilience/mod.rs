//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request through a route chain:
//!     → bbr.rs (admission: permit or 429, never waits)
//!     → circuit_breaker.rs (route breaker, or endpoint breakers consulted
//!       while the backend transport selects an endpoint)
//!     → timeouts.rs (route deadline bounds the backend call)
//!     → outcome reported back to breaker and limiter
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every backend call has a deadline
//! - No retries in the core; a retry policy belongs in an outer middleware
//! - Breaker and limiter state is keyed and survives reloads
//! - Fast paths are atomics; locks only cover in-memory window updates

pub mod backoff;
pub mod bbr;
pub mod circuit_breaker;
pub mod timeouts;
pub mod window;

use axum::body::Body;
use axum::http::Response;

use crate::proxy::error::ProxyError;

/// Result of a forwarded request as seen by breakers and limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Classify a chain result.
///
/// 5xx responses, transport errors and timeouts are failures; 4xx are
/// successes from the backend's point of view. Rejections that never reached
/// a backend yield `None`.
pub fn classify(result: &Result<Response<Body>, ProxyError>) -> Option<Outcome> {
    match result {
        Ok(response) if response.status().is_server_error() => Some(Outcome::Failure),
        Ok(_) => Some(Outcome::Success),
        Err(e) if e.is_backend_failure() => Some(Outcome::Failure),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn response(status: StatusCode) -> Result<Response<Body>, ProxyError> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        Ok(response)
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&response(StatusCode::OK)), Some(Outcome::Success));
        assert_eq!(classify(&response(StatusCode::NOT_FOUND)), Some(Outcome::Success));
        assert_eq!(classify(&response(StatusCode::BAD_GATEWAY)), Some(Outcome::Failure));
        assert_eq!(classify(&Err(ProxyError::Timeout)), Some(Outcome::Failure));
        assert_eq!(classify(&Err(ProxyError::RateLimited)), None);
    }
}

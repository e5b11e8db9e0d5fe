//! Request metadata helpers.
//!
//! # Responsibilities
//! - Name the request ID header shared by the HTTP front and the middlewares
//! - Extract routing-relevant information (host, path)
//!
//! # Design Decisions
//! - Request ID added as early as possible (tower-http layer in server.rs)
//! - Host taken from the `Host` header, falling back to the URI authority

use axum::http::{header, Request};

use crate::routing::normalize_host;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Accessors for request metadata.
pub trait RequestIdExt {
    /// The request ID assigned by the front layer or the client.
    fn request_id(&self) -> Option<&str>;

    /// Lowercased host without port.
    fn routing_host(&self) -> Option<String>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
    }

    fn routing_host(&self) -> Option<String> {
        self.headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri().host())
            .map(normalize_host)
            .filter(|h| !h.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_host() {
        let req = Request::builder()
            .uri("/v1/x")
            .header("host", "API.Example.com:8443")
            .body(())
            .unwrap();
        assert_eq!(req.routing_host().as_deref(), Some("api.example.com"));

        let absolute = Request::builder()
            .uri("http://svc.local:80/x")
            .body(())
            .unwrap();
        assert_eq!(absolute.routing_host().as_deref(), Some("svc.local"));

        let none = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(none.routing_host(), None);
        assert_eq!(none.request_id(), None);
    }
}

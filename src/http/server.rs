//! HTTP front: the axum listener that hands every request to the engine.
//!
//! # Responsibilities
//! - Wire up middleware (request ID, tracing, body limit)
//! - Bind server to listener with client address info
//! - Dispatch every request to the proxy engine
//! - Drain on shutdown

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{body::Body, extract::State, http::Request, response::Response, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ListenerConfig;
use crate::proxy::ProxyEngine;

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(engine: Arc<ProxyEngine>, config: &ListenerConfig) -> Self {
        Self {
            router: Self::build_router(engine, config.max_body_bytes),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(engine: Arc<ProxyEngine>, max_body_bytes: usize) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(engine)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(RequestBodyLimitLayer::new(max_body_bytes)),
            )
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` fires, then drain open requests.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn proxy_handler(
    State(engine): State<Arc<ProxyEngine>>,
    request: Request<Body>,
) -> Response {
    engine.serve(request).await
}

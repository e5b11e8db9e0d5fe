//! API gateway data plane library.
//!
//! Requests are matched against an immutable, atomically swapped snapshot of
//! compiled routes; each route runs an ordered middleware chain in front of a
//! load-balanced, discovery-backed client pool.

// Core subsystems
pub mod config;
pub mod http;
pub mod proxy;
pub mod routing;

// Traffic management
pub mod discovery;
pub mod load_balancer;
pub mod middleware;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::{ProxyEngine, ProxyError};

//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by route, method, status
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency by route
//! - `gateway_errors_total` (counter): gateway-generated errors by route, kind
//! - `gateway_rejections_total` (counter): requests refused by a middleware
//! - `gateway_circuit_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `gateway_pool_members` (gauge): endpoints per service
//! - `gateway_config_reloads_total` (counter): reload attempts by outcome
//!
//! Recording is a no-op until `init_metrics` installs the exporter.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus exporter with its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_request(route: &str, method: &str, status: u16, elapsed: Duration) {
    counter!(
        "gateway_requests_total",
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds", "route" => route.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_error(route: &str, kind: &'static str) {
    counter!("gateway_errors_total", "route" => route.to_string(), "kind" => kind).increment(1);
}

pub fn record_rejection(route: &str, reason: &'static str) {
    counter!("gateway_rejections_total", "route" => route.to_string(), "reason" => reason)
        .increment(1);
}

pub fn set_circuit_state(route: &str, target: &str, state: CircuitState) {
    gauge!(
        "gateway_circuit_state",
        "route" => route.to_string(),
        "target" => target.to_string()
    )
    .set(state as u8 as f64);
}

pub fn set_pool_members(service: &str, members: usize) {
    gauge!("gateway_pool_members", "service" => service.to_string()).set(members as f64);
}

pub fn record_reload(outcome: &'static str) {
    counter!("gateway_config_reloads_total", "outcome" => outcome).increment(1);
}

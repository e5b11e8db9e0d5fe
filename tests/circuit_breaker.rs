//! Breaker behaviour against real backends.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use api_gateway::resilience::circuit_breaker::CircuitState;
use axum::http::StatusCode;

mod common;

/// Backend that answers 500 while `failing` is set, counting every hit.
async fn flaky_backend(failing: Arc<AtomicBool>, hits: Arc<AtomicU32>) -> std::net::SocketAddr {
    common::start_programmable_backend(move |_| {
        let failing = failing.clone();
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            if failing.load(Ordering::SeqCst) {
                (500, "broken".to_string())
            } else {
                (200, "flaky".to_string())
            }
        }
    })
    .await
}

fn config(flaky: std::net::SocketAddr, healthy: std::net::SocketAddr) -> String {
    format!(
        r#"
[[services]]
name = "svc"
endpoints = ["{flaky}", "{healthy}"]

[[routes]]
name = "r"
match_path = "/*"
target_service = "svc"

[[routes.middlewares]]
name = "circuitbreaker"
params = {{ min_requests = 4, error_ratio = 0.5, cooldown_ms = 1000, max_cooldown_ms = 2000 }}
"#
    )
}

#[tokio::test]
async fn test_traffic_converges_to_healthy_endpoint() {
    let failing = Arc::new(AtomicBool::new(true));
    let flaky_hits = Arc::new(AtomicU32::new(0));
    let flaky = flaky_backend(failing.clone(), flaky_hits.clone()).await;
    let healthy = common::start_mock_backend("healthy").await;

    let engine = common::engine_with(&config(flaky, healthy)).await;
    let gateway = common::start_gateway(engine.clone()).await;
    let client = common::client();

    for _ in 0..20 {
        client.get(gateway.url("/x")).send().await.unwrap();
    }
    let status = engine.status();
    let flaky_state = status
        .circuits
        .iter()
        .find(|c| c.target == flaky.to_string())
        .map(|c| c.state);
    assert_eq!(flaky_state, Some(CircuitState::Open));

    // While open, the failing endpoint is never contacted.
    let before = flaky_hits.load(Ordering::SeqCst);
    for _ in 0..10 {
        let response = client.get(gateway.url("/x")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "healthy");
    }
    assert_eq!(flaky_hits.load(Ordering::SeqCst), before);

    // Recovered endpoint is probed after the cooldown and rejoins rotation.
    failing.store(false, Ordering::SeqCst);
    let recovered = common::eventually(Duration::from_secs(5), || {
        let request = client.get(gateway.url("/x"));
        let engine = engine.clone();
        let target = flaky.to_string();
        async move {
            let _ = request.send().await;
            engine
                .status()
                .circuits
                .iter()
                .any(|c| c.target == target && c.state == CircuitState::Closed)
        }
    })
    .await;
    assert!(recovered);
}

#[tokio::test]
async fn test_all_endpoints_open_rejects_with_503() {
    let failing = Arc::new(AtomicBool::new(true));
    let hits = Arc::new(AtomicU32::new(0));
    let flaky = flaky_backend(failing.clone(), hits.clone()).await;

    let engine = common::engine_with(&format!(
        r#"
[[services]]
name = "svc"
endpoints = ["{flaky}"]

[[routes]]
match_path = "/*"
target_service = "svc"

[[routes.middlewares]]
name = "circuitbreaker"
params = {{ min_requests = 3, cooldown_ms = 60000, max_cooldown_ms = 60000 }}
"#
    ))
    .await;
    let gateway = common::start_gateway(engine).await;
    let client = common::client();

    for _ in 0..3 {
        let response = client.get(gateway.url("/x")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    let rejected = client.get(gateway.url("/x")).send().await.unwrap();
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_breaker_state_survives_reload() {
    let failing = Arc::new(AtomicBool::new(true));
    let hits = Arc::new(AtomicU32::new(0));
    let flaky = flaky_backend(failing.clone(), hits.clone()).await;
    let healthy = common::start_mock_backend("healthy").await;

    let toml = config(flaky, healthy);
    let engine = common::engine_with(&toml).await;
    let gateway = common::start_gateway(engine.clone()).await;
    let client = common::client();
    for _ in 0..20 {
        client.get(gateway.url("/x")).send().await.unwrap();
    }

    // Same route and params under a new digest: state is carried over.
    let reloaded = format!("version = \"2\"\n{}", toml);
    let (config, digest) = common::load(&reloaded);
    engine.update(&config, &digest).await.unwrap();

    let open = engine
        .status()
        .circuits
        .iter()
        .any(|c| c.target == flaky.to_string() && c.state == CircuitState::Open);
    assert!(open);
}

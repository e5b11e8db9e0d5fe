//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: testing if backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: error ratio >= threshold over the rolling window
//!                (and at least `min_requests` samples)
//! Open → Half-Open: first acquire after the cooldown
//! Half-Open → Closed: a probe succeeds
//! Half-Open → Open: a probe fails; cooldown grows with backoff
//! ```
//!
//! # Design Decisions
//! - Per-endpoint breakers by default, consulted during endpoint selection;
//!   `scope = "route"` puts one breaker in front of the whole route
//! - The state check is a single atomic load; the mutex only guards window
//!   updates and transitions, never a backend call
//! - Transitions re-check the state under the lock, so they are idempotent
//! - A permit dropped without an outcome counts as a failure

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::load_balancer::Backend;
use crate::middleware::{BuildContext, Middleware, RoundTrip, Transport};
use crate::observability::metrics;
use crate::proxy::error::{BuildError, ProxyError};
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::window::Window;
use crate::resilience::{classify, Outcome};

pub const NAME: &str = "circuitbreaker";

/// What one breaker protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    #[default]
    Endpoint,
    Route,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerParams {
    /// Failure ratio that opens the circuit.
    pub error_ratio: f64,
    /// Samples needed in the window before the ratio is trusted.
    pub min_requests: u64,
    pub window_ms: u64,
    pub buckets: usize,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub half_open_probes: u32,
    pub scope: BreakerScope,
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self {
            error_ratio: 0.5,
            min_requests: 10,
            window_ms: 10_000,
            buckets: 10,
            cooldown_ms: 5_000,
            max_cooldown_ms: 60_000,
            half_open_probes: 1,
            scope: BreakerScope::Endpoint,
        }
    }
}

impl BreakerParams {
    fn validate(&self) -> Result<(), String> {
        if !(self.error_ratio > 0.0 && self.error_ratio <= 1.0) {
            return Err(format!("error_ratio must be in (0, 1], got {}", self.error_ratio));
        }
        if self.window_ms == 0 || self.buckets == 0 {
            return Err("window_ms and buckets must be non-zero".to_string());
        }
        if self.half_open_probes == 0 {
            return Err("half_open_probes must be at least 1".to_string());
        }
        if self.max_cooldown_ms < self.cooldown_ms {
            return Err("max_cooldown_ms must not be below cooldown_ms".to_string());
        }
        Ok(())
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(val: u8) -> Self {
        match val {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u64,
    failures: u64,
}

#[derive(Debug)]
struct Inner {
    window: Window<Counts>,
    trips: u32,
}

/// Failure-aware gate for one backend (or one route).
#[derive(Debug)]
pub struct CircuitBreaker {
    route: String,
    target: String,
    params: BreakerParams,
    origin: Instant,
    state: AtomicU8,
    /// Milliseconds since `origin` after which an open circuit may probe.
    reopen_at: AtomicU64,
    probes: AtomicU32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(route: &str, target: &str, params: BreakerParams) -> Self {
        let window = Window::new(Duration::from_millis(params.window_ms), params.buckets);
        Self {
            route: route.to_string(),
            target: target.to_string(),
            params,
            origin: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            reopen_at: AtomicU64::new(0),
            probes: AtomicU32::new(0),
            inner: Mutex::new(Inner { window, trips: 0 }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    fn now_ms(&self) -> u64 {
        Instant::now().saturating_duration_since(self.origin).as_millis() as u64
    }

    /// Ask to send one request. Never blocks on I/O.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        match self.state() {
            CircuitState::Closed => Some(self.permit(false)),
            CircuitState::Open => {
                if self.now_ms() < self.reopen_at.load(Ordering::Acquire) {
                    return None;
                }
                self.half_open();
                self.try_probe()
            }
            CircuitState::HalfOpen => self.try_probe(),
        }
    }

    fn try_probe(self: &Arc<Self>) -> Option<BreakerPermit> {
        let limit = self.params.half_open_probes;
        self.probes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| self.permit(true))
    }

    fn permit(self: &Arc<Self>, probe: bool) -> BreakerPermit {
        BreakerPermit {
            breaker: self.clone(),
            probe,
            settled: false,
        }
    }

    fn half_open(&self) {
        let _inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.state() == CircuitState::Open {
            self.probes.store(0, Ordering::Release);
            self.set_state(CircuitState::HalfOpen);
            tracing::info!(route = %self.route, target = %self.target, "Circuit half-open, probing");
        }
    }

    fn on_outcome(&self, outcome: Outcome, probe: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match self.state() {
            CircuitState::Closed => {
                let now = Instant::now();
                let bucket = inner.window.current(now);
                bucket.requests += 1;
                if outcome == Outcome::Failure {
                    bucket.failures += 1;
                }

                let (requests, failures) = inner
                    .window
                    .buckets(now)
                    .fold((0, 0), |(r, f), c| (r + c.requests, f + c.failures));
                if requests >= self.params.min_requests
                    && failures as f64 / requests as f64 >= self.params.error_ratio
                {
                    tracing::warn!(
                        route = %self.route,
                        target = %self.target,
                        requests,
                        failures,
                        "Error ratio exceeded, opening circuit"
                    );
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen if probe => match outcome {
                Outcome::Success => {
                    inner.trips = 0;
                    inner.window.reset();
                    self.set_state(CircuitState::Closed);
                    tracing::info!(route = %self.route, target = %self.target, "Probe succeeded, circuit closed");
                }
                Outcome::Failure => {
                    tracing::warn!(route = %self.route, target = %self.target, "Probe failed, reopening circuit");
                    self.trip(&mut inner);
                }
            },
            // Late completions of requests admitted before the last transition.
            _ => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.trips = inner.trips.saturating_add(1);
        inner.window.reset();
        let cooldown = calculate_backoff(
            inner.trips,
            Duration::from_millis(self.params.cooldown_ms),
            Duration::from_millis(self.params.max_cooldown_ms),
        );
        self.reopen_at
            .store(self.now_ms() + cooldown.as_millis() as u64, Ordering::Release);
        self.probes.store(0, Ordering::Release);
        self.set_state(CircuitState::Open);
        tracing::info!(
            route = %self.route,
            target = %self.target,
            trips = inner.trips,
            cooldown_ms = cooldown.as_millis() as u64,
            "Circuit opened"
        );
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::Release);
        metrics::set_circuit_state(&self.route, &self.target, state);
    }

    fn release_probe(&self) {
        let _ = self
            .probes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Right to send one request through a breaker.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn record(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.on_outcome(outcome, self.probe);
    }

    /// Give the permit back without an outcome (request never reached the
    /// backend).
    pub fn release(mut self) {
        self.settled = true;
        if self.probe {
            self.breaker.release_probe();
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_outcome(Outcome::Failure, self.probe);
        }
    }
}

/// Breakers of one route, one per endpoint address.
#[derive(Debug)]
pub struct BreakerSet {
    route: String,
    params: BreakerParams,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    /// Member set the entries were last pruned against.
    synced: ArcSwapOption<Vec<Arc<Backend>>>,
}

impl BreakerSet {
    pub fn new(route: &str, params: BreakerParams) -> Self {
        Self {
            route: route.to_string(),
            params,
            breakers: DashMap::new(),
            synced: ArcSwapOption::empty(),
        }
    }

    /// Forget breakers of endpoints that left `members`.
    ///
    /// A no-op until the pool publishes a new member set. Permits already
    /// handed out keep their breaker alive until they settle.
    pub fn sync_members(&self, members: &Arc<Vec<Arc<Backend>>>) {
        if let Some(seen) = self.synced.load().as_ref() {
            if Arc::ptr_eq(seen, members) {
                return;
            }
        }
        let before = self.breakers.len();
        self.breakers
            .retain(|address, _| members.iter().any(|b| &b.address == address));
        let pruned = before.saturating_sub(self.breakers.len());
        if pruned > 0 {
            tracing::debug!(route = %self.route, pruned, "Dropped breakers of departed endpoints");
        }
        self.synced.store(Some(members.clone()));
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn get(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(endpoint) {
            return breaker.clone();
        }
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(&self.route, endpoint, self.params.clone()))
            })
            .clone()
    }

    /// `(endpoint, state)` for every endpoint seen so far.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<(String, CircuitState)> = self
            .breakers
            .iter()
            .map(|b| (b.key().clone(), b.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

/// Request extension asking the backend transport to gate endpoint selection.
#[derive(Debug, Clone)]
pub struct EndpointBreakers(pub Arc<BreakerSet>);

struct EndpointScoped {
    breakers: Arc<BreakerSet>,
}

struct EndpointScopedTransport {
    breakers: Arc<BreakerSet>,
    next: Transport,
}

impl Middleware for EndpointScoped {
    fn wrap(&self, next: Transport) -> Transport {
        Arc::new(EndpointScopedTransport {
            breakers: self.breakers.clone(),
            next,
        })
    }
}

#[async_trait]
impl RoundTrip for EndpointScopedTransport {
    async fn round_trip(&self, mut request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        request
            .extensions_mut()
            .insert(EndpointBreakers(self.breakers.clone()));
        self.next.round_trip(request).await
    }
}

struct RouteScoped {
    breaker: Arc<CircuitBreaker>,
}

struct RouteScopedTransport {
    breaker: Arc<CircuitBreaker>,
    next: Transport,
}

impl Middleware for RouteScoped {
    fn wrap(&self, next: Transport) -> Transport {
        Arc::new(RouteScopedTransport {
            breaker: self.breaker.clone(),
            next,
        })
    }
}

#[async_trait]
impl RoundTrip for RouteScopedTransport {
    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let Some(permit) = self.breaker.try_acquire() else {
            metrics::record_rejection(&self.breaker.route, "circuit_open");
            return Err(ProxyError::CircuitOpen(self.breaker.target.clone()));
        };

        let result = self.next.round_trip(request).await;
        match classify(&result) {
            Some(outcome) => permit.record(outcome),
            None => permit.release(),
        }
        result
    }
}

/// Which breakers of a route exist, for inspection.
#[derive(Debug)]
pub enum RouteBreakers {
    Endpoint(Arc<BreakerSet>),
    Route(Arc<CircuitBreaker>),
}

impl RouteBreakers {
    /// Drop endpoint breakers whose endpoint is no longer in `members`.
    pub fn sync_members(&self, members: &Arc<Vec<Arc<Backend>>>) {
        if let RouteBreakers::Endpoint(set) = self {
            set.sync_members(members);
        }
    }

    pub fn route(&self) -> &str {
        match self {
            RouteBreakers::Endpoint(set) => set.route(),
            RouteBreakers::Route(breaker) => &breaker.route,
        }
    }

    pub fn states(&self) -> Vec<(String, CircuitState)> {
        match self {
            RouteBreakers::Endpoint(set) => set.states(),
            RouteBreakers::Route(breaker) => vec![(breaker.target.clone(), breaker.state())],
        }
    }
}

pub fn factory(ctx: &BuildContext<'_>) -> Result<Arc<dyn Middleware>, BuildError> {
    let params: BreakerParams = ctx.params()?;
    params.validate().map_err(|reason| BuildError::InvalidParams {
        route: ctx.route().to_string(),
        middleware: ctx.name().to_string(),
        reason,
    })?;

    let route = ctx.route().to_string();
    let breakers = ctx.route_state(|| match params.scope {
        BreakerScope::Endpoint => RouteBreakers::Endpoint(Arc::new(BreakerSet::new(&route, params.clone()))),
        BreakerScope::Route => RouteBreakers::Route(Arc::new(CircuitBreaker::new(&route, &route, params.clone()))),
    });

    Ok(match &*breakers {
        RouteBreakers::Endpoint(set) => Arc::new(EndpointScoped {
            breakers: set.clone(),
        }),
        RouteBreakers::Route(breaker) => Arc::new(RouteScoped {
            breaker: breaker.clone(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    fn params() -> BreakerParams {
        BreakerParams {
            error_ratio: 0.5,
            min_requests: 4,
            window_ms: 1_000,
            buckets: 10,
            cooldown_ms: 1_000,
            max_cooldown_ms: 8_000,
            half_open_probes: 1,
            scope: BreakerScope::Endpoint,
        }
    }

    fn fail_n(breaker: &Arc<CircuitBreaker>, n: usize) {
        for _ in 0..n {
            breaker.try_acquire().unwrap().record(Outcome::Failure);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle() {
        let breaker = Arc::new(CircuitBreaker::new("r", "10.0.0.1:80", params()));

        // Below min_requests nothing happens.
        fail_n(&breaker, 3);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail_n(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());

        time::advance(Duration::from_millis(1_200)).await;
        let probe = breaker.try_acquire().expect("probe after cooldown");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one probe at a time.
        assert!(breaker.try_acquire().is_none());

        probe.record(Outcome::Success);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_longer_cooldown() {
        let breaker = Arc::new(CircuitBreaker::new("r", "10.0.0.1:80", params()));
        fail_n(&breaker, 4);

        time::advance(Duration::from_millis(1_200)).await;
        breaker.try_acquire().unwrap().record(Outcome::Failure);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Second trip waits ~2s.
        time::advance(Duration::from_millis(1_200)).await;
        assert!(breaker.try_acquire().is_none());
        time::advance(Duration::from_millis(1_100)).await;
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_counts_as_failure() {
        let breaker = Arc::new(CircuitBreaker::new("r", "10.0.0.1:80", params()));
        for _ in 0..4 {
            drop(breaker.try_acquire().unwrap());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        time::advance(Duration::from_millis(1_200)).await;
        let probe = breaker.try_acquire().unwrap();
        probe.release();
        // Probe slot handed back, state unchanged.
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_and_window() {
        let breaker = Arc::new(CircuitBreaker::new("r", "10.0.0.1:80", params()));
        for _ in 0..10 {
            breaker.try_acquire().unwrap().record(Outcome::Success);
        }
        fail_n(&breaker, 9);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Successes slide out of the window; failures alone trip it.
        time::advance(Duration::from_millis(1_100)).await;
        fail_n(&breaker, 4);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_trip_once() {
        let breaker = Arc::new(CircuitBreaker::new("r", "10.0.0.1:80", params()));
        let permits: Vec<_> = (0..50).map(|_| breaker.try_acquire().unwrap()).collect();
        let handles: Vec<_> = permits
            .into_iter()
            .map(|p| tokio::spawn(async move { p.record(Outcome::Failure) }))
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.inner.lock().unwrap().trips, 1);
    }

    #[test]
    fn test_breaker_set_per_endpoint() {
        let set = BreakerSet::new("r", params());
        let a = set.get("10.0.0.1:80");
        assert!(Arc::ptr_eq(&a, &set.get("10.0.0.1:80")));
        set.get("10.0.0.2:80");
        assert_eq!(set.states().len(), 2);
    }

    #[test]
    fn test_breaker_set_forgets_departed_endpoints() {
        let backend = |address: &str| Arc::new(Backend::new(address, 1, 16).unwrap());
        let set = BreakerSet::new("r", params());
        let members = Arc::new(vec![backend("10.0.0.1:80")]);
        set.sync_members(&members);

        for i in 0..100 {
            set.get(&format!("10.0.1.{}:80", i));
        }
        let kept = set.get("10.0.0.1:80");
        // Same member set as before: nothing to do yet.
        set.sync_members(&members);
        assert_eq!(set.len(), 101);

        let next = Arc::new(vec![backend("10.0.0.1:80"), backend("10.0.0.2:80")]);
        set.sync_members(&next);
        assert_eq!(set.len(), 1);
        assert!(Arc::ptr_eq(&kept, &set.get("10.0.0.1:80")));
        assert_eq!(set.states(), vec![("10.0.0.1:80".to_string(), CircuitState::Closed)]);
    }

    #[test]
    fn test_poisoned_lock_keeps_breaker_usable() {
        let breaker = Arc::new(CircuitBreaker::new("r", "10.0.0.1:80", params()));
        let poisoner = breaker.clone();
        let _ = std::thread::spawn(move || {
            let _held = poisoner.inner.lock().unwrap();
            panic!("poison the window lock");
        })
        .join();
        assert!(breaker.inner.is_poisoned());

        fail_n(&breaker, 4);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_params_validation() {
        assert!(BreakerParams::default().validate().is_ok());
        let bad = BreakerParams {
            error_ratio: 1.5,
            ..BreakerParams::default()
        };
        assert!(bad.validate().is_err());
    }
}

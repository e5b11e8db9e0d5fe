//! Adaptive concurrency limiter.
//!
//! Estimates how many requests the backend can hold at once from recent
//! history and sheds load above that estimate while the backend shows
//! latency inflation.
//!
//! ```text
//! max_inflight = ceil(max_pass_per_bucket * min_rt / bucket_width)
//! overloaded   = avg_rt(window) > min_rt * latency_tolerance
//! drop         = inflight > 1 && inflight > max_inflight
//!                && (overloaded || last drop within cooloff)
//! ```
//!
//! `max_pass` and `min_rt` only look at completed buckets. `allow` never
//! waits: it hands out a [`Permit`] or rejects on the spot.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::middleware::{BuildContext, Middleware, RoundTrip, Transport};
use crate::observability::metrics;
use crate::proxy::error::{BuildError, ProxyError};
use crate::resilience::window::Window;
use crate::resilience::{classify, Outcome};

pub const NAME: &str = "bbr";

/// Floor for the latency estimate, so sub-millisecond backends are not
/// judged overloaded by noise.
const MIN_RT_FLOOR_MS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterScope {
    #[default]
    Route,
    Global,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BbrParams {
    pub window_ms: u64,
    pub buckets: usize,
    /// Keep shedding this long after a drop even if latency recovered.
    pub cooloff_ms: u64,
    /// Average latency above `min_rt * latency_tolerance` means overloaded.
    pub latency_tolerance: f64,
    pub scope: LimiterScope,
}

impl Default for BbrParams {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            buckets: 100,
            cooloff_ms: 1_000,
            latency_tolerance: 2.0,
            scope: LimiterScope::Route,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Sample {
    /// Successful completions.
    pass: u64,
    /// Completions with a measured latency.
    completions: u64,
    rt_sum_us: u64,
}

/// Point-in-time view of the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BbrStats {
    pub inflight: i64,
    pub max_pass: u64,
    pub min_rt_ms: Option<f64>,
    pub avg_rt_ms: Option<f64>,
    pub max_inflight: Option<u64>,
    pub overloaded: bool,
}

#[derive(Debug)]
pub struct BbrLimiter {
    label: String,
    params: BbrParams,
    origin: Instant,
    inflight: AtomicI64,
    /// Milliseconds since `origin` of the last drop, plus one; zero = never.
    last_drop: AtomicU64,
    samples: Mutex<Window<Sample>>,
}

impl BbrLimiter {
    pub fn new(label: &str, params: BbrParams) -> Self {
        let window = Window::new(Duration::from_millis(params.window_ms), params.buckets);
        Self {
            label: label.to_string(),
            params,
            origin: Instant::now(),
            inflight: AtomicI64::new(0),
            last_drop: AtomicU64::new(0),
            samples: Mutex::new(window),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Acquire)
    }

    fn now_ms(&self) -> u64 {
        Instant::now().saturating_duration_since(self.origin).as_millis() as u64
    }

    pub fn stats(&self) -> BbrStats {
        let now = Instant::now();
        let samples = self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let bucket_ms = samples.bucket_width().as_secs_f64() * 1000.0;

        let mut max_pass = 0;
        let mut min_rt: Option<f64> = None;
        for s in samples.completed(now) {
            max_pass = max_pass.max(s.pass);
            if s.completions > 0 {
                let rt = s.rt_sum_us as f64 / s.completions as f64 / 1000.0;
                min_rt = Some(min_rt.map_or(rt, |m| m.min(rt)));
            }
        }

        let (completions, rt_sum_us) = samples
            .buckets(now)
            .fold((0u64, 0u64), |(c, r), s| (c + s.completions, r + s.rt_sum_us));
        let avg_rt = (completions > 0).then(|| rt_sum_us as f64 / completions as f64 / 1000.0);

        let min_rt = min_rt.map(|rt| rt.max(MIN_RT_FLOOR_MS));
        let max_inflight = match min_rt {
            Some(rt) if max_pass > 0 => Some(((max_pass as f64 * rt / bucket_ms).ceil() as u64).max(1)),
            _ => None,
        };
        let overloaded = match (avg_rt, min_rt) {
            (Some(avg), Some(min)) => avg > min * self.params.latency_tolerance,
            _ => false,
        };

        BbrStats {
            inflight: self.inflight(),
            max_pass,
            min_rt_ms: min_rt,
            avg_rt_ms: avg_rt,
            max_inflight,
            overloaded,
        }
    }

    fn should_drop(&self) -> bool {
        let inflight = self.inflight();
        if inflight <= 1 {
            return false;
        }
        let stats = self.stats();
        let Some(max_inflight) = stats.max_inflight else {
            return false;
        };
        if inflight as u64 <= max_inflight {
            return false;
        }
        if stats.overloaded {
            return true;
        }
        match self.last_drop.load(Ordering::Acquire) {
            0 => false,
            at => self.now_ms().saturating_sub(at - 1) < self.params.cooloff_ms,
        }
    }

    /// Admit one request or reject it without waiting.
    pub fn allow(self: &Arc<Self>) -> Result<Permit, ProxyError> {
        if self.should_drop() {
            self.last_drop.store(self.now_ms() + 1, Ordering::Release);
            return Err(ProxyError::RateLimited);
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        Ok(Permit {
            limiter: self.clone(),
            started: Instant::now(),
            settled: false,
        })
    }

    fn complete(&self, started: Instant, outcome: Option<Outcome>) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        let Some(outcome) = outcome else {
            return;
        };

        let now = Instant::now();
        let rt_us = now.saturating_duration_since(started).as_micros() as u64;
        let mut samples = self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let bucket = samples.current(now);
        bucket.completions += 1;
        bucket.rt_sum_us += rt_us;
        if outcome == Outcome::Success {
            bucket.pass += 1;
        }
    }
}

/// One admitted request. Reports back exactly once: through `done`,
/// `cancel`, or on drop (as a failure).
#[derive(Debug)]
pub struct Permit {
    limiter: Arc<BbrLimiter>,
    started: Instant,
    settled: bool,
}

impl Permit {
    pub fn done(mut self, outcome: Outcome) {
        self.settled = true;
        self.limiter.complete(self.started, Some(outcome));
    }

    /// The request never reached a backend; release without a sample.
    pub fn cancel(mut self) {
        self.settled = true;
        self.limiter.complete(self.started, None);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.complete(self.started, Some(Outcome::Failure));
        }
    }
}

struct Bbr {
    route: String,
    limiter: Arc<BbrLimiter>,
}

struct BbrTransport {
    route: String,
    limiter: Arc<BbrLimiter>,
    next: Transport,
}

impl Middleware for Bbr {
    fn wrap(&self, next: Transport) -> Transport {
        Arc::new(BbrTransport {
            route: self.route.clone(),
            limiter: self.limiter.clone(),
            next,
        })
    }
}

#[async_trait]
impl RoundTrip for BbrTransport {
    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let permit = match self.limiter.allow() {
            Ok(permit) => permit,
            Err(e) => {
                tracing::debug!(route = %self.route, inflight = self.limiter.inflight(), "Request shed by limiter");
                metrics::record_rejection(&self.route, e.kind());
                return Err(e);
            }
        };

        let result = self.next.round_trip(request).await;
        match classify(&result) {
            Some(outcome) => permit.done(outcome),
            None => permit.cancel(),
        }
        result
    }
}

pub fn factory(ctx: &BuildContext<'_>) -> Result<Arc<dyn Middleware>, BuildError> {
    let params: BbrParams = ctx.params()?;
    if params.window_ms == 0 || params.buckets == 0 || params.latency_tolerance < 1.0 {
        return Err(BuildError::InvalidParams {
            route: ctx.route().to_string(),
            middleware: ctx.name().to_string(),
            reason: "window_ms and buckets must be non-zero, latency_tolerance at least 1"
                .to_string(),
        });
    }

    let limiter = match params.scope {
        LimiterScope::Route => {
            let label = ctx.route().to_string();
            ctx.route_state(|| BbrLimiter::new(&label, params.clone()))
        }
        LimiterScope::Global => ctx.global_state(|| BbrLimiter::new("*", params.clone())),
    };

    Ok(Arc::new(Bbr {
        route: ctx.route().to_string(),
        limiter,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    fn params() -> BbrParams {
        BbrParams {
            window_ms: 1_000,
            buckets: 10,
            cooloff_ms: 500,
            latency_tolerance: 2.0,
            scope: LimiterScope::Route,
        }
    }

    /// `n` requests in one bucket, each taking `rt`.
    async fn fill_bucket(limiter: &Arc<BbrLimiter>, n: usize, rt: Duration) {
        let permits: Vec<Permit> = (0..n).map(|_| limiter.allow().unwrap()).collect();
        time::advance(rt).await;
        for permit in permits {
            permit.done(Outcome::Success);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_estimate_admits_everything() {
        let limiter = Arc::new(BbrLimiter::new("r", params()));
        let permits: Vec<Permit> = (0..500).map(|_| limiter.allow().unwrap()).collect();
        assert_eq!(limiter.inflight(), 500);
        drop(permits);
        assert_eq!(limiter.inflight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sheds_under_latency_inflation() {
        let limiter = Arc::new(BbrLimiter::new("r", params()));

        // Healthy bucket: 20 passes at 10ms. Then a slow one at 100ms.
        fill_bucket(&limiter, 20, Duration::from_millis(10)).await;
        time::advance(Duration::from_millis(90)).await;
        fill_bucket(&limiter, 20, Duration::from_millis(100)).await;
        time::advance(Duration::from_millis(5)).await;

        let stats = limiter.stats();
        assert_eq!(stats.max_pass, 20);
        assert_eq!(stats.min_rt_ms, Some(10.0));
        assert_eq!(stats.max_inflight, Some(2));
        assert!(stats.overloaded);

        let mut admitted = Vec::new();
        let rejected = loop {
            match limiter.allow() {
                Ok(permit) => admitted.push(permit),
                Err(e) => break e,
            }
            assert!(admitted.len() < 10, "limiter never shed");
        };
        assert_eq!(rejected, ProxyError::RateLimited);
        assert_eq!(admitted.len(), 3);

        // Completions bring inflight back under the estimate.
        for permit in admitted {
            permit.cancel();
        }
        assert_eq!(limiter.inflight(), 0);
        assert!(limiter.allow().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_latency_never_sheds() {
        let limiter = Arc::new(BbrLimiter::new("r", params()));
        fill_bucket(&limiter, 20, Duration::from_millis(10)).await;
        time::advance(Duration::from_millis(95)).await;

        let stats = limiter.stats();
        assert!(!stats.overloaded);
        let permits: Vec<Permit> = (0..50).map(|_| limiter.allow().unwrap()).collect();
        assert_eq!(permits.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_permit_settles_once() {
        let limiter = Arc::new(BbrLimiter::new("r", params()));
        let a = limiter.allow().unwrap();
        let b = limiter.allow().unwrap();
        let c = limiter.allow().unwrap();
        assert_eq!(limiter.inflight(), 3);

        a.done(Outcome::Success);
        b.cancel();
        drop(c);
        assert_eq!(limiter.inflight(), 0);

        // Cancelled work inside a timed-out future still settles.
        let guarded = limiter.clone();
        let work = async move {
            let _permit = guarded.allow().unwrap();
            time::sleep(Duration::from_secs(5)).await;
        };
        assert!(time::timeout(Duration::from_millis(10), work).await.is_err());
        assert_eq!(limiter.inflight(), 0);
    }
}

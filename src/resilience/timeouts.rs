//! Timeout enforcement.
//!
//! # Responsibilities
//! - Carry the per-request deadline through the chain as a request extension
//! - Cancel the wrapped work once the deadline passes
//!
//! # Design Decisions
//! - One absolute deadline per request, set by the engine from the route
//!   timeout; inner layers never extend it
//! - Timed-out requests return 504 Gateway Timeout

use std::future::Future;
use std::time::Duration;

use axum::http::Request;
use tokio::time::Instant;

use crate::proxy::error::ProxyError;

/// Absolute deadline of the request it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(pub Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub fn of<B>(request: &Request<B>) -> Option<Deadline> {
        request.extensions().get::<Deadline>().copied()
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

/// Run `work` until `deadline`; dropping it on expiry.
pub async fn within<F, T>(deadline: Option<Deadline>, work: F) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, ProxyError>>,
{
    match deadline {
        Some(Deadline(at)) => tokio::time::timeout_at(at, work)
            .await
            .unwrap_or(Err(ProxyError::Timeout)),
        None => work.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_within_deadline() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let fast = within(Some(deadline), async { Ok::<_, ProxyError>(1) }).await;
        assert_eq!(fast, Ok(1));

        let slow = within(Some(deadline), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, ProxyError>(2)
        })
        .await;
        assert_eq!(slow, Err(ProxyError::Timeout));
        assert!(deadline.expired());
    }

    #[test]
    fn test_extension_roundtrip() {
        let mut request = Request::new(());
        assert!(Deadline::of(&request).is_none());
        let deadline = Deadline(Instant::now());
        request.extensions_mut().insert(deadline);
        assert_eq!(Deadline::of(&request), Some(deadline));
    }
}

//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single endpoint of a service
//! - Track active requests (for Least Connections LB)
//! - Enforce the per-endpoint concurrency cap
//! - Track discovery health and draining state

use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::uri::{Authority, InvalidUri};

use crate::discovery::Endpoint;

/// A single backend endpoint.
#[derive(Debug)]
pub struct Backend {
    /// `host:port` as announced by discovery.
    pub address: String,
    /// Pre-parsed authority for building upstream URIs.
    pub authority: Authority,
    /// Maximum concurrent requests allowed.
    pub max_connections: usize,
    /// Number of currently active requests.
    pub active_connections: AtomicUsize,

    weight: AtomicU32,
    healthy: AtomicBool,
    draining: AtomicBool,
}

impl Backend {
    /// Create a new backend.
    pub fn new(address: &str, weight: u32, max_connections: usize) -> Result<Self, InvalidUri> {
        let authority = Authority::from_str(address)?;
        Ok(Self {
            address: address.to_string(),
            authority,
            max_connections,
            active_connections: AtomicUsize::new(0),
            weight: AtomicU32::new(weight),
            healthy: AtomicBool::new(true),
            draining: AtomicBool::new(false),
        })
    }

    /// Build a backend from a discovered endpoint.
    pub fn from_endpoint(endpoint: &Endpoint, max_connections: usize) -> Result<Self, InvalidUri> {
        let backend = Self::new(&endpoint.address, endpoint.weight, max_connections)?;
        backend.healthy.store(endpoint.healthy, Ordering::Relaxed);
        Ok(backend)
    }

    /// Refresh discovery-owned attributes and take the backend out of draining.
    pub fn refresh(&self, endpoint: &Endpoint) {
        self.weight.store(endpoint.weight, Ordering::Relaxed);
        self.healthy.store(endpoint.healthy, Ordering::Relaxed);
        self.draining.store(false, Ordering::Relaxed);
    }

    /// Get the current number of active requests.
    pub fn active(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// Stop new selections; in-flight requests keep their guards.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Healthy, not draining and below its concurrency cap.
    pub fn is_available(&self) -> bool {
        self.is_healthy() && !self.is_draining() && self.active() < self.max_connections
    }

    /// Try to create a connection guard that increments count.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<BackendConnectionGuard> {
        let mut prev = self.active_connections.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_connections {
                return None;
            }
            match self.active_connections.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(BackendConnectionGuard {
            backend: self.clone(),
        })
    }
}

/// A RAII guard that manages the active request count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    pub backend: Arc<Backend>,
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

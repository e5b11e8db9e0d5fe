//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate through backends.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn pick(
        &self,
        backends: &[Arc<Backend>],
        admit: &mut dyn FnMut(&Arc<Backend>) -> bool,
    ) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        // Rejected candidates are skipped; at most one lap.
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = backends.len();
        (0..len)
            .map(|i| &backends[(start + i) % len])
            .find(|b| admit(b))
            .cloned()
    }
}

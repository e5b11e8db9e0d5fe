//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Least connections selector.
/// Tries backends in ascending order of active requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn pick(
        &self,
        backends: &[Arc<Backend>],
        admit: &mut dyn FnMut(&Arc<Backend>) -> bool,
    ) -> Option<Arc<Backend>> {
        let mut order: Vec<&Arc<Backend>> = backends.iter().collect();
        // Stable: ties go to the earlier member.
        order.sort_by_key(|b| b.active());
        order.into_iter().find(|b| admit(b)).cloned()
    }
}

//! Weighted random load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Picks backends at random in proportion to their weight.
///
/// Rejected candidates are removed and the draw repeated, so every
/// admissible backend is reachable. Zero-weight backends are never picked.
#[derive(Debug, Default)]
pub struct Weighted;

impl Weighted {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for Weighted {
    fn pick(
        &self,
        backends: &[Arc<Backend>],
        admit: &mut dyn FnMut(&Arc<Backend>) -> bool,
    ) -> Option<Arc<Backend>> {
        let mut candidates: Vec<(&Arc<Backend>, u64)> = backends
            .iter()
            .map(|b| (b, u64::from(b.weight())))
            .filter(|(_, w)| *w > 0)
            .collect();

        while !candidates.is_empty() {
            let total: u64 = candidates.iter().map(|(_, w)| w).sum();
            let mut point = fastrand::u64(0..total);
            let index = candidates
                .iter()
                .position(|(_, w)| {
                    if point < *w {
                        true
                    } else {
                        point -= w;
                        false
                    }
                })
                .unwrap_or(candidates.len() - 1);

            let (backend, _) = candidates.swap_remove(index);
            if admit(backend) {
                return Some(backend.clone());
            }
        }
        None
    }
}

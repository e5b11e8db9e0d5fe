//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → target service identified
//!     → pool.rs (ClientFactory memoizes one ClientPool per service)
//!     → ClientPool member set (copy-on-update from discovery)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through backends)
//!         - least_conn.rs (pick backend with fewest active requests)
//!         - weighted.rs (weighted random)
//!     → backend.rs (guard on the backend's active request count)
//! ```
//!
//! # Design Decisions
//! - Balancers are stateless apart from their own cursor; the pool owns members
//! - Candidates go through an admission filter, so breakers and connection caps
//!   are honoured without the balancer knowing about them
//! - Removed backends drain: no new picks, in-flight guards stay valid

pub mod backend;
pub mod least_conn;
pub mod pool;
pub mod round_robin;
pub mod weighted;

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::LoadBalancePolicy;

pub use backend::{Backend, BackendConnectionGuard};
pub use pool::{ClientFactory, ClientPool, HttpClient};

/// Selects one backend per outbound call.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Return the first candidate, in policy order, that `admit` accepts.
    ///
    /// `admit` may reserve resources for the candidate; a candidate it accepts
    /// must be the one returned.
    fn pick(
        &self,
        backends: &[Arc<Backend>],
        admit: &mut dyn FnMut(&Arc<Backend>) -> bool,
    ) -> Option<Arc<Backend>>;
}

/// Balancer implementing `policy`.
pub fn balancer_for(policy: LoadBalancePolicy) -> Box<dyn LoadBalancer> {
    match policy {
        LoadBalancePolicy::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        LoadBalancePolicy::LeastConn => Box::new(least_conn::LeastConnections::new()),
        LoadBalancePolicy::Weighted => Box::new(weighted::Weighted::new()),
    }
}

//! Proxy core.
//!
//! # Data Flow
//! ```text
//! GatewayConfig
//!     → snapshot.rs (validate, build pools, compile chains, freeze router)
//!     → engine.rs (atomic swap, release unused shared state)
//!
//! Request
//!     → engine.rs (load snapshot, match route, set deadline)
//!     → route chain (middlewares, first declared outermost)
//!     → transport.rs (pick endpoint, forward)
//! ```

pub mod engine;
pub mod error;
pub mod snapshot;
pub mod state;
pub mod transport;

pub use engine::{EngineStatus, ProxyEngine};
pub use error::{BuildError, ProxyError};
pub use snapshot::{CompiledRoute, Snapshot, SnapshotCompiler};
pub use state::StateArena;

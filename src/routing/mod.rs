//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → router.rs (route lookup)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: matched Route or NoMatch
//!
//! Route Compilation (per snapshot):
//!     RouteConfig[]
//!     → Parse matchers
//!     → Sort by specificity (stable: config order breaks ties)
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Routes compiled per snapshot, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route
//! - Most specific match wins

pub mod matcher;
pub mod router;

pub use matcher::{normalize_host, RouteMatcher};
pub use router::Router;

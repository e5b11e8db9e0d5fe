//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config source (file / memory)
//!     → source.rs (fetch raw bytes)
//!     → loader.rs (digest, parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!
//! On change:
//!     watcher.rs detects a new digest
//!     → handlers compile a new snapshot off to the side
//!     → atomic swap, then the digest is committed
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - The digest is not advanced unless every handler accepts the document

pub mod loader;
pub mod schema;
pub mod source;
pub mod validation;
pub mod watcher;

pub use loader::ConfigError;
pub use schema::{
    EndpointConfig, GatewayConfig, ListenerConfig, LoadBalancePolicy, MiddlewareConfig,
    ObservabilityConfig, ReloadConfig, RouteConfig, ServiceConfig,
};
pub use source::{ConfigSource, FileSource, MemorySource};
pub use watcher::{ConfigHandler, ConfigWatcher, ReloadError, ReloadOutcome};

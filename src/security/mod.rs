//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Request through a route chain:
//!     → auth.rs (credential from header → TokenVerifier → 403 or pass)
//!     → authenticated principal attached as a request extension
//! ```
//!
//! # Design Decisions
//! - Fail closed: missing or rejected credentials never reach a backend
//! - Verification is pluggable; the built-in verifier is a token table

pub mod auth;

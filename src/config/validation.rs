//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing services)
//! - Validate value ranges (timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::str::FromStr;

use axum::http::uri::Authority;
use url::Url;

use crate::config::schema::GatewayConfig;

/// A single semantic problem in a configuration document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("service `{0}` is declared more than once")]
    DuplicateService(String),

    #[error("service `{0}` must set exactly one of `discovery_dsn` or `endpoints`")]
    AmbiguousEndpoints(String),

    #[error("service `{service}` has invalid endpoint address `{address}`")]
    InvalidEndpoint { service: String, address: String },

    #[error("service `{service}` has invalid discovery DSN `{dsn}`: {reason}")]
    InvalidDsn {
        service: String,
        dsn: String,
        reason: String,
    },

    #[error("route `{0}` is declared more than once; give overlapping routes distinct names")]
    DuplicateRoute(String),

    #[error("route `{route}` targets unknown service `{service}`")]
    UnknownService { route: String, service: String },

    #[error("route `{route}` path `{path}` must start with `/`")]
    InvalidPath { route: String, path: String },

    #[error("route `{0}` must have a non-zero timeout")]
    ZeroTimeout(String),

    #[error("route `{0}` has a middleware with an empty name")]
    EmptyMiddlewareName(String),
}

/// Validate a parsed configuration, collecting every violation.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for service in &config.services {
        if service.name.is_empty() {
            errors.push(ValidationError::EmptyServiceName);
        } else if !seen.insert(service.name.as_str()) {
            errors.push(ValidationError::DuplicateService(service.name.clone()));
        }

        match (&service.discovery_dsn, service.endpoints.is_empty()) {
            (Some(dsn), true) => {
                if let Err(e) = Url::parse(dsn) {
                    errors.push(ValidationError::InvalidDsn {
                        service: service.name.clone(),
                        dsn: dsn.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            (None, false) => {
                for endpoint in &service.endpoints {
                    if Authority::from_str(endpoint.address()).is_err() {
                        errors.push(ValidationError::InvalidEndpoint {
                            service: service.name.clone(),
                            address: endpoint.address().to_string(),
                        });
                    }
                }
            }
            _ => errors.push(ValidationError::AmbiguousEndpoints(service.name.clone())),
        }
    }

    let mut route_keys = HashSet::new();
    for route in &config.routes {
        let key = route.key();
        if !route_keys.insert(key.clone()) {
            errors.push(ValidationError::DuplicateRoute(key.clone()));
        }
        if !seen.contains(route.target_service.as_str()) {
            errors.push(ValidationError::UnknownService {
                route: key.clone(),
                service: route.target_service.clone(),
            });
        }
        if !route.match_path.starts_with('/') {
            errors.push(ValidationError::InvalidPath {
                route: key.clone(),
                path: route.match_path.clone(),
            });
        }
        if route.timeout_ms == 0 {
            errors.push(ValidationError::ZeroTimeout(key.clone()));
        }
        if route.middlewares.iter().any(|m| m.name.is_empty()) {
            errors.push(ValidationError::EmptyMiddlewareName(key));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

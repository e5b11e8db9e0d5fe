//! Configuration loading: raw bytes → digest + validated `GatewayConfig`.

use sha2::{Digest, Sha256};

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("config source error: {0}")]
    Source(String),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Lowercase hex SHA-256 of the raw document.
///
/// The digest is computed over the literal bytes, so formatting-only edits
/// are reported as changes.
pub fn digest(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

/// Parse and validate a TOML configuration document.
pub fn parse_config(raw: &[u8]) -> Result<GatewayConfig, ConfigError> {
    let content = std::str::from_utf8(raw)?;
    let config: GatewayConfig = toml::from_str(content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

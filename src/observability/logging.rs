//! Structured logging setup.
//!
//! `RUST_LOG` wins over the configured level so operators can raise
//! verbosity without editing the config file.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor the config sets a level.
pub const DEFAULT_FILTER: &str = "api_gateway=info,tower_http=info";

/// Build the filter for `level`: a bare level applies to this crate and
/// tower-http, anything else is taken as a full filter directive.
pub fn filter_for(level: &str) -> EnvFilter {
    let level = level.trim();
    if level.is_empty() {
        return EnvFilter::new(DEFAULT_FILTER);
    }
    let directive = if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("api_gateway={level},tower_http={level}")
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("invalid log level `{}` ({}), using `{}`", level, e, DEFAULT_FILTER);
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(level: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_for_level() {
        assert_eq!(filter_for("debug").to_string(), "api_gateway=debug,tower_http=debug");
        assert_eq!(filter_for("hyper=warn").to_string(), "hyper=warn");
        assert_eq!(filter_for("").to_string(), DEFAULT_FILTER);
        assert_eq!(filter_for("not a level").to_string(), DEFAULT_FILTER);
    }
}

//! Startup orchestration.
//!
//! Order: initial config load, logging at the configured level, metrics
//! exporter, engine build, config watcher, listener. Any failure before the
//! listener is up is fatal.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::util::TryInitError;

use crate::config::loader::{digest, parse_config};
use crate::config::{ConfigError, ConfigSource, ConfigWatcher, FileSource, GatewayConfig};
use crate::http::HttpServer;
use crate::lifecycle::{signals, Shutdown};
use crate::observability::{logging, metrics};
use crate::proxy::{BuildError, ProxyEngine};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build the initial snapshot: {0}")]
    Build(#[from] BuildError),

    #[error("failed to install logging: {0}")]
    Logging(#[from] TryInitError),

    #[error("invalid metrics address `{address}`: {source}")]
    MetricsAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to install metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Fetch, digest and validate the document at `source`.
pub async fn load_initial(source: &dyn ConfigSource) -> Result<(GatewayConfig, String), ConfigError> {
    let raw = source.fetch().await?;
    let digest = digest(&raw);
    let config = parse_config(&raw)?;
    Ok((config, digest))
}

/// Load `path` and compile it without serving; used by `--check`.
pub async fn check(path: &Path) -> Result<GatewayConfig, StartupError> {
    let (config, digest) = load_initial(&FileSource::new(path)).await?;
    ProxyEngine::with_builtins().update(&config, &digest).await?;
    Ok(config)
}

/// Run the gateway from the config file at `path` until a shutdown signal.
pub async fn run(path: &Path) -> Result<(), StartupError> {
    let source = Arc::new(FileSource::new(path));
    let (config, digest) = match load_initial(source.as_ref()).await {
        Ok(loaded) => loaded,
        Err(e) => {
            let _ = logging::init_logging("");
            return Err(e.into());
        }
    };

    logging::init_logging(&config.observability.log_level)?;
    tracing::info!(
        name = %config.name,
        version = %config.version,
        digest = %digest,
        routes = config.routes.len(),
        services = config.services.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let address = &config.observability.metrics_address;
        let addr: SocketAddr = address.parse().map_err(|source| StartupError::MetricsAddress {
            address: address.clone(),
            source,
        })?;
        metrics::init_metrics(addr)?;
    }

    let engine = Arc::new(ProxyEngine::with_builtins());
    engine.update(&config, &digest).await?;

    let shutdown = Shutdown::new();
    signals::spawn_shutdown_handler(shutdown.clone());

    let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
    let _file_events = match source.watch_events(nudge_tx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "File events unavailable, relying on polling");
            None
        }
    };
    signals::spawn_reload_handler(nudge_tx, &shutdown);

    let interval = Duration::from_secs(config.reload.poll_interval_secs.max(1));
    let mut watcher = ConfigWatcher::new(source, interval).with_trigger(nudge_rx);
    watcher.commit(digest);
    watcher.watch(engine.clone());
    let watcher_task = tokio::spawn(watcher.run(shutdown.subscribe()));

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let served = HttpServer::new(engine, &config.listener)
        .run(listener, shutdown.subscribe())
        .await;

    shutdown.trigger();
    if let Err(e) = watcher_task.await {
        tracing::error!(error = %e, "Config watcher task failed");
    }
    served?;

    tracing::info!("Shutdown complete");
    Ok(())
}

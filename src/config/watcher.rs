//! Configuration change detection for hot reload.
//!
//! The watcher polls its source, compares the SHA-256 digest of the raw
//! document with the last committed one and, on change, hands the parsed
//! config to every registered handler. The digest only advances once all
//! handlers accepted the new config, so a rejected document is retried on the
//! next poll instead of being silently skipped.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};

use crate::config::loader::{digest, parse_config, ConfigError};
use crate::config::schema::GatewayConfig;
use crate::config::source::ConfigSource;
use crate::observability::metrics;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every newly detected configuration.
#[async_trait]
pub trait ConfigHandler: Send + Sync {
    async fn on_change(&self, config: &GatewayConfig, digest: &str) -> Result<(), BoxError>;
}

/// Why a reload attempt did not commit.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{failed} of {total} change handlers rejected config {digest}: {reason}")]
    Handler {
        digest: String,
        failed: usize,
        total: usize,
        reason: String,
    },
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Unchanged,
    Applied { digest: String },
}

/// Shared, lock-free view of the committed digest.
pub type DigestHandle = Arc<ArcSwapOption<String>>;

/// Polls a config source and dispatches changes to handlers.
pub struct ConfigWatcher {
    source: Arc<dyn ConfigSource>,
    interval: Duration,
    digest: DigestHandle,
    handlers: Vec<Arc<dyn ConfigHandler>>,
    trigger: Option<mpsc::UnboundedReceiver<()>>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher polling `source` every `interval`.
    pub fn new(source: Arc<dyn ConfigSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            digest: Arc::new(ArcSwapOption::empty()),
            handlers: Vec::new(),
            trigger: None,
        }
    }

    /// Also re-check whenever `trigger` yields (e.g. file system events).
    pub fn with_trigger(mut self, trigger: mpsc::UnboundedReceiver<()>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Load, digest and validate the current document without committing it.
    pub async fn load(&self) -> Result<(GatewayConfig, String), ConfigError> {
        tracing::info!(source = %self.source.describe(), "Loading configuration");
        let raw = self.source.fetch().await?;
        let digest = digest(&raw);
        let config = parse_config(&raw)?;
        Ok((config, digest))
    }

    /// Register a change handler.
    pub fn watch(&mut self, handler: Arc<dyn ConfigHandler>) {
        self.handlers.push(handler);
        tracing::debug!(handlers = self.handlers.len(), "Config change handler added");
    }

    /// Record `digest` as applied.
    pub fn commit(&self, digest: String) {
        self.digest.store(Some(Arc::new(digest)));
    }

    /// The last committed digest.
    pub fn digest(&self) -> Option<Arc<String>> {
        self.digest.load_full()
    }

    /// A handle that keeps reporting the committed digest after `run` takes
    /// ownership of the watcher.
    pub fn digest_handle(&self) -> DigestHandle {
        self.digest.clone()
    }

    /// Check the source once and apply the document if its digest changed.
    pub async fn check(&self) -> Result<ReloadOutcome, ReloadError> {
        let raw = self.source.fetch().await?;
        let new_digest = digest(&raw);
        let last = self.digest.load_full();

        if last.as_deref() == Some(&new_digest) {
            return Ok(ReloadOutcome::Unchanged);
        }

        tracing::info!(
            last = last.as_deref().map(String::as_str).unwrap_or("none"),
            new = %new_digest,
            "Config changed, reloading"
        );

        let config = match parse_config(&raw) {
            Ok(config) => config,
            Err(e) => {
                metrics::record_reload("invalid");
                return Err(e.into());
            }
        };

        let mut failed = 0;
        let mut reason = String::new();
        for (index, handler) in self.handlers.iter().enumerate() {
            if let Err(e) = handler.on_change(&config, &new_digest).await {
                tracing::error!(handler = index, digest = %new_digest, error = %e, "Config change handler failed");
                if failed == 0 {
                    reason = e.to_string();
                }
                failed += 1;
            }
        }

        if failed > 0 {
            metrics::record_reload("rejected");
            return Err(ReloadError::Handler {
                digest: new_digest,
                failed,
                total: self.handlers.len(),
                reason,
            });
        }

        self.commit(new_digest.clone());
        metrics::record_reload("applied");
        Ok(ReloadOutcome::Applied { digest: new_digest })
    }

    /// Run the poll loop until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            source = %self.source.describe(),
            interval = ?self.interval,
            "Config watcher started"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial load already happened.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = next_nudge(&mut self.trigger) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Config watcher received shutdown signal, exiting loop");
                    break;
                }
            }

            match self.check().await {
                Ok(ReloadOutcome::Unchanged) => {}
                Ok(ReloadOutcome::Applied { digest }) => {
                    tracing::info!(digest = %digest, "Config reloaded");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Config reload failed; keeping current configuration");
                }
            }
        }
    }
}

async fn next_nudge(trigger: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match trigger {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

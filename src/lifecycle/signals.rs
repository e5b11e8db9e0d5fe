//! OS signal handling.
//!
//! - SIGINT/SIGTERM trigger graceful shutdown
//! - SIGHUP nudges the config watcher into an immediate re-check

use tokio::sync::mpsc;

use crate::lifecycle::Shutdown;

/// Resolve on the first SIGINT or SIGTERM.
pub async fn terminate() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received"),
        _ = sigterm => tracing::info!("SIGTERM received"),
    }
}

/// Trigger `shutdown` on the first termination signal.
pub fn spawn_shutdown_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        terminate().await;
        shutdown.trigger();
    });
}

/// Forward SIGHUP to `reload` until `shutdown` fires.
#[cfg(unix)]
pub fn spawn_reload_handler(reload: mpsc::UnboundedSender<()>, shutdown: &Shutdown) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut stop = shutdown.subscribe();
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGHUP handler; reload on signal disabled");
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = hangup.recv() => {
                    tracing::info!("SIGHUP received, re-checking configuration");
                    if reload.send(()).is_err() {
                        break;
                    }
                }
                _ = stop.recv() => break,
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_handler(_reload: mpsc::UnboundedSender<()>, _shutdown: &Shutdown) {}

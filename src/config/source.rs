//! Configuration sources.
//!
//! A source only hands back raw bytes; digesting, parsing and validation
//! happen in the watcher so every source gets identical change detection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::ConfigError;

/// Where configuration documents come from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the current raw document.
    async fn fetch(&self) -> Result<Vec<u8>, ConfigError>;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// A TOML file on local disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe to filesystem events for the file.
    ///
    /// Each modify/create event sends a nudge on `tx` so the watcher re-checks
    /// the digest without waiting for its next poll. The returned watcher must
    /// be kept alive for events to flow.
    pub fn watch_events(
        &self,
        tx: mpsc::UnboundedSender<()>,
    ) -> Result<RecommendedWatcher, notify::Error> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::debug!("Config file change detected");
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config file watch error"),
            },
            Config::default(),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, "Config file watcher started");
        Ok(watcher)
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    async fn fetch(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(tokio::fs::read(&self.path).await?)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// An in-process document that can be replaced at runtime.
#[derive(Debug)]
pub struct MemorySource {
    content: ArcSwap<Vec<u8>>,
}

impl MemorySource {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: ArcSwap::from_pointee(content.into()),
        }
    }

    /// Replace the document; picked up on the watcher's next check.
    pub fn set(&self, content: impl Into<Vec<u8>>) {
        self.content.store(Arc::new(content.into()));
    }
}

#[async_trait]
impl ConfigSource for MemorySource {
    async fn fetch(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(self.content.load().as_ref().clone())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_replace() {
        let source = MemorySource::new("a");
        assert_eq!(source.fetch().await.unwrap(), b"a");
        source.set("b");
        assert_eq!(source.fetch().await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_file_source_missing() {
        let source = FileSource::new("/nonexistent/gateway.toml");
        assert!(matches!(source.fetch().await, Err(ConfigError::Io(_))));
        assert_eq!(source.describe(), "file:/nonexistent/gateway.toml");
    }
}

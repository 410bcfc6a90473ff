//! Configuration file watcher for hot reload.
//!
//! Reloads are validated before they are published; a broken edit keeps the
//! running configuration and logs why.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::GatewayConfig;

/// Outcome of one reload attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    Published,
    Rejected,
    ReceiverGone,
}

/// Monitors a configuration file and publishes validated reloads.
pub struct ConfigWatcher {
    path: PathBuf,
    updates: mpsc::UnboundedSender<GatewayConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiver the server consumes reloads from.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                updates,
            },
            rx,
        )
    }

    /// Load the file once and publish it if it validates.
    pub fn reload(&self) -> ReloadOutcome {
        match load_config(&self.path) {
            Ok(config) => {
                tracing::info!(path = ?self.path, routes = config.routes.len(), "Configuration reloaded");
                if self.updates.send(config).is_err() {
                    tracing::debug!("Config receiver dropped, ignoring reload");
                    return ReloadOutcome::ReceiverGone;
                }
                ReloadOutcome::Published
            }
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Rejected config reload, keeping current configuration");
                ReloadOutcome::Rejected
            }
        }
    }

    /// Start watching on notify's background thread. Keep the returned
    /// watcher alive for as long as reloads should happen.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                    self.reload();
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("gateway-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn valid_file_is_published() {
        let path = temp_config(
            r#"
            [[routes]]
            name = "r"
            path = "/a/{id}"
            downstream = "http://127.0.0.1:1"
            downstream_path = "/b/{id}"
            "#,
        );
        let (watcher, mut rx) = ConfigWatcher::new(&path);
        assert_eq!(watcher.reload(), ReloadOutcome::Published);
        assert_eq!(rx.try_recv().unwrap().routes[0].name, "r");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn invalid_file_is_rejected() {
        let path = temp_config("[timeouts]\nconnect_ms = 0\n");
        let (watcher, mut rx) = ConfigWatcher::new(&path);
        assert_eq!(watcher.reload(), ReloadOutcome::Rejected);
        assert!(rx.try_recv().is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn dropped_receiver_is_reported() {
        let path = temp_config("");
        let (watcher, rx) = ConfigWatcher::new(&path);
        drop(rx);
        assert_eq!(watcher.reload(), ReloadOutcome::ReceiverGone);
        std::fs::remove_file(path).ok();
    }
}

//! Debounced config-file watcher driving hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::diff::{diff_configs, ConfigDiff};
use super::BridgeConfig;
use crate::error::{BridgeError, Result};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// A successful reload: the validated new config and its diff from the
/// previously accepted one.
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    pub config: BridgeConfig,
    pub diff: ConfigDiff,
}

pub type ReloadListener =
    Arc<dyn Fn(ReloadEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Watches the directory containing the config file and re-loads on change.
///
/// The directory (not the file) is watched because editors and atomic-rename
/// writers replace the inode; events are filtered back down to the file name.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn start(
        path: PathBuf,
        initial: BridgeConfig,
        listener: ReloadListener,
    ) -> Result<Self> {
        Self::start_with_debounce(path, DEFAULT_DEBOUNCE, initial, listener)
    }

    pub fn start_with_debounce(
        path: PathBuf,
        debounce: Duration,
        initial: BridgeConfig,
        listener: ReloadListener,
    ) -> Result<Self> {
        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| {
                BridgeError::Configuration(format!("config path {} has no file name", path.display()))
            })?
            .to_owned();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                let Ok(event) = result else { return };
                let matches = event
                    .paths
                    .iter()
                    .any(|event_path| event_path.file_name() == Some(file_name.as_os_str()));
                if matches {
                    let _ = event_tx.send(());
                }
            })
            .map_err(|e| BridgeError::Configuration(format!("cannot create watcher: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                BridgeError::Configuration(format!("cannot watch {}: {e}", dir.display()))
            })?;

        let task = spawn_reload_loop(event_rx, path, debounce, initial, listener);
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The reload loop proper, separated from the filesystem watcher so tests can
/// feed synthetic events.
fn spawn_reload_loop(
    mut events: mpsc::UnboundedReceiver<()>,
    path: PathBuf,
    debounce: Duration,
    initial: BridgeConfig,
    listener: ReloadListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_json = initial.stable_json();
        let mut last_config = initial;

        loop {
            if events.recv().await.is_none() {
                return;
            }
            // Coalesce the burst: keep draining until the window stays quiet.
            loop {
                match tokio::time::timeout(debounce, events.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            let new_config = match BridgeConfig::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "config reload skipped");
                    continue;
                }
            };

            let new_json = new_config.stable_json();
            if new_json == last_json {
                tracing::debug!(path = %path.display(), "config unchanged after reload");
                continue;
            }

            let diff = diff_configs(&last_config, &new_config);
            tracing::info!(
                added = diff.servers.added.len(),
                removed = diff.servers.removed.len(),
                reconnect = diff.servers.reconnect.len(),
                updated = diff.servers.updated.len(),
                "configuration changed on disk"
            );
            let event = ReloadEvent {
                config: new_config.clone(),
                diff,
            };
            if let Err(e) = listener(event).await {
                tracing::warn!(error = %e, "reload listener failed");
            }
            last_json = new_json;
            last_config = new_config;
        }
    })
}

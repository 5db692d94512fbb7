//! Config file watching with debounced reload.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::AppConfig;

/// Minimum gap between two reloads. Editors fire bursts of write events for a
/// single save.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches a config file and invokes `on_reload` with each successfully
/// re-parsed [`AppConfig`]. Dropping the watcher stops the background thread.
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    pub fn spawn(
        path: impl AsRef<Path>,
        on_reload: impl Fn(AppConfig) + Send + 'static,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = notify::recommended_watcher(tx)?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching config file {}", path.display()))?;

        let reload_path = path.clone();
        std::thread::spawn(move || {
            let mut last_reload = Instant::now() - DEBOUNCE;
            while let Ok(event) = rx.recv() {
                let Ok(event) = event else { continue };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                if last_reload.elapsed() < DEBOUNCE {
                    continue;
                }
                last_reload = Instant::now();

                match AppConfig::load_from(&reload_path) {
                    Ok(config) => {
                        info!(path = %reload_path.display(), "config reloaded");
                        on_reload(config);
                    }
                    Err(err) => {
                        // Keep the running config; a half-saved file should
                        // not take the bot down.
                        warn!(%err, path = %reload_path.display(), "config reload failed, keeping previous");
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

//! Config file watcher feeding retry-policy reloads.
//!
//! Editors and `fs::write` truncate before writing, so a change event can
//! observe an empty or half-written file. Such reads are dropped: the file
//! must be non-empty and read the same twice, `SETTLE` apart, before it is
//! parsed. Configs equal to the last one forwarded are not sent again.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::parse_config;
use crate::config::schema::StoreConfig;

/// Gap between the two reads that must agree.
const SETTLE: Duration = Duration::from_millis(50);

/// Watches one config file and sends each new validated `StoreConfig`.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<StoreConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiving end of its updates, suitable
    /// for `ContextFactory::follow`.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<StoreConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. Updates stop, and the channel closes, when the
    /// returned handle is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, update_tx } = self;
        let mut last = fs::read_to_string(&path)
            .ok()
            .and_then(|content| parse_config(&content).ok());
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "Config watch error");
                        return;
                    }
                };
                if !concerns(&event, &watched) {
                    return;
                }
                let Some(config) = stable_config(&watched) else {
                    return;
                };
                if last.as_ref() == Some(&config) {
                    return;
                }
                tracing::info!(
                    path = ?watched,
                    strategy = %config.retries.strategy,
                    max_attempts = config.retries.max_attempts,
                    "Config file changed"
                );
                last = Some(config.clone());
                let _ = update_tx.send(config);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

/// True for content changes to `path` itself.
fn concerns(event: &Event, path: &Path) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|p| p == path || p.file_name() == path.file_name())
}

/// Read, settle, re-read and parse. `None` for empty, changing or invalid files.
fn stable_config(path: &Path) -> Option<StoreConfig> {
    let first = fs::read_to_string(path).ok()?;
    if first.trim().is_empty() {
        tracing::debug!(path = ?path, "Config file empty, waiting for the write to finish");
        return None;
    }
    std::thread::sleep(SETTLE);
    if fs::read_to_string(path).ok()? != first {
        tracing::debug!(path = ?path, "Config file still changing");
        return None;
    }
    match parse_config(&first) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::error!(error = %e, "Rejected config change, keeping current policy");
            None
        }
    }
}

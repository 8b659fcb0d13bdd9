//! Hot-reload of the configuration file.
//!
//! Write and create events on the config path trigger a re-read through
//! [`ConfigStore::reload_if_changed`]; only a successful swap is forwarded
//! to the daemon. Watch errors are logged and never crash the service.

use super::ConfigStore;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct ConfigWatcher {
    watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Starts watching the store's config file. Every accepted external
    /// change sends one unit on `on_change`.
    pub fn spawn(
        store: Arc<ConfigStore>,
        on_change: mpsc::Sender<()>,
    ) -> Result<Self, notify::Error> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                // Runs on the notify thread; just hand the event over.
                let _ = event_tx.send(res);
            })?;
        watcher.watch(store.path(), RecursiveMode::NonRecursive)?;

        let path = store.path().to_path_buf();
        let task = tokio::spawn(async move {
            while let Some(res) = event_rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(error = %err, "config watch error ignored");
                        continue;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                match store.reload_if_changed().await {
                    Ok(true) => {
                        let _ = on_change.send(()).await;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "ignoring config change that failed to load"
                        );
                    }
                }
            }
        });

        Ok(Self { watcher, task })
    }

    /// Stops watching and tears the dispatch task down.
    pub fn stop(self) {
        drop(self.watcher);
        self.task.abort();
    }
}

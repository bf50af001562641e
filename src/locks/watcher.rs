//! Debounced file watcher for config documents
//!
//! Watches the parent directory so editors that save through a rename are
//! still seen. Bursts of events within the debounce window collapse into a
//! single callback, run on a background thread.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Keeps the watch alive; dropping it stops the background thread
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    pub fn spawn<F>(path: &Path, debounce: Duration, on_change: F) -> Result<Self, notify::Error>
    where
        F: Fn() + Send + 'static,
    {
        let path = path.to_path_buf();
        let file_name = path.file_name().map(|n| n.to_os_string());
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                let relevant = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if relevant {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "config watch error"),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let label = path.display().to_string();
        thread::Builder::new()
            .name("config-watcher".to_string())
            .spawn(move || {
                // Sender lives in the watcher; the loop ends once it is dropped
                while rx.recv().is_ok() {
                    loop {
                        match rx.recv_timeout(debounce) {
                            Ok(()) => continue,
                            Err(RecvTimeoutError::Timeout) => break,
                            Err(RecvTimeoutError::Disconnected) => return,
                        }
                    }
                    debug!(path = %label, "config changed");
                    on_change();
                }
            })
            .map_err(notify::Error::io)?;

        Ok(Self {
            _watcher: watcher,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

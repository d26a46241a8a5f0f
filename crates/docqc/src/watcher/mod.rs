//! Folder watching and document ingestion.
//!
//! Each watched folder gets a debounced, poll-based watch on its own thread,
//! followed by an initial recursive scan once the watch is in place. Polling
//! keeps network shares and container mounts working where native events do
//! not arrive.

pub mod filter;
pub mod ingest;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use notify::{Config as NotifyConfig, PollWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer_opt, Config as DebouncerConfig, DebouncedEventKind};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use walkdir::WalkDir;

use crate::config::WatcherConfig;
use crate::error::WatchError;
use crate::events::EventBroadcaster;
use crate::sanitize::redact_path;

pub use filter::DocumentFilter;
pub use ingest::{IngestOutcome, Ingestor};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatcherStatus {
    pub active: bool,
    pub watched_folders: Vec<PathBuf>,
}

/// Result of the initial scan of a newly watched folder.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub scanned: usize,
    pub ingested: usize,
    pub already_known: usize,
    pub failed: usize,
}

struct WatchHandle {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct FolderWatcher {
    ingestor: Ingestor,
    filter: Arc<DocumentFilter>,
    config: WatcherConfig,
    events: EventBroadcaster,
    watches: Mutex<HashMap<PathBuf, WatchHandle>>,
}

impl FolderWatcher {
    pub fn new(
        ingestor: Ingestor,
        filter: DocumentFilter,
        config: WatcherConfig,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            ingestor,
            filter: Arc::new(filter),
            config,
            events,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Validates `path`, ingests the documents already in it and starts
    /// watching it for new ones.
    pub fn start(&self, path: &Path) -> Result<ScanSummary, WatchError> {
        let root = match validate_folder(path) {
            Ok(root) => root,
            Err(e) => {
                self.events
                    .error(format!("Cannot watch {}: {}", path.display(), e));
                return Err(e);
            }
        };

        let mut watches = self.lock_watches();
        if watches.contains_key(&root) {
            return Err(WatchError::AlreadyWatching(root));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let context = WatchContext {
            root: root.clone(),
            ingestor: self.ingestor.clone(),
            filter: Arc::clone(&self.filter),
            config: self.config.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        let thread = thread::Builder::new()
            .name(format!("docqc-watch-{}", redact_path(&root)))
            .spawn(move || context.run(ready_tx))
            .map_err(|e| WatchError::Notify(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err("watch thread exited during setup".to_string()));
        if let Err(message) = ready {
            let _ = thread.join();
            self.events
                .error(format!("Cannot watch {}: {}", root.display(), message));
            return Err(WatchError::Notify(message));
        }

        // Scan only once the poll baseline exists. Files seen by both are
        // deduplicated by ingest.
        let summary = match self.scan(&root) {
            Ok(summary) => summary,
            Err(e) => {
                stop_handle(&root, WatchHandle { shutdown, thread });
                return Err(e);
            }
        };

        info!(
            folder = %root.display(),
            ingested = summary.ingested,
            "Watching folder"
        );
        watches.insert(root, WatchHandle { shutdown, thread });
        Ok(summary)
    }

    /// Stops watching every folder. In-flight conversions are unaffected.
    pub fn stop(&self) {
        let handles: Vec<(PathBuf, WatchHandle)> = self.lock_watches().drain().collect();
        for (root, handle) in handles {
            stop_handle(&root, handle);
        }
    }

    /// Stops watching one folder. Returns `false` if it was not watched.
    pub fn stop_folder(&self, path: &Path) -> bool {
        let root = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let handle = self.lock_watches().remove(&root);
        match handle {
            Some(handle) => {
                stop_handle(&root, handle);
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> WatcherStatus {
        let mut watched_folders: Vec<PathBuf> = self.lock_watches().keys().cloned().collect();
        watched_folders.sort();
        WatcherStatus {
            active: !watched_folders.is_empty(),
            watched_folders,
        }
    }

    fn lock_watches(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, WatchHandle>> {
        // A poisoned map still holds valid handles.
        self.watches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scan(&self, root: &Path) -> Result<ScanSummary, WatchError> {
        let _span = info_span!("scan", folder = %redact_path(root)).entered();
        let mut summary = ScanSummary::default();
        let max_depth = if self.config.recursive { usize::MAX } else { 1 };

        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(WatchError::ScanFailed {
                        path: root.to_path_buf(),
                        source: e,
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            summary.scanned += 1;

            let path = entry.path();
            if !self.filter.accepts(path) {
                continue;
            }

            match self.ingestor.ingest(path, root) {
                Ok(IngestOutcome::Created(_)) => summary.ingested += 1,
                Ok(IngestOutcome::AlreadyKnown(_)) => summary.already_known += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(file = %redact_path(path), error = %e, "Failed to ingest document");
                }
            }
        }

        info!(
            scanned = summary.scanned,
            ingested = summary.ingested,
            already_known = summary.already_known,
            "Initial scan complete"
        );
        Ok(summary)
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn validate_folder(path: &Path) -> Result<PathBuf, WatchError> {
    if !path.exists() {
        return Err(WatchError::NotFound(path.to_path_buf()));
    }
    if !path.is_dir() {
        return Err(WatchError::NotADirectory(path.to_path_buf()));
    }
    std::fs::read_dir(path).map_err(|e| WatchError::Inaccessible {
        path: path.to_path_buf(),
        source: e,
    })?;
    path.canonicalize().map_err(|e| WatchError::Inaccessible {
        path: path.to_path_buf(),
        source: e,
    })
}

fn stop_handle(root: &Path, handle: WatchHandle) {
    handle.shutdown.store(true, Ordering::Relaxed);
    if let Err(e) = handle.thread.join() {
        error!("Watch thread for {} panicked: {:?}", root.display(), e);
    } else {
        info!(folder = %root.display(), "Stopped watching folder");
    }
}

struct WatchContext {
    root: PathBuf,
    ingestor: Ingestor,
    filter: Arc<DocumentFilter>,
    config: WatcherConfig,
    shutdown: Arc<AtomicBool>,
}

impl WatchContext {
    fn run(self, ready: mpsc::Sender<Result<(), String>>) {
        let poll_config = NotifyConfig::default()
            .with_poll_interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        let debouncer_config = DebouncerConfig::default()
            .with_timeout(Duration::from_millis(self.config.debounce_ms))
            .with_notify_config(poll_config);

        let (tx, rx) = mpsc::channel();
        let mut debouncer = match new_debouncer_opt::<_, PollWatcher>(debouncer_config, tx) {
            Ok(debouncer) => debouncer,
            Err(e) => {
                let _ = ready.send(Err(e.to_string()));
                return;
            }
        };

        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        if let Err(e) = debouncer.watcher().watch(&self.root, mode) {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
        let _ = ready.send(Ok(()));

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!(folder = %self.root.display(), "Watch thread shutting down");
                break;
            }

            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(events)) => {
                    for event in events {
                        if matches!(event.kind, DebouncedEventKind::Any) {
                            self.handle_path(&event.path);
                        }
                    }
                }
                Ok(Err(errors)) => {
                    warn!("Watch errors: {:?}", errors);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Watch channel disconnected");
                    break;
                }
            }
        }
    }

    fn handle_path(&self, path: &Path) {
        if !path.exists() {
            debug!(file = %redact_path(path), "Document removed");
            return;
        }
        if !path.is_file() || !self.filter.accepts(path) {
            return;
        }
        if !self.config.recursive {
            if let Ok(relative) = path.strip_prefix(&self.root) {
                if relative.components().count() > 1 {
                    return;
                }
            }
        }

        if let Err(e) = self.ingestor.ingest(path, &self.root) {
            warn!(file = %redact_path(path), error = %e, "Failed to ingest document");
        }
    }
}

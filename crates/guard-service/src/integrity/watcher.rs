//! Real-time file system watcher using the `notify` crate.
//!
//! One worker thread owns the `RecommendedWatcher`. Raw notifications, watch
//! set updates and the shutdown request all travel over the same channel, so
//! the worker handles them strictly in arrival order and never needs a lock
//! around the watcher itself.
//!
//! The inotify watch on a directory dies with the directory. When a watched
//! directory is removed, or a restore has to recreate a file's parent, the
//! worker subscribes the path again so the recreated directory stays covered.

use guard_core::error::{GuardError, Result};
use guard_core::event_log::{EventKind as LogKind, EventLog};
use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, info};

use crate::integrity::pipeline::{ChangeOutcome, ChangePipeline};
use crate::integrity::verifier::Verdict;

/// Directories the worker currently holds a subscription on.
pub type LiveWatchSet = Arc<Mutex<BTreeSet<PathBuf>>>;

/// Types of file changes we care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Modified(PathBuf),
    Removed(PathBuf),
}

impl FileChange {
    pub fn path(&self) -> &Path {
        match self {
            FileChange::Modified(p) | FileChange::Removed(p) => p,
        }
    }
}

enum WorkerMessage {
    Fs(notify::Result<Event>),
    Reconcile {
        directories: BTreeSet<PathBuf>,
        ack: Option<mpsc::Sender<usize>>,
    },
    Shutdown,
}

/// Handle to the background watch worker.
pub struct WatchWorker {
    tx: mpsc::Sender<WorkerMessage>,
    done_rx: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl WatchWorker {
    /// Start the worker. `live` mirrors the subscriptions it holds and is
    /// emptied when the worker exits.
    pub fn spawn(
        pipeline: ChangePipeline,
        events: Arc<EventLog>,
        live: LiveWatchSet,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        let notify_tx = tx.clone();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(WorkerMessage::Fs(res));
            },
            Config::default(),
        )
        .map_err(|e| GuardError::Watch(e.to_string()))?;

        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("guard-watch-worker".into())
            .spawn(move || {
                run_worker(watcher, rx, pipeline, events, &live);
                live.lock().clear();
                let _ = done_tx.send(());
            })
            .map_err(|e| GuardError::Watch(e.to_string()))?;

        Ok(Self {
            tx,
            done_rx,
            worker_id: handle.thread().id(),
            handle: Some(handle),
        })
    }

    /// `true` when called from inside a pipeline callback.
    pub fn on_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Replace the watch set and wait until the worker has applied it.
    /// Returns the number of directories being watched.
    pub fn reconcile(&self, directories: BTreeSet<PathBuf>, timeout: Duration) -> Result<usize> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(WorkerMessage::Reconcile {
            directories,
            ack: Some(ack_tx),
        })?;
        match ack_rx.recv_timeout(timeout) {
            Ok(watching) => Ok(watching),
            Err(RecvTimeoutError::Timeout) => Err(GuardError::timeout(timeout, "watch set update")),
            Err(RecvTimeoutError::Disconnected) => {
                Err(GuardError::Watch("watch worker exited".into()))
            }
        }
    }

    /// Queue a watch set update without waiting for it. Safe to call from
    /// the worker thread itself, e.g. inside a sink callback.
    pub fn request_reconcile(&self, directories: BTreeSet<PathBuf>) -> Result<()> {
        self.send(WorkerMessage::Reconcile {
            directories,
            ack: None,
        })
    }

    /// Ask the worker to exit and wait up to `timeout` for it. On timeout the
    /// thread is left to finish on its own.
    pub fn shutdown(mut self, timeout: Duration) -> Result<()> {
        let _ = self.tx.send(WorkerMessage::Shutdown);
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                self.handle.take();
                Err(GuardError::timeout(timeout, "watch worker shutdown"))
            }
        }
    }

    fn send(&self, message: WorkerMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| GuardError::Watch("watch worker exited".into()))
    }
}

impl Drop for WatchWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.tx.send(WorkerMessage::Shutdown);
        }
    }
}

fn run_worker(
    mut watcher: RecommendedWatcher,
    rx: mpsc::Receiver<WorkerMessage>,
    pipeline: ChangePipeline,
    events: Arc<EventLog>,
    live: &LiveWatchSet,
) {
    let mut watched = BTreeSet::new();
    let mut desired = BTreeSet::new();
    let removed = pipeline.cleanup_staging();
    if removed > 0 {
        info!(removed, "cleaned orphaned restore staging files");
    }

    while let Ok(message) = rx.recv() {
        match message {
            WorkerMessage::Fs(Ok(event)) => {
                let mut lost = lost_directories(&watched, &event);
                for change in classify_event(&event) {
                    let outcome = pipeline.handle(&change);
                    if recreated_by_restore(&outcome) {
                        if let Some(dir) = change.path().parent() {
                            lost.insert(dir.to_path_buf());
                        }
                    }
                }
                if !lost.is_empty() {
                    resubscribe(&mut watcher, &mut watched, &desired, lost, &events);
                    *live.lock() = watched.clone();
                }
            }
            WorkerMessage::Fs(Err(e)) => {
                events.append(LogKind::Error, format!("File watcher error: {e}"), None);
            }
            WorkerMessage::Reconcile { directories, ack } => {
                desired = directories;
                apply_watch_set(&mut watcher, &mut watched, &desired, &events);
                *live.lock() = watched.clone();
                if let Some(ack) = ack {
                    let _ = ack.send(watched.len());
                }
            }
            WorkerMessage::Shutdown => break,
        }
    }

    for dir in &watched {
        let _ = watcher.unwatch(dir);
    }
    debug!("watch worker exiting");
}

/// Watched directories that `event` reports as removed.
fn lost_directories(watched: &BTreeSet<PathBuf>, event: &Event) -> BTreeSet<PathBuf> {
    if !matches!(event.kind, EventKind::Remove(_)) {
        return BTreeSet::new();
    }
    event
        .paths
        .iter()
        .filter(|path| watched.contains(*path))
        .cloned()
        .collect()
}

/// A restore of a deleted file may have recreated its parent directory.
fn recreated_by_restore(outcome: &ChangeOutcome) -> bool {
    matches!(
        outcome,
        ChangeOutcome::Restored {
            verdict: Verdict::Deleted,
            restore,
        } if restore.is_restored()
    )
}

/// Forget the subscriptions on `lost` and watch them again if they are still
/// wanted and present. Re-adding a path that is still watched only refreshes
/// the inotify mask.
fn resubscribe(
    watcher: &mut RecommendedWatcher,
    watched: &mut BTreeSet<PathBuf>,
    desired: &BTreeSet<PathBuf>,
    lost: BTreeSet<PathBuf>,
    events: &EventLog,
) {
    for dir in &lost {
        if watched.remove(dir) {
            debug!(dir = %dir.display(), "watch lost, resubscribing");
        }
    }
    let wanted: BTreeSet<PathBuf> = lost.intersection(desired).cloned().collect();
    let mut keep = watched.clone();
    keep.extend(wanted);
    apply_watch_set(watcher, watched, &keep, events);
}

fn apply_watch_set(
    watcher: &mut RecommendedWatcher,
    watched: &mut BTreeSet<PathBuf>,
    desired: &BTreeSet<PathBuf>,
    events: &EventLog,
) {
    let stale: Vec<PathBuf> = watched.difference(desired).cloned().collect();
    for dir in stale {
        if let Err(e) = watcher.unwatch(&dir) {
            debug!(dir = %dir.display(), error = %e, "unwatch failed");
        }
        watched.remove(&dir);
        info!("Stopped watching: {}", dir.display());
    }

    for dir in desired {
        if watched.contains(dir) {
            continue;
        }
        if !dir.is_dir() {
            events.append(
                LogKind::Warning,
                format!("Directory not found, not watching: {}", dir.display()),
                Some(dir),
            );
            continue;
        }
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                info!("Watching: {}", dir.display());
                watched.insert(dir.clone());
            }
            Err(e) => {
                events.append(
                    LogKind::Error,
                    format!("Could not watch {}: {e}", dir.display()),
                    Some(dir),
                );
            }
        }
    }
}

/// Classify a notify event into our FileChange types.
///
/// Creations, content writes and renames map to `Modified` for paths that
/// still exist and to `Removed` for paths that are gone. Directories,
/// metadata-only changes and access notifications are dropped.
pub fn classify_event(event: &Event) -> Vec<FileChange> {
    let removal = match &event.kind {
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Remove(_) => true,
        _ => false,
    };

    event
        .paths
        .iter()
        .filter_map(|path| match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => None,
            Ok(_) if !removal => Some(FileChange::Modified(path.clone())),
            _ => Some(FileChange::Removed(path.clone())),
        })
        .collect()
}

//! Lifecycle controller.
//!
//! `MonitorService` is the single handle the outer application holds. It owns
//! the registry, cooldown map and event log behind separate locks, and moves
//! between two states: Stopped, and Running with a live watch worker.

use guard_core::backup_store::{BackupStore, BlobStore};
use guard_core::crypto::{CryptoProvider, EncryptionKey, VaultCrypto};
use guard_core::error::{GuardError, Result};
use guard_core::event_log::{Event, EventKind, EventLog};
use guard_core::hasher::FileHasher;
use guard_core::paths::{backup_dir, key_path};
use guard_core::settings::MonitorSettings;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::enforcement::restore::RestoreOrchestrator;
use crate::integrity::cooldown::CooldownTracker;
use crate::integrity::pipeline::ChangePipeline;
use crate::integrity::registry::{canonical_path, ProtectedFile, ProtectedRegistry};
use crate::integrity::verifier::IntegrityVerifier;
use crate::integrity::watcher::{LiveWatchSet, WatchWorker};
use crate::sink::IntegritySink;
use crate::status::{FileSummary, StatusReport};

/// Default number of events returned when the caller does not ask for more.
pub const DEFAULT_EVENT_LIMIT: usize = 50;

enum Lifecycle {
    Stopped,
    Running(WatchWorker),
}

pub struct MonitorService {
    settings: MonitorSettings,
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn BlobStore>,
    backups: Option<Arc<BackupStore>>,
    registry: Arc<ProtectedRegistry>,
    cooldown: Arc<CooldownTracker>,
    events: Arc<EventLog>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
    /// Live set of the current worker. Replaced on every start so a worker
    /// detached by a stop timeout cannot write into its successor's view.
    watching: Mutex<LiveWatchSet>,
}

impl MonitorService {
    pub fn new(
        settings: MonitorSettings,
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let events = match &settings.event_journal {
            Some(journal) => EventLog::with_journal(settings.event_capacity, journal),
            None => EventLog::new(settings.event_capacity),
        };
        Self {
            cooldown: Arc::new(CooldownTracker::new(settings.cooldown())),
            settings,
            crypto,
            store,
            backups: None,
            registry: Arc::new(ProtectedRegistry::new()),
            events: Arc::new(events),
            lifecycle: Mutex::new(Lifecycle::Stopped),
            running: AtomicBool::new(false),
            watching: Mutex::new(LiveWatchSet::default()),
        }
    }

    /// Same as [`MonitorService::new`] with a filesystem backup store, which
    /// also enables [`MonitorService::protect_file`].
    pub fn with_backup_store(
        settings: MonitorSettings,
        crypto: Arc<dyn CryptoProvider>,
        backups: Arc<BackupStore>,
    ) -> Self {
        let store: Arc<dyn BlobStore> = backups.clone();
        let mut service = Self::new(settings, crypto, store);
        service.backups = Some(backups);
        service
    }

    /// Open the key file and backup store under `data_dir`.
    pub fn open(settings: MonitorSettings, data_dir: &Path) -> Result<Self> {
        settings.validate()?;
        fs::create_dir_all(data_dir).map_err(|e| GuardError::io(data_dir, e))?;
        let key = EncryptionKey::load_or_generate(&key_path(data_dir))?;
        let hasher = FileHasher::new(settings.hash_algorithm, settings.hash_chunk_bytes);
        let crypto: Arc<dyn CryptoProvider> = Arc::new(VaultCrypto::new(key, hasher));
        let backups = Arc::new(BackupStore::load_or_create(backup_dir(data_dir))?);
        Ok(Self::with_backup_store(settings, crypto, backups))
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Registry ────────────────────────────────────────────────────────────

    /// Enroll a file with a known baseline digest and backup reference.
    /// Overwrites a previous enrollment of the same path.
    pub fn add_protected_file(
        &self,
        path: impl AsRef<Path>,
        baseline_hash: &str,
        backup_ref: Option<&str>,
    ) -> bool {
        let added = self
            .registry
            .add(path.as_ref(), baseline_hash, backup_ref.map(str::to_string));
        self.reconcile_watches();
        added
    }

    pub fn remove_protected_file(&self, path: impl AsRef<Path>) -> bool {
        let canonical = canonical_path(path.as_ref());
        let removed = self.registry.remove(&canonical);
        if removed {
            self.cooldown.forget(&canonical);
            self.reconcile_watches();
        }
        removed
    }

    pub fn protected_files(&self) -> Vec<ProtectedFile> {
        self.registry.snapshot()
    }

    /// Hash the current content of `path`, seal it into the backup store and
    /// enroll it.
    pub fn protect_file(&self, path: impl AsRef<Path>) -> Result<ProtectedFile> {
        let backups = self.backup_store()?;
        let canonical = canonical_path(path.as_ref());
        let content = fs::read(&canonical).map_err(|e| GuardError::io(&canonical, e))?;
        let baseline_hash = self.crypto.hash_bytes(&content);
        let sealed = self.crypto.encrypt(&content)?;
        let backup = backups.put_encrypted(&canonical, &baseline_hash, &sealed)?;

        self.add_protected_file(&canonical, &baseline_hash, Some(&backup.reference));
        self.registry
            .lookup(&canonical)
            .ok_or_else(|| GuardError::NotFound(canonical.display().to_string()))
    }

    /// Stop protecting `path` and drop its backup. Returns whether it was
    /// enrolled.
    pub fn unprotect_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        let backups = self.backup_store()?;
        let canonical = canonical_path(path.as_ref());
        let removed = self.remove_protected_file(&canonical);
        let dropped = backups.remove(&canonical)?;
        Ok(removed || dropped.is_some())
    }

    /// Register every file recorded in the backup store manifest.
    pub fn load_enrolled(&self) -> Result<usize> {
        let backups = self.backup_store()?;
        let entries = backups.entries();
        for entry in &entries {
            self.registry
                .add(&entry.path, &entry.baseline_hash, Some(entry.reference.clone()));
        }
        self.reconcile_watches();
        info!(count = entries.len(), "enrolled files loaded");
        Ok(entries.len())
    }

    fn backup_store(&self) -> Result<&Arc<BackupStore>> {
        self.backups
            .as_ref()
            .ok_or_else(|| GuardError::Configuration("no backup store configured".into()))
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Begin monitoring. Returns `false` without side effects when already
    /// running or when nothing is protected.
    pub fn start(&self, sink: Arc<dyn IntegritySink>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            warn!("monitoring service is already running");
            return false;
        }
        if self.registry.is_empty() {
            warn!("no protected files, refusing to start monitoring");
            return false;
        }

        let pipeline = ChangePipeline::new(
            self.registry.clone(),
            self.cooldown.clone(),
            self.events.clone(),
            IntegrityVerifier::new(
                self.crypto.clone(),
                self.events.clone(),
                self.settings.preview.clone(),
            ),
            RestoreOrchestrator::new(self.store.clone(), self.crypto.clone(), self.events.clone()),
            sink,
        );

        let live = LiveWatchSet::default();
        let worker = match WatchWorker::spawn(pipeline, self.events.clone(), live.clone()) {
            Ok(worker) => worker,
            Err(e) => {
                self.events
                    .append(EventKind::Error, format!("Monitoring start error: {e}"), None);
                return false;
            }
        };

        let directories = self.registry.directories();
        let watching = match worker.reconcile(directories, self.settings.stop_timeout()) {
            Ok(watching) => watching,
            Err(e) => {
                self.events
                    .append(EventKind::Error, format!("Monitoring start error: {e}"), None);
                if let Err(e) = worker.shutdown(self.settings.stop_timeout()) {
                    warn!(error = %e, "watch worker did not exit after failed start");
                }
                return false;
            }
        };

        *self.watching.lock() = live;
        *lifecycle = Lifecycle::Running(worker);
        self.running.store(true, Ordering::SeqCst);
        info!(
            protected = self.registry.len(),
            directories = watching,
            "file protection active"
        );
        true
    }

    /// Stop monitoring. Returns `false` without side effects when already
    /// stopped. Waiting for the worker is bounded by `stop_timeout_secs`;
    /// past that the worker is detached and the service is Stopped anyway.
    pub fn stop(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let worker = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(worker) => worker,
            Lifecycle::Stopped => {
                warn!("monitoring service is already stopped");
                return false;
            }
        };
        self.running.store(false, Ordering::SeqCst);

        if let Err(e) = worker.shutdown(self.settings.stop_timeout()) {
            self.events
                .append(EventKind::Error, format!("Monitoring stop error: {e}"), None);
        }
        info!("file protection stopped");
        true
    }

    /// Push the registry's directory set to the running worker, if any.
    fn reconcile_watches(&self) {
        let lifecycle = self.lifecycle.lock();
        let Lifecycle::Running(worker) = &*lifecycle else {
            return;
        };
        let directories = self.registry.directories();
        let result = if worker.on_worker_thread() {
            worker.request_reconcile(directories)
        } else {
            worker
                .reconcile(directories, self.settings.stop_timeout())
                .map(|_| ())
        };
        if let Err(e) = result {
            self.events
                .append(EventKind::Error, format!("Watch set update failed: {e}"), None);
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// While running, `directories` lists the live subscriptions and
    /// `unwatched` the registry directories the worker could not watch. When
    /// stopped, `directories` is the set the next start will watch.
    pub fn status(&self) -> StatusReport {
        let files = self.registry.snapshot();
        let derived = self.registry.directories();
        let running = self.is_running();
        let (directories, unwatched): (Vec<_>, Vec<_>) = if running {
            let live = self.watching.lock().lock().clone();
            let unwatched = derived.difference(&live).cloned().collect();
            (live.into_iter().collect(), unwatched)
        } else {
            (derived.into_iter().collect(), Vec::new())
        };
        StatusReport {
            running,
            protected_count: files.len(),
            directory_count: directories.len(),
            directories,
            unwatched,
            files: files.iter().map(FileSummary::from).collect(),
        }
    }

    /// Most recent first.
    pub fn get_events(&self, limit: usize) -> Vec<Event> {
        self.events.recent(limit)
    }

    pub fn clear_events(&self) {
        self.events.clear();
    }

    /// Drop cooldown entries whose window has elapsed. Returns how many were
    /// removed.
    pub fn prune_cooldowns(&self) -> usize {
        self.cooldown.prune_expired()
    }
}

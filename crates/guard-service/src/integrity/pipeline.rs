//! Change pipeline.
//!
//! Receives classified `FileChange`s from the watch worker and runs each one
//! through: registry lookup → cooldown gate → verification → restore.
//! Changes for paths outside the registry are dropped silently.

use chrono::Utc;
use guard_core::event_log::{EventKind, EventLog};
use std::sync::Arc;
use tracing::trace;

use crate::enforcement::restore::{RestoreOrchestrator, RestoreOutcome, RestoreReason};
use crate::integrity::cooldown::CooldownTracker;
use crate::integrity::registry::ProtectedRegistry;
use crate::integrity::verifier::{IntegrityVerifier, Verdict};
use crate::integrity::watcher::FileChange;
use crate::sink::IntegritySink;

/// What happened to a single change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Path is not protected.
    Ignored,
    /// Inside the cooldown window of an earlier notification.
    Suppressed,
    Verified(Verdict),
    Restored {
        verdict: Verdict,
        restore: RestoreOutcome,
    },
}

pub struct ChangePipeline {
    registry: Arc<ProtectedRegistry>,
    cooldown: Arc<CooldownTracker>,
    events: Arc<EventLog>,
    verifier: IntegrityVerifier,
    restorer: RestoreOrchestrator,
    sink: Arc<dyn IntegritySink>,
}

impl ChangePipeline {
    pub fn new(
        registry: Arc<ProtectedRegistry>,
        cooldown: Arc<CooldownTracker>,
        events: Arc<EventLog>,
        verifier: IntegrityVerifier,
        restorer: RestoreOrchestrator,
        sink: Arc<dyn IntegritySink>,
    ) -> Self {
        Self {
            registry,
            cooldown,
            events,
            verifier,
            restorer,
            sink,
        }
    }

    pub fn handle(&self, change: &FileChange) -> ChangeOutcome {
        let path = change.path();
        let Some(entry) = self.registry.lookup(path) else {
            trace!(path = %path.display(), "change outside registry");
            return ChangeOutcome::Ignored;
        };

        if !self.cooldown.gate_event(&entry.path) {
            trace!(path = %entry.path.display(), "suppressed by cooldown");
            return ChangeOutcome::Suppressed;
        }
        self.registry.mark_processed(&entry.path, Utc::now());

        if matches!(change, FileChange::Modified(_)) {
            self.events.append(
                EventKind::Info,
                format!("File modification detected: {}", entry.file_name()),
                Some(&entry.path),
            );
        }

        let verdict = self.verifier.verify(&entry);
        let reason = match &verdict {
            Verdict::Deleted => RestoreReason::Deleted,
            Verdict::Tampered { actual_hash } => {
                self.sink
                    .on_violation(&entry.path, &entry.baseline_hash, actual_hash);
                RestoreReason::Modified
            }
            Verdict::Intact | Verdict::Unreadable | Verdict::NoBaseline => {
                return ChangeOutcome::Verified(verdict);
            }
        };

        let restore = self.restorer.restore(&entry, reason);
        if restore.is_restored() {
            self.sink.on_restore(&entry.path, reason);
        }
        ChangeOutcome::Restored { verdict, restore }
    }

    /// Remove leftovers of interrupted restores in every watched directory.
    pub fn cleanup_staging(&self) -> usize {
        let directories = self.registry.directories();
        RestoreOrchestrator::cleanup_staging(&directories)
    }
}

//! Notification hooks for violations and restores.

use std::path::{Path, PathBuf};
use std::sync::mpsc;

use crate::enforcement::restore::RestoreReason;

/// Receives monitoring outcomes. Called from the watch worker thread, so
/// implementations must not block for long.
pub trait IntegritySink: Send + Sync {
    /// A protected file's content no longer matches its baseline.
    fn on_violation(&self, path: &Path, expected_hash: &str, actual_hash: &str);

    /// A protected file was written back from its backup.
    fn on_restore(&self, path: &Path, reason: RestoreReason);
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl IntegritySink for NoopSink {
    fn on_violation(&self, _path: &Path, _expected_hash: &str, _actual_hash: &str) {}

    fn on_restore(&self, _path: &Path, _reason: RestoreReason) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Violation {
        path: PathBuf,
        expected_hash: String,
        actual_hash: String,
    },
    Restored {
        path: PathBuf,
        reason: RestoreReason,
    },
}

/// Forwards every callback into a channel. A dropped receiver is ignored.
pub struct ChannelSink {
    tx: mpsc::Sender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl IntegritySink for ChannelSink {
    fn on_violation(&self, path: &Path, expected_hash: &str, actual_hash: &str) {
        let _ = self.tx.send(Notification::Violation {
            path: path.to_path_buf(),
            expected_hash: expected_hash.to_string(),
            actual_hash: actual_hash.to_string(),
        });
    }

    fn on_restore(&self, path: &Path, reason: RestoreReason) {
        let _ = self.tx.send(Notification::Restored {
            path: path.to_path_buf(),
            reason,
        });
    }
}

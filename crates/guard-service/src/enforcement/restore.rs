//! Auto-restore orchestrator.
//!
//! Restore algorithm:
//!
//! 1. Acquire per-path mutex
//! 2. Require a backup reference on the registry entry
//! 3. Fetch the sealed blob from the storage collaborator
//! 4. Decrypt it and check the plaintext digest against the baseline
//! 5. Write a staging file in the SAME directory as the target with the
//!    enrolled permissions, fsync
//! 6. Atomic rename over the target, fsync the parent dir (unix)
//!
//! Every failure is recorded as an `error` event and returned as an outcome;
//! nothing here panics or propagates into the worker loop.

use guard_core::backup_store::BlobStore;
use guard_core::crypto::CryptoProvider;
use guard_core::error::{GuardError, Result};
use guard_core::event_log::{EventKind, EventLog};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::integrity::registry::{file_mode, ProtectedFile};

/// Minimum free space required before writing a restored file (bytes).
#[cfg(unix)]
const MIN_FREE_SPACE_BYTES: u64 = 1024 * 1024;

/// Staging file prefix used so we can clean up orphans on startup.
pub const STAGING_PREFIX: &str = ".guard_restore_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreReason {
    Modified,
    Deleted,
    Unknown,
}

impl fmt::Display for RestoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        })
    }
}

/// Result of a single restore attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    MissingBackupRef,
    BackupUnavailable { error: String },
    DecryptFailed { error: String },
    BackupMismatch { expected: String, actual: String },
    WriteFailed { error: String },
}

impl RestoreOutcome {
    pub fn is_restored(&self) -> bool {
        matches!(self, RestoreOutcome::Restored)
    }
}

pub struct RestoreOrchestrator {
    store: Arc<dyn BlobStore>,
    crypto: Arc<dyn CryptoProvider>,
    events: Arc<EventLog>,
    /// Per-path locks to prevent concurrent restores of the same file.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RestoreOrchestrator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        crypto: Arc<dyn CryptoProvider>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            store,
            crypto,
            events,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn restore(&self, entry: &ProtectedFile, reason: RestoreReason) -> RestoreOutcome {
        // ── Step 1: per-path lock ───────────────────────────────────────
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(entry.path.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock();

        let name = entry.file_name();
        let path = entry.path.as_path();

        // ── Step 2: backup reference ────────────────────────────────────
        let reference = match entry.backup_ref.as_deref() {
            Some(r) if !r.trim().is_empty() => r,
            _ => {
                self.events.append(
                    EventKind::Error,
                    format!("Restore aborted, no backup reference: {name}"),
                    Some(path),
                );
                return RestoreOutcome::MissingBackupRef;
            }
        };

        // ── Step 3: fetch ───────────────────────────────────────────────
        let sealed = match self.store.get_encrypted_blob(reference) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.events.append(
                    EventKind::Error,
                    format!("Encrypted backup not found: {name} - {e}"),
                    Some(path),
                );
                return RestoreOutcome::BackupUnavailable {
                    error: e.to_string(),
                };
            }
        };

        // ── Step 4: decrypt + verify ────────────────────────────────────
        let plaintext = match self.crypto.decrypt(&sealed) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.events.append(
                    EventKind::Error,
                    format!("Backup decryption failed: {name} - {e}"),
                    Some(path),
                );
                return RestoreOutcome::DecryptFailed {
                    error: e.to_string(),
                };
            }
        };
        let restored_hash = self.crypto.hash_bytes(&plaintext);
        if !entry.baseline_hash.is_empty()
            && !restored_hash.eq_ignore_ascii_case(&entry.baseline_hash)
        {
            let err = GuardError::BackupMismatch {
                expected: entry.baseline_hash.clone(),
                actual: restored_hash.clone(),
            };
            self.events.append(
                EventKind::Error,
                format!("Restore refused: {name} - {err}"),
                Some(path),
            );
            return RestoreOutcome::BackupMismatch {
                expected: entry.baseline_hash.clone(),
                actual: restored_hash,
            };
        }

        // ── Steps 5-6: atomic write ─────────────────────────────────────
        let mode = entry.mode.or_else(|| file_mode(path));
        if let Err(e) = write_atomic(path, &plaintext, mode) {
            self.events.append(
                EventKind::Error,
                format!("Restore error: {name} - {e}"),
                Some(path),
            );
            return RestoreOutcome::WriteFailed {
                error: e.to_string(),
            };
        }

        self.events.append(
            EventKind::Restore,
            format!("File restored successfully: {name} (reason: {reason})"),
            Some(path),
        );
        RestoreOutcome::Restored
    }

    /// Clean up orphaned staging files left by a previous crash in the given
    /// directories.
    pub fn cleanup_staging<'a>(directories: impl IntoIterator<Item = &'a PathBuf>) -> usize {
        let mut removed = 0;
        for dir in directories {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                    warn!(path = %entry.path().display(), "removing orphaned staging file");
                    if fs::remove_file(entry.path()).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }
}

/// Replace `target` with `data` so readers see either the old file or the
/// complete new one. `mode` is applied to the staging file before the rename;
/// without it the file gets the process umask default.
pub fn write_atomic(target: &Path, data: &[u8], mode: Option<u32>) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| GuardError::NotFound(format!("parent directory of {}", target.display())))?;
    fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
    check_disk_space(parent, data.len() as u64)?;

    let staging_path = parent.join(format!("{}{:08x}", STAGING_PREFIX, rand::random::<u32>()));
    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&staging_path)?;
        if let Some(mode) = mode {
            restore_permissions(&file, mode)?;
        }
        file.write_all(data)?;
        file.sync_all()
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&staging_path);
        return Err(GuardError::io(&staging_path, e));
    }

    if let Err(e) = fs::rename(&staging_path, target) {
        let _ = fs::remove_file(&staging_path);
        return Err(GuardError::io(target, e));
    }

    #[cfg(unix)]
    {
        // make the directory entry durable
        if let Ok(dir) = fs::OpenOptions::new().read(true).open(parent) {
            let _ = dir.sync_all();
        }
    }
    debug!(path = %target.display(), bytes = data.len(), "atomic write complete");
    Ok(())
}

#[cfg(unix)]
fn restore_permissions(file: &File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restore_permissions(_file: &File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

// ── Disk space preflight ────────────────────────────────────────────────────

/// Check that the filesystem containing `dir` has at least `needed` bytes plus
/// a safety margin (`MIN_FREE_SPACE_BYTES`) of free space.
fn check_disk_space(dir: &Path, needed: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| GuardError::NotFound(format!("invalid path {}", dir.display())))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret == 0 {
            let stat = unsafe { stat.assume_init() };
            let available = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            let required = needed.saturating_add(MIN_FREE_SPACE_BYTES);
            if available < required {
                return Err(GuardError::io(
                    dir,
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("insufficient disk space: need {required} bytes, {available} available"),
                    ),
                ));
            }
        } else {
            warn!(dir = %dir.display(), "statvfs failed; skipping space check");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (dir, needed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_replaces_and_leaves_no_staging() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a.txt");
        fs::write(&target, b"tampered").unwrap();

        write_atomic(&target, b"original", None).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"original");

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn write_atomic_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("gone").join("deeper").join("a.txt");
        write_atomic(&target, b"back", None).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"back");
    }

    #[cfg(unix)]
    #[test]
    fn write_atomic_applies_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let target = dir.path().join("secret.conf");
        fs::write(&target, b"tampered").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o644)).unwrap();

        write_atomic(&target, b"original", Some(0o600)).unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn cleanup_removes_only_staging_files() {
        let dir = tempdir().unwrap();
        let orphan = dir.path().join(format!("{STAGING_PREFIX}deadbeef"));
        let keep = dir.path().join("keep.txt");
        fs::write(&orphan, b"x").unwrap();
        fs::write(&keep, b"y").unwrap();

        let dirs = vec![dir.path().to_path_buf()];
        assert_eq!(RestoreOrchestrator::cleanup_staging(&dirs), 1);
        assert!(!orphan.exists());
        assert!(keep.exists());
    }

    #[test]
    fn reason_display() {
        assert_eq!(RestoreReason::Deleted.to_string(), "deleted");
        assert_eq!(
            serde_json::to_string(&RestoreReason::Modified).unwrap(),
            "\"modified\""
        );
    }
}

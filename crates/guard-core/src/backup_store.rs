//! Encrypted backup store.
//!
//! Holds exactly one sealed blob per protected file, addressed by a backup
//! reference derived from the file's canonical path. A JSON manifest maps the
//! canonical path to its reference and the baseline digest recorded at
//! enrollment so the service can re-register files on startup.

use crate::error::{GuardError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const MANIFEST_VERSION: u32 = 1;

/// Storage collaborator used by the restore path.
pub trait BlobStore: Send + Sync {
    /// Fetch the sealed blob for `reference`. Unknown references are
    /// `GuardError::NotFound`.
    fn get_encrypted_blob(&self, reference: &str) -> Result<Vec<u8>>;
}

// ── Data Models ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub reference: String,
    pub baseline_hash: String,
    pub stored_size: u64,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub entries: BTreeMap<String, BackupEntry>,
}

impl BackupManifest {
    fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION,
            updated_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

pub struct BackupStore {
    manifest_path: PathBuf,
    blobs_root: PathBuf,
    staging_root: PathBuf,
    manifest: Mutex<BackupManifest>,
}

impl BackupStore {
    /// Load an existing store or create a new one.
    pub fn load_or_create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest_path = root.join("store.manifest");
        let blobs_root = root.join("blobs");
        let staging_root = root.join("staging");

        fs::create_dir_all(&blobs_root).map_err(|e| GuardError::io(&blobs_root, e))?;
        fs::create_dir_all(&staging_root).map_err(|e| GuardError::io(&staging_root, e))?;
        Self::restrict_dir_permissions(&root);
        Self::cleanup_staging_dir(&staging_root);

        let manifest = match fs::read(&manifest_path) {
            Ok(bytes) => {
                let manifest: BackupManifest = serde_json::from_slice(&bytes)?;
                if manifest.version != MANIFEST_VERSION {
                    return Err(GuardError::Configuration(format!(
                        "unsupported backup manifest version {}",
                        manifest.version
                    )));
                }
                manifest
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let manifest = BackupManifest::empty();
                Self::write_manifest(&manifest_path, &manifest)?;
                manifest
            }
            Err(e) => return Err(GuardError::io(&manifest_path, e)),
        };

        Ok(Self {
            manifest_path,
            blobs_root,
            staging_root,
            manifest: Mutex::new(manifest),
        })
    }

    pub fn entry_for(&self, path: &Path) -> Option<BackupEntry> {
        self.manifest.lock().entries.get(&key(path)).cloned()
    }

    pub fn entries(&self) -> Vec<BackupEntry> {
        self.manifest.lock().entries.values().cloned().collect()
    }

    /// Store a sealed blob for `canonical_path`, replacing any previous
    /// backup of the same path.
    pub fn put_encrypted(
        &self,
        canonical_path: &Path,
        baseline_hash: &str,
        sealed: &[u8],
    ) -> Result<BackupEntry> {
        let reference = reference_for(canonical_path);
        let blob_path = self.blob_path(&reference);
        self.write_blob_atomic(&blob_path, sealed)?;

        let entry = BackupEntry {
            path: canonical_path.to_path_buf(),
            reference,
            baseline_hash: baseline_hash.to_string(),
            stored_size: sealed.len() as u64,
            stored_at: Utc::now(),
        };

        let mut manifest = self.manifest.lock();
        manifest.entries.insert(key(canonical_path), entry.clone());
        manifest.updated_at = Utc::now();
        Self::write_manifest(&self.manifest_path, &manifest)?;
        debug!(path = %canonical_path.display(), reference = %entry.reference, "backup stored");
        Ok(entry)
    }

    /// Drop the manifest entry and blob for a path. Returns the removed entry.
    pub fn remove(&self, canonical_path: &Path) -> Result<Option<BackupEntry>> {
        let mut manifest = self.manifest.lock();
        let Some(entry) = manifest.entries.remove(&key(canonical_path)) else {
            return Ok(None);
        };
        manifest.updated_at = Utc::now();
        Self::write_manifest(&self.manifest_path, &manifest)?;
        drop(manifest);

        let blob_path = self.blob_path(&entry.reference);
        if let Err(e) = fs::remove_file(&blob_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %blob_path.display(), error = %e, "cannot remove backup blob");
            }
        }
        Ok(Some(entry))
    }

    // ── Private helpers ─────────────────────────────────────────────────────

    fn blob_path(&self, reference: &str) -> PathBuf {
        let prefix = &reference[0..2.min(reference.len())];
        self.blobs_root.join(prefix).join(format!("{}.blob", reference))
    }

    fn write_blob_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
        }
        let staging_path = self.staging_root.join(format!("{}.staging", Uuid::new_v4()));
        {
            let mut file =
                File::create(&staging_path).map_err(|e| GuardError::io(&staging_path, e))?;
            file.write_all(bytes)
                .and_then(|_| file.sync_all())
                .map_err(|e| GuardError::io(&staging_path, e))?;
        }
        fs::rename(&staging_path, dest).map_err(|e| GuardError::io(dest, e))?;
        if let Some(parent) = dest.parent() {
            Self::fsync_dir(parent);
        }
        Ok(())
    }

    fn write_manifest(path: &Path, manifest: &BackupManifest) -> Result<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(path, json).map_err(|e| GuardError::io(path, e))
    }

    fn restrict_dir_permissions(path: &Path) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
                warn!("cannot restrict permissions on {}: {}", path.display(), e);
            }
        }
        #[cfg(not(unix))]
        let _ = path;
    }

    /// Remove any leftover `.staging` files from a previous crash.
    fn cleanup_staging_dir(staging_root: &Path) {
        if let Ok(entries) = fs::read_dir(staging_root) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().ends_with(".staging") {
                    warn!(path = %entry.path().display(), "removing orphaned backup staging file");
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    fn fsync_dir(path: &Path) {
        #[cfg(unix)]
        {
            if let Ok(dir) = OpenOptions::new().read(true).open(path) {
                let _ = dir.sync_all();
            }
        }
        #[cfg(not(unix))]
        let _ = path;
    }
}

impl BlobStore for BackupStore {
    fn get_encrypted_blob(&self, reference: &str) -> Result<Vec<u8>> {
        if reference.len() < 2 || !reference.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GuardError::NotFound(format!("backup reference {reference}")));
        }
        let blob_path = self.blob_path(reference);
        fs::read(&blob_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                GuardError::NotFound(format!("backup blob {reference}"))
            }
            _ => GuardError::io(&blob_path, e),
        })
    }
}

// ── Utility ────────────────────────────────────────────────────────────────

/// Deterministic backup reference for a canonical path.
pub fn reference_for(canonical_path: &Path) -> String {
    hex::encode(Sha256::digest(key(canonical_path).as_bytes()))
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_and_reload() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("protected").join("a.txt");
        let store = BackupStore::load_or_create(dir.path().join("backups")).unwrap();

        let entry = store.put_encrypted(&target, "abc123", b"sealed-bytes").unwrap();
        assert_eq!(entry.reference, reference_for(&target));
        assert_eq!(store.get_encrypted_blob(&entry.reference).unwrap(), b"sealed-bytes");

        // overwrite keeps a single entry
        store.put_encrypted(&target, "def456", b"newer").unwrap();
        assert_eq!(store.entries().len(), 1);

        let reopened = BackupStore::load_or_create(dir.path().join("backups")).unwrap();
        let entry = reopened.entry_for(&target).unwrap();
        assert_eq!(entry.baseline_hash, "def456");
        assert_eq!(reopened.get_encrypted_blob(&entry.reference).unwrap(), b"newer");
    }

    #[test]
    fn unknown_reference_is_not_found() {
        let dir = tempdir().unwrap();
        let store = BackupStore::load_or_create(dir.path()).unwrap();
        assert!(store.get_encrypted_blob(&"ab".repeat(32)).unwrap_err().is_not_found());
        assert!(store.get_encrypted_blob("../../etc/passwd").unwrap_err().is_not_found());
    }

    #[test]
    fn remove_drops_blob() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("b.txt");
        let store = BackupStore::load_or_create(dir.path().join("backups")).unwrap();
        let entry = store.put_encrypted(&target, "h", b"x").unwrap();

        assert_eq!(store.remove(&target).unwrap(), Some(entry.clone()));
        assert!(store.remove(&target).unwrap().is_none());
        assert!(store.get_encrypted_blob(&entry.reference).unwrap_err().is_not_found());
    }

    #[test]
    fn orphaned_staging_removed_on_open() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("backups");
        BackupStore::load_or_create(&root).unwrap();
        let orphan = root.join("staging").join("dead.staging");
        fs::write(&orphan, b"junk").unwrap();

        BackupStore::load_or_create(&root).unwrap();
        assert!(!orphan.exists());
    }
}

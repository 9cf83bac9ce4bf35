//! Protected registry: the authoritative map of monitored files.
//!
//! Keys are canonical absolute paths, so `./a.txt`, `a.txt` and
//! `/abs/dir/a.txt` all land on the same entry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtectedFile {
    pub path: PathBuf,
    pub baseline_hash: String,
    pub backup_ref: Option<String>,
    pub enrolled_at: DateTime<Utc>,
    pub last_processed: Option<DateTime<Utc>>,
    /// Unix permission bits at enrollment, reapplied on restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl ProtectedFile {
    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }
}

#[derive(Debug, Default)]
pub struct ProtectedRegistry {
    entries: Mutex<HashMap<PathBuf, ProtectedFile>>,
}

impl ProtectedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a file, overwriting any previous entry for the same canonical
    /// path. Always succeeds.
    pub fn add(&self, path: &Path, baseline_hash: &str, backup_ref: Option<String>) -> bool {
        let path = canonical_path(path);
        let entry = ProtectedFile {
            path: path.clone(),
            baseline_hash: baseline_hash.to_string(),
            backup_ref,
            enrolled_at: Utc::now(),
            last_processed: None,
            mode: file_mode(&path),
        };
        let replaced = self.entries.lock().insert(path.clone(), entry).is_some();
        info!(path = %path.display(), replaced, "file protected");
        true
    }

    pub fn remove(&self, path: &Path) -> bool {
        let path = canonical_path(path);
        let removed = self.entries.lock().remove(&path).is_some();
        if removed {
            info!(path = %path.display(), "file unprotected");
        }
        removed
    }

    pub fn lookup(&self, path: &Path) -> Option<ProtectedFile> {
        let entries = self.entries.lock();
        entries
            .get(path)
            .or_else(|| entries.get(&canonical_path(path)))
            .cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lookup(path).is_some()
    }

    /// Record that a notification for `path` made it through the gate.
    pub fn mark_processed(&self, path: &Path, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.last_processed = Some(at);
        }
    }

    /// All entries ordered by path.
    pub fn snapshot(&self) -> Vec<ProtectedFile> {
        let mut files: Vec<ProtectedFile> = self.entries.lock().values().cloned().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    /// Distinct parent directories of every entry: the watch set.
    pub fn directories(&self) -> BTreeSet<PathBuf> {
        self.entries
            .lock()
            .keys()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Canonical absolute form of `path`. Works for files that do not exist
/// (yet, or any more) by canonicalizing the parent directory instead.
pub fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

/// Permission bits of the file at `path`, if it exists. Always `None` off
/// unix.
pub fn file_mode(path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .ok()
            .map(|meta| meta.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn add_overwrites_same_canonical_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let dotted = dir.path().join(".").join("a.txt");

        let registry = ProtectedRegistry::new();
        assert!(registry.add(&file, "H0", Some("B1".into())));
        assert!(registry.add(&dotted, "H1", None));

        assert_eq!(registry.len(), 1);
        let entry = registry.lookup(&file).unwrap();
        assert_eq!(entry.baseline_hash, "H1");
        assert_eq!(entry.backup_ref, None);
        assert_eq!(entry.path, file.canonicalize().unwrap());
    }

    #[test]
    fn remove_reports_absence() {
        let dir = tempdir().unwrap();
        let registry = ProtectedRegistry::new();
        let missing = dir.path().join("never-created.txt");

        assert!(!registry.remove(&missing));
        registry.add(&missing, "H", None);
        assert!(registry.contains(&missing));
        assert!(registry.remove(&missing));
        assert!(registry.is_empty());
    }

    #[test]
    fn directories_are_distinct_parents() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir_all(&sub).unwrap();

        let registry = ProtectedRegistry::new();
        registry.add(&dir.path().join("a"), "1", None);
        registry.add(&dir.path().join("b"), "2", None);
        registry.add(&sub.join("c"), "3", None);

        let dirs = registry.directories();
        assert_eq!(dirs.len(), 2);
        assert!(dirs.contains(&dir.path().canonicalize().unwrap()));
        assert!(dirs.contains(&sub.canonicalize().unwrap()));

        let names: Vec<String> = registry.snapshot().iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn mark_processed_sets_timestamp() {
        let dir = tempdir().unwrap();
        let registry = ProtectedRegistry::new();
        let path = canonical_path(&dir.path().join("f"));
        registry.add(&path, "h", None);
        assert!(registry.lookup(&path).unwrap().last_processed.is_none());

        let now = Utc::now();
        registry.mark_processed(&path, now);
        assert_eq!(registry.lookup(&path).unwrap().last_processed, Some(now));
    }

    #[cfg(unix)]
    #[test]
    fn add_records_permission_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let secret = dir.path().join("secret.conf");
        fs::write(&secret, b"k").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

        let registry = ProtectedRegistry::new();
        registry.add(&secret, "h", None);
        registry.add(&dir.path().join("missing"), "h", None);

        assert_eq!(registry.lookup(&secret).unwrap().mode, Some(0o600));
        assert_eq!(registry.lookup(&dir.path().join("missing")).unwrap().mode, None);
    }
}

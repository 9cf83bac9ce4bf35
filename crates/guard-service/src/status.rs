use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::integrity::registry::ProtectedFile;

/// Characters of the baseline digest shown in a file summary.
const HASH_PREVIEW_CHARS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub path: PathBuf,
    pub file_name: String,
    pub hash_preview: String,
}

impl From<&ProtectedFile> for FileSummary {
    fn from(entry: &ProtectedFile) -> Self {
        Self {
            path: entry.path.clone(),
            file_name: entry.file_name(),
            hash_preview: hash_preview(&entry.baseline_hash),
        }
    }
}

/// Point-in-time view of the monitor, safe to serialize for outer layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub protected_count: usize,
    pub directory_count: usize,
    pub directories: Vec<PathBuf>,
    pub unwatched: Vec<PathBuf>,
    pub files: Vec<FileSummary>,
}

fn hash_preview(hash: &str) -> String {
    if hash.is_empty() {
        return "N/A".to_string();
    }
    let head: String = hash.chars().take(HASH_PREVIEW_CHARS).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_digest() {
        let digest = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        assert_eq!(hash_preview(digest), "b94d27b9934d3e08...");
        assert_eq!(hash_preview(""), "N/A");
    }
}

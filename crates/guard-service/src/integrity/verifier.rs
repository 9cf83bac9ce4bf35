//! Integrity verifier.
//!
//! Runs after the cooldown gate opens. Classifies the current state of a
//! protected file against its baseline digest and records the outcome in the
//! event log. Restores are the caller's job.

use guard_core::crypto::CryptoProvider;
use guard_core::event_log::{EventKind, EventLog};
use guard_core::settings::PreviewSettings;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::enforcement::restore::RestoreReason;
use crate::integrity::registry::ProtectedFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Content matches the baseline.
    Intact,
    /// The file is gone.
    Deleted,
    /// Content differs from the baseline.
    Tampered { actual_hash: String },
    /// The file exists but could not be hashed (vanished or unreadable
    /// mid-check). Never restored.
    Unreadable,
    /// The entry carries no baseline digest to compare against.
    NoBaseline,
}

pub struct IntegrityVerifier {
    crypto: Arc<dyn CryptoProvider>,
    events: Arc<EventLog>,
    preview: PreviewSettings,
}

impl IntegrityVerifier {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        events: Arc<EventLog>,
        preview: PreviewSettings,
    ) -> Self {
        Self {
            crypto,
            events,
            preview,
        }
    }

    pub fn verify(&self, entry: &ProtectedFile) -> Verdict {
        let name = entry.file_name();
        let path = entry.path.as_path();

        if !exists(path) {
            self.events.append(
                EventKind::Violation,
                format!(
                    "Protected file deleted: {name} (reason: {})",
                    RestoreReason::Deleted
                ),
                Some(path),
            );
            return Verdict::Deleted;
        }

        if entry.baseline_hash.trim().is_empty() {
            self.events.append(
                EventKind::Warning,
                format!("Expected hash not found: {name}"),
                Some(path),
            );
            return Verdict::NoBaseline;
        }

        let actual_hash = match self.crypto.hash_file(path) {
            Ok(hash) => hash,
            Err(e) => {
                self.events.append(
                    EventKind::Error,
                    format!("Current hash could not be calculated: {name} - {e}"),
                    Some(path),
                );
                return Verdict::Unreadable;
            }
        };

        if actual_hash.eq_ignore_ascii_case(&entry.baseline_hash) {
            self.events.append(
                EventKind::Success,
                format!("Integrity verified: {name}"),
                Some(path),
            );
            return Verdict::Intact;
        }

        let preview = forensic_preview(path, &self.preview);
        self.events.append(
            EventKind::Violation,
            format!(
                "INTEGRITY VIOLATION: {name} - hash mismatch (reason: {}). Attempted content: \"{preview}\"",
                RestoreReason::Modified
            ),
            Some(path),
        );
        Verdict::Tampered { actual_hash }
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Bounded description of what a file currently contains.
///
/// Text is shown verbatim up to `text_chars` characters followed by `...`
/// when longer. Anything that is not UTF-8 is shown as
/// `[Binary data: <hex>...]` built from the first `binary_bytes` bytes.
/// Never reads more than `text_chars * 4 + 4` bytes.
pub fn forensic_preview(path: &Path, limits: &PreviewSettings) -> String {
    let read_cap = limits.text_chars.saturating_mul(4).saturating_add(4);
    let mut buf = Vec::with_capacity(read_cap.min(64 * 1024));
    let read = File::open(path).and_then(|f| f.take(read_cap as u64).read_to_end(&mut buf));
    if let Err(e) = read {
        return format!("[Could not read: {e}]");
    }
    let truncated_read = buf.len() == read_cap;

    let text = match std::str::from_utf8(&buf) {
        Ok(s) => Some(s),
        // a multi-byte character cut by the read cap is still text
        Err(e) if truncated_read && e.error_len().is_none() => {
            std::str::from_utf8(&buf[..e.valid_up_to()]).ok()
        }
        Err(_) => None,
    };

    match text {
        Some(text) => {
            let mut chars = text.char_indices();
            match chars.nth(limits.text_chars) {
                Some((cut, _)) => format!("{}...", &text[..cut]),
                None if truncated_read => format!("{text}..."),
                None => text.to_string(),
            }
        }
        None => {
            let head = &buf[..buf.len().min(limits.binary_bytes)];
            let mut hex = hex::encode(head);
            hex.truncate(limits.hex_chars);
            format!("[Binary data: {hex}...]")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn limits() -> PreviewSettings {
        PreviewSettings::default()
    }

    #[test]
    fn short_text_is_verbatim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "hacked!").unwrap();
        assert_eq!(forensic_preview(&path, &limits()), "hacked!");
    }

    #[test]
    fn long_text_is_truncated_with_marker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "x".repeat(10_000)).unwrap();
        let preview = forensic_preview(&path, &limits());
        assert_eq!(preview.len(), 503);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn multibyte_text_cut_on_char_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "ğ".repeat(3_000)).unwrap();
        let preview = forensic_preview(&path, &limits());
        assert_eq!(preview.chars().count(), 503);
        assert!(preview.starts_with("ğğğ"));
    }

    #[test]
    fn binary_shown_as_hex_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data: Vec<u8> = (0..=255u8).rev().collect();
        fs::write(&path, &data).unwrap();
        let preview = forensic_preview(&path, &limits());
        assert!(preview.starts_with("[Binary data: fffefdfc"));
        assert_eq!(preview.len(), "[Binary data: ".len() + 100 + "...]".len());
    }

    #[test]
    fn missing_file_reports_read_failure() {
        let dir = tempdir().unwrap();
        let preview = forensic_preview(&dir.path().join("gone"), &limits());
        assert!(preview.starts_with("[Could not read:"));
    }
}

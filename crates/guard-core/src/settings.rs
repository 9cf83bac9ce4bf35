use crate::error::{GuardError, Result};
use crate::hasher::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewSettings {
    /// Characters of tampered text shown before the truncation marker.
    pub text_chars: usize,
    /// Leading bytes read from binary content.
    pub binary_bytes: usize,
    /// Hex characters of those bytes kept in the preview.
    pub hex_chars: usize,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            text_chars: 500,
            binary_bytes: 200,
            hex_chars: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub cooldown_secs: u64,
    pub event_capacity: usize,
    pub stop_timeout_secs: u64,
    pub hash_algorithm: HashAlgorithm,
    pub hash_chunk_bytes: usize,
    pub preview: PreviewSettings,
    pub event_journal: Option<PathBuf>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 5,
            event_capacity: 100,
            stop_timeout_secs: 5,
            hash_algorithm: HashAlgorithm::Sha256,
            hash_chunk_bytes: 64 * 1024,
            preview: PreviewSettings::default(),
            event_journal: None,
        }
    }
}

impl MonitorSettings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings: Self = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(GuardError::io(path, e)),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| GuardError::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(GuardError::Configuration(
                "event capacity must be at least 1".into(),
            ));
        }
        if self.stop_timeout_secs == 0 {
            return Err(GuardError::Configuration(
                "stop timeout must be at least 1 second".into(),
            ));
        }
        if self.hash_chunk_bytes < 512 {
            return Err(GuardError::Configuration(
                "hash chunk must be at least 512 bytes".into(),
            ));
        }
        if self.preview.text_chars == 0
            || self.preview.binary_bytes == 0
            || self.preview.hex_chars == 0
        {
            return Err(GuardError::Configuration(
                "preview limits must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = MonitorSettings::load(dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, MonitorSettings::default());
        assert_eq!(settings.cooldown(), Duration::from_secs(5));
        assert_eq!(settings.event_capacity, 100);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"cooldown_secs": 2, "hash_algorithm": "blake3"}"#).unwrap();
        let settings = MonitorSettings::load(&path).unwrap();
        assert_eq!(settings.cooldown_secs, 2);
        assert_eq!(settings.hash_algorithm, HashAlgorithm::Blake3);
        assert_eq!(settings.preview.text_chars, 500);
    }

    #[test]
    fn zero_capacity_rejected() {
        let settings = MonitorSettings {
            event_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(GuardError::Configuration(_))
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = MonitorSettings {
            stop_timeout_secs: 9,
            ..Default::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(MonitorSettings::load(&path).unwrap(), settings);
    }
}

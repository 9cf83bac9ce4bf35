//! Error taxonomy shared by the guard crates.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { elapsed: Duration, what: &'static str },

    #[error("backup digest mismatch: expected {expected}, got {actual}")]
    BackupMismatch { expected: String, actual: String },

    #[error("watch error: {0}")]
    Watch(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GuardError {
    /// Wrap an I/O error with the path it happened on. `NotFound` I/O errors
    /// are folded into [`GuardError::NotFound`] so callers can branch on them.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        let path = path.as_ref();
        if source.kind() == std::io::ErrorKind::NotFound {
            return GuardError::NotFound(path.display().to_string());
        }
        GuardError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn timeout(elapsed: Duration, what: &'static str) -> Self {
        GuardError::Timeout { elapsed, what }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GuardError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_is_folded() {
        let err = GuardError::io(
            "/nope",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());

        let err = GuardError::io(
            "/nope",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, GuardError::Io { .. }));
        assert!(err.to_string().contains("/nope"));
    }
}

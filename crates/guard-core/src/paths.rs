use crate::error::{GuardError, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "file-guard";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("GUARD_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| GuardError::Configuration("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn key_path(data_dir: &Path) -> PathBuf {
    data_dir.join("secret.key")
}

pub fn backup_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("backups")
}

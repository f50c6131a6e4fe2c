pub mod settings;

pub use settings::{GitSettings, ReviewSettings, Settings};

use crate::errors::{Result, TrellisError};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the repo-local directory holding trellis state and configuration
pub const DATA_DIR: &str = ".trellis";

/// Get the trellis data directory for a repository
pub fn data_dir(repo_path: &Path) -> PathBuf {
    repo_path.join(DATA_DIR)
}

/// Ensure the data directory exists
pub fn ensure_data_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            TrellisError::config(format!("Failed to create data directory: {e}"))
        })?;
    }
    Ok(())
}

/// Check if a repository has been initialized for trellis
pub fn is_repo_initialized(repo_path: &Path) -> bool {
    let dir = data_dir(repo_path);
    dir.exists() && dir.join("config.json").exists()
}

/// Initialize a repository: create the data directory and a default config
pub fn initialize_repo(repo_path: &Path, review_url: Option<String>) -> Result<()> {
    let dir = data_dir(repo_path);
    ensure_data_dir(&dir)?;

    let settings = Settings::default_for_repo(review_url);
    settings.save_to_file(&dir.join("config.json"))?;

    tracing::info!("Initialized trellis repository at {}", repo_path.display());
    Ok(())
}

/// Load settings for an initialized repository
pub fn load_settings(repo_path: &Path) -> Result<Settings> {
    let path = data_dir(repo_path).join("config.json");
    if !path.exists() {
        return Err(TrellisError::config(format!(
            "repository at {} is not initialized for trellis; run initialize_repo first",
            repo_path.display()
        )));
    }
    Settings::load_from_file(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_initialize_and_load() {
        let tmp = TempDir::new().unwrap();
        assert!(!is_repo_initialized(tmp.path()));

        initialize_repo(tmp.path(), Some("https://review.example.com".to_string())).unwrap();
        assert!(is_repo_initialized(tmp.path()));

        let settings = load_settings(tmp.path()).unwrap();
        assert_eq!(settings.review.base_url, "https://review.example.com");
        assert_eq!(settings.git.trunk, "main");
    }

    #[test]
    fn test_load_uninitialized_fails() {
        let tmp = TempDir::new().unwrap();
        let result = load_settings(tmp.path());
        assert!(matches!(result, Err(TrellisError::Config(_))));
    }
}

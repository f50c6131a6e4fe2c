use crate::errors::{Result, TrellisError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// All configuration for one repository.
///
/// Values are loaded once per invocation and passed into the gateways and
/// the sync coordinator at construction time; nothing here is global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub git: GitSettings,
    pub review: ReviewSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSettings {
    /// Remote the sync workflow fetches from and pushes to
    pub remote: String,
    /// Trunk branch all stacks ultimately target
    pub trunk: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    /// Offer deletion of merged branches' local refs after a clean sync
    pub delete_merged_branches: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSettings {
    /// Base URL of the review service
    pub base_url: String,
    /// Project/namespace key on the review service
    pub project: String,
    /// Repository slug on the review service
    pub repo: String,
    pub username: Option<String>,
    pub token: Option<String>,
    /// How long batched status results stay fresh
    pub status_cache_ttl_secs: u64,
    /// Bound on concurrent read-only status requests
    pub max_concurrent_requests: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            git: GitSettings::default(),
            review: ReviewSettings::default(),
        }
    }
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            trunk: "main".to_string(),
            author_name: None,
            author_email: None,
            delete_merged_branches: true,
        }
    }
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            base_url: "https://review.example.com".to_string(),
            project: "PROJECT".to_string(),
            repo: "repo".to_string(),
            username: None,
            token: None,
            status_cache_ttl_secs: 60,
            max_concurrent_requests: 4,
        }
    }
}

impl Settings {
    /// Create default settings for a repository
    pub fn default_for_repo(review_url: Option<String>) -> Self {
        let mut settings = Self::default();
        if let Some(url) = review_url {
            settings.review.base_url = url;
        }
        settings
    }

    /// Load settings from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| TrellisError::config(format!("Failed to read config file: {e}")))?;

        let settings: Settings = serde_json::from_str(&content)
            .map_err(|e| TrellisError::config(format!("Failed to parse config file: {e}")))?;

        Ok(settings)
    }

    /// Save settings to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TrellisError::config(format!("Failed to serialize config: {e}")))?;

        fs::write(path, content)
            .map_err(|e| TrellisError::config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.review.base_url.is_empty() {
            url::Url::parse(&self.review.base_url).map_err(|e| {
                TrellisError::config(format!(
                    "Invalid review service URL '{}': {e}",
                    self.review.base_url
                ))
            })?;
        }

        if self.git.trunk.is_empty() {
            return Err(TrellisError::config("Trunk branch name must not be empty"));
        }

        if self.git.remote.is_empty() {
            return Err(TrellisError::config("Remote name must not be empty"));
        }

        if self.review.max_concurrent_requests == 0 {
            return Err(TrellisError::config(
                "max_concurrent_requests must be at least 1",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.git.remote, "origin");
        assert_eq!(settings.git.trunk, "main");
        assert_eq!(settings.review.status_cache_ttl_secs, 60);
        settings.validate().unwrap();
    }

    #[test]
    fn test_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        let mut settings = Settings::default();
        settings.git.trunk = "develop".to_string();
        settings.review.token = Some("secret".to_string());
        settings.save_to_file(&path).unwrap();

        let loaded = Settings::load_from_file(&path).unwrap();
        assert_eq!(loaded.git.trunk, "develop");
        assert_eq!(loaded.review.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut settings = Settings::default();
        settings.review.base_url = "not a url".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut settings = Settings::default();
        settings.review.max_concurrent_requests = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::load_from_file(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(settings.git.remote, "origin");
    }
}

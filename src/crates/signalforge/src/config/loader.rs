//! Configuration loader with dual-location support
//!
//! Loads configuration from:
//! 1. Default values
//! 2. User-level config: ~/.signalforge/signalforge.toml
//! 3. Project-level config: ./.signalforge/signalforge.toml
//! 4. `SIGNALFORGE_*` environment overrides
//!
//! Later layers override earlier ones key by key; keys a layer leaves out
//! keep the value from the layer below.

use crate::config::schema::{merge_tables, SignalforgeConfig};
use crate::error::{Result, SignalError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const CONFIG_DIR: &str = ".signalforge";
const CONFIG_FILE: &str = "signalforge.toml";

/// Configuration loader that handles both user and project configs
pub struct ConfigLoader {
    user_config_path: Option<PathBuf>,
    project_config_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self {
            user_config_path: dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE)),
            project_config_path: PathBuf::from(CONFIG_DIR).join(CONFIG_FILE),
        }
    }

    /// Create a loader reading from explicit locations
    pub fn with_paths(user_config_path: Option<PathBuf>, project_config_path: PathBuf) -> Self {
        Self {
            user_config_path,
            project_config_path,
        }
    }

    /// Load configuration from all layers
    pub async fn load(&self) -> Result<SignalforgeConfig> {
        let mut layered = toml::Table::new();
        info!("Loading configuration with defaults");

        if let Some(user_path) = &self.user_config_path {
            if let Some(user_table) = self.load_optional(user_path).await? {
                debug!(path = %user_path.display(), "Loaded user-level config");
                merge_tables(&mut layered, user_table);
            } else {
                debug!(path = %user_path.display(), "User-level config not found, using defaults");
            }
        }

        if let Some(project_table) = self.load_optional(&self.project_config_path).await? {
            debug!(path = %self.project_config_path.display(), "Loaded project-level config");
            merge_tables(&mut layered, project_table);
        } else {
            debug!(path = %self.project_config_path.display(), "Project-level config not found");
        }

        let mut config = SignalforgeConfig::from_table(layered)?;
        config.resolve_env_vars();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Read a config layer as a raw table; a missing file is `None`, a
    /// malformed one is an error
    async fn load_optional(&self, path: &Path) -> Result<Option<toml::Table>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::read_table(path).await.map(Some)
    }

    async fn read_table(path: &Path) -> Result<toml::Table> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            SignalError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from a specific path
    pub async fn load_from_path(path: &Path) -> Result<SignalforgeConfig> {
        SignalforgeConfig::from_table(Self::read_table(path).await?)
    }

    pub fn user_config_path(&self) -> Option<&Path> {
        self.user_config_path.as_deref()
    }

    pub fn project_config_path(&self) -> &Path {
        &self.project_config_path
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from the standard locations
pub async fn load_config() -> Result<SignalforgeConfig> {
    ConfigLoader::new().load().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_paths() {
        let loader = ConfigLoader::new();
        assert!(loader
            .project_config_path()
            .ends_with(".signalforge/signalforge.toml"));
        if let Some(user_path) = loader.user_config_path() {
            assert!(user_path.ends_with(".signalforge/signalforge.toml"));
        }
    }

    #[tokio::test]
    async fn test_load_returns_defaults_when_no_files() {
        let temp_dir = TempDir::new().unwrap();
        let loader = ConfigLoader::with_paths(
            Some(temp_dir.path().join("missing-user.toml")),
            temp_dir.path().join("missing-project.toml"),
        );
        let config = loader.load().await.unwrap();
        assert_eq!(config.provider.base_url, "https://api.openai.com/v1");
        assert_eq!(config.cache.max_entries, 1_024);
    }

    #[tokio::test]
    async fn test_project_overrides_user() {
        let temp_dir = TempDir::new().unwrap();
        let user_path = temp_dir.path().join("user.toml");
        let project_path = temp_dir.path().join("project.toml");

        fs::write(
            &user_path,
            r#"
[provider]
model = "gpt-4o"

[budget]
daily_limit = 10000
"#,
        )
        .await
        .unwrap();
        fs::write(
            &project_path,
            r#"
[budget]
daily_limit = 2500
warning_threshold = 0.5
"#,
        )
        .await
        .unwrap();

        let loader = ConfigLoader::with_paths(Some(user_path), project_path);
        let config = loader.load().await.unwrap();

        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.budget.daily_limit, 2500);
        assert_eq!(config.budget.warning_threshold, 0.5);
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let project_path = temp_dir.path().join("project.toml");
        fs::write(&project_path, "[budget\ndaily_limit = ").await.unwrap();

        let loader = ConfigLoader::with_paths(None, project_path);
        assert!(matches!(loader.load().await, Err(SignalError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_values_fail_validation() {
        let temp_dir = TempDir::new().unwrap();
        let project_path = temp_dir.path().join("project.toml");
        fs::write(&project_path, "[dispatch]\nmax_attempts = 0\n")
            .await
            .unwrap();

        let loader = ConfigLoader::with_paths(None, project_path);
        assert!(loader.load().await.is_err());
    }
}

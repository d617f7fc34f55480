//! Configuration loading for wrangler.toml
//!
//! The file is created with default values on first run. `WRANGLER_CONFIG`
//! points the program at a different file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::dataset::export::default_projects_dir;
use crate::dataset::flickr::api::{DEFAULT_BASE_URL, DEFAULT_PER_PAGE};

/// Default configuration file name
pub const CONFIG_FILE: &str = "wrangler.toml";

/// Environment variable overriding the configuration path
pub const CONFIG_ENV: &str = "WRANGLER_CONFIG";

const PLACEHOLDER_API_KEY: &str = "your_api_key_here";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Paths {
    pub download_directory: String,
    pub log_directory: String,
    /// Labeling tool projects; the platform default when unset
    pub projects_directory: Option<String>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            download_directory: "./datasets".to_string(),
            log_directory: "./logs".to_string(),
            projects_directory: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Pools {
    /// Download workers; 0 means one per CPU
    pub max_download_concurrency: usize,
    /// Page fetch and metadata task group width
    pub max_search_concurrency: usize,
}

impl Default for Pools {
    fn default() -> Self {
        Self {
            max_download_concurrency: 0,
            max_search_concurrency: 8,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Network {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Flickr {
    pub api_key: String,
    pub base_url: String,
    pub per_page: u32,
    /// Image size suffix (`z` is 640px on the longest side)
    pub size: String,
}

impl Default for Flickr {
    fn default() -> Self {
        Self {
            api_key: PLACEHOLDER_API_KEY.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            per_page: DEFAULT_PER_PAGE,
            size: "z".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// `json` or `line`
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            log_to_terminal: false,
            log_to_file: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub pools: Pools,
    pub network: Network,
    pub flickr: Flickr,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Where labeling projects are read from, if anywhere
    pub fn projects_directory(&self) -> Option<PathBuf> {
        self.paths
            .projects_directory
            .as_ref()
            .map(PathBuf::from)
            .or_else(default_projects_dir)
    }

    /// False until the placeholder key has been replaced
    pub fn has_flickr_api_key(&self) -> bool {
        !self.flickr.api_key.is_empty() && self.flickr.api_key != PLACEHOLDER_API_KEY
    }
}

/// Owns the configuration file and the values loaded from it
pub struct ConfigManager {
    app_config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load `path`, writing the defaults there first if it does not exist
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_path = path.as_ref().to_path_buf();

        let app_config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            warn!("Config file not found: {}", config_path.display());
            let default_config = AppConfig::default();
            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&config_path, toml::to_string_pretty(&default_config)?)?;
            info!("Created {} with default values", config_path.display());
            default_config
        };

        Ok(Self {
            app_config: Arc::new(RwLock::new(app_config)),
            config_path,
        })
    }

    /// The configuration path: `WRANGLER_CONFIG` if set, else `wrangler.toml` in the working directory
    pub fn default_path() -> PathBuf {
        env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    // Get app config
    pub fn get_app_config(&self) -> AppConfig {
        self.app_config.read().clone()
    }

    // Save app config to file
    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        let toml_string = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, toml_string)?;

        // Update the in-memory config
        *self.app_config.write() = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join(CONFIG_FILE);

        let manager = ConfigManager::load(&path).unwrap();

        assert!(path.is_file());
        assert_eq!(manager.get_app_config(), AppConfig::default());
        let reloaded = ConfigManager::load(&path).unwrap();
        assert_eq!(reloaded.get_app_config(), AppConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[pools]\nmax_download_concurrency = 3\n\n[flickr]\napi_key = \"abc\"\n").unwrap();

        let config = ConfigManager::load(&path).unwrap().get_app_config();

        assert_eq!(config.pools.max_download_concurrency, 3);
        assert_eq!(config.pools.max_search_concurrency, 8);
        assert_eq!(config.flickr.per_page, 250);
        assert_eq!(config.network.timeout_secs, 30);
        assert!(config.has_flickr_api_key());
    }

    #[test]
    fn test_parse_failure_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[pools\nbroken").unwrap();

        assert!(matches!(ConfigManager::load(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_save_updates_memory_and_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let manager = ConfigManager::load(&path).unwrap();

        let mut config = manager.get_app_config();
        assert!(!config.has_flickr_api_key());
        config.flickr.api_key = "real".to_string();
        manager.save_app_config(&config).unwrap();

        assert!(manager.get_app_config().has_flickr_api_key());
        assert!(ConfigManager::load(&path).unwrap().get_app_config().has_flickr_api_key());
    }
}

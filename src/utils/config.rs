//! Configuration management for cryptobox.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::crypto::MAX_PREKEY_ID;
use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "cryptobox.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "CRYPTOBOX";

/// Default number of one-time prekeys generated per batch
pub const DEFAULT_PREKEY_BATCH_SIZE: u16 = 100;

/// Complete configuration for a cryptobox instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptoboxConfig {
    /// Storage configuration
    pub storage: StorageConfig,
    /// Prekey generation settings
    pub prekeys: PreKeyConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// File holding the local identity keypair
    pub identity_file: PathBuf,
    /// Directory for session storage
    pub sessions_dir: PathBuf,
    /// Directory for prekey storage
    pub prekeys_dir: PathBuf,
}

/// Prekey generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyConfig {
    /// Number of one-time prekeys generated per batch
    pub batch_size: u16,
    /// Also generate the last-resort prekey when generating a batch
    pub generate_last_resort: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl StorageConfig {
    /// Storage layout rooted at `data_dir`
    pub fn under<P: Into<PathBuf>>(data_dir: P) -> Self {
        let data_dir = data_dir.into();
        Self {
            identity_file: data_dir.join("identity"),
            sessions_dir: data_dir.join("sessions"),
            prekeys_dir: data_dir.join("prekeys"),
            data_dir,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cryptobox");
        Self::under(data_dir)
    }
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_PREKEY_BATCH_SIZE,
            generate_last_resort: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CryptoboxConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("cryptobox")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|l| l.exists()) {
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Re-root every storage path under a new data directory
    pub fn with_data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        self.storage = StorageConfig::under(data_dir);
        self
    }

    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self = self.with_data_dir(data_dir);
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(size) = std::env::var(format!("{ENV_PREFIX}_PREKEYS_BATCH_SIZE")) {
            self.prekeys.batch_size = size.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_PREKEYS_BATCH_SIZE"),
                value: size,
            })?;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.prekeys.batch_size == 0 || self.prekeys.batch_size == MAX_PREKEY_ID {
            return Err(ConfigError::InvalidValue {
                field: "prekeys.batch_size".to_string(),
                value: self.prekeys.batch_size.to_string(),
            }
            .into());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: self.logging.level.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs_to_create = [
            &self.storage.data_dir,
            &self.storage.sessions_dir,
            &self.storage.prekeys_dir,
        ];

        for dir in &dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = CryptoboxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.prekeys.batch_size, DEFAULT_PREKEY_BATCH_SIZE);
        assert!(config.prekeys.generate_last_resort);
        assert!(config.storage.sessions_dir.starts_with(&config.storage.data_dir));
        assert!(config.storage.prekeys_dir.starts_with(&config.storage.data_dir));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = CryptoboxConfig::default();
        config.prekeys.batch_size = 25;
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = CryptoboxConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.prekeys.batch_size, 25);
        assert_eq!(loaded.storage.data_dir, config.storage.data_dir);
    }

    #[test]
    fn test_config_validation() {
        let mut config = CryptoboxConfig::default();
        config.prekeys.batch_size = 0;
        assert!(config.validate().is_err());

        config = CryptoboxConfig::default();
        config.prekeys.batch_size = MAX_PREKEY_ID;
        assert!(config.validate().is_err());

        config = CryptoboxConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = CryptoboxConfig::default().with_data_dir(dir.path());

        assert_eq!(config.storage.identity_file, dir.path().join("identity"));
        config.ensure_directories().unwrap();
        assert!(config.storage.sessions_dir.is_dir());
        assert!(config.storage.prekeys_dir.is_dir());
    }

    #[test]
    fn test_missing_file() {
        let result = CryptoboxConfig::from_file("/nonexistent/cryptobox.toml");
        assert!(result.is_err());
    }
}

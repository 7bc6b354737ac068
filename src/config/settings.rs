//! Application settings

use crate::core::session::SessionSettings;
use crate::core::transfer::XmodemConfig;
use crate::core::transport::SerialConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed
    #[error("Config I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("Invalid config file {path}: {source}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },

    /// Serializing the configuration failed
    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("Invalid setting {field}: {reason}")]
    Invalid {
        /// Setting name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial port defaults
    pub serial: SerialConfig,
    /// Session behaviour
    pub session: SessionSettings,
    /// XMODEM retry and timeout policy
    pub xmodem: XmodemConfig,
    /// Diagnostics and transcripts
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load config from `path`, or the defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from the platform config directory
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        Self::load(&path)
    }

    /// Save config to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, content).map_err(io_err)
    }

    /// Reject settings the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.serial.baud_rate == 0 {
            return invalid("serial.baud_rate", "must be greater than zero");
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return invalid("serial.data_bits", "must be between 5 and 8");
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return invalid("serial.stop_bits", "must be 1 or 2");
        }
        if self.session.poll_interval_ms == 0 {
            return invalid("session.poll_interval_ms", "must be greater than zero");
        }
        if self.session.max_line_length == 0 {
            return invalid("session.max_line_length", "must be greater than zero");
        }
        if self.xmodem.retry_limit == 0 {
            return invalid("xmodem.retry_limit", "must be greater than zero");
        }
        if self.xmodem.block_timeout_ms == 0 || self.xmodem.start_timeout_ms == 0 || self.xmodem.start_nak_interval_ms == 0 {
            return invalid("xmodem", "timeouts must be greater than zero");
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Write a session transcript by default
    pub transcript: bool,
    /// Transcript directory
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            transcript: false,
            directory: super::log_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::LineEnding;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.session.line_ending, LineEnding::CrLf);
        assert_eq!(config.xmodem.retry_limit, 10);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.serial.port = "/dev/ttyUSB0".into();
        config.serial.baud_rate = 2400;
        config.session.allow_transfer_in_command_mode = true;
        config.xmodem.pad_byte = 0x1A;
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[xmodem]\nretry_limit = 3\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.xmodem.retry_limit, 3);
        assert_eq!(config.xmodem.block_timeout_ms, 10_000);
        assert_eq!(config.serial.baud_rate, 9600);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.xmodem.retry_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "xmodem.retry_limit",
                ..
            })
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[serial]\nbaud_rate = 0\n").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Invalid { .. })));

        std::fs::write(&path, "not = [valid").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}

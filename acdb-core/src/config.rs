//! # Configuration Management
//!
//! Handles all configuration for the calibration database runtime.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hard ceiling on concurrently loaded databases
pub const MAX_DATABASES: usize = 16;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub search: SearchConfig,
    pub delta: DeltaConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text).map_err(|e| Error::Configuration {
            message: format!("{}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.max_databases == 0 || self.database.max_databases > MAX_DATABASES {
            return Err(Error::Configuration {
                message: format!(
                    "max_databases must be within 1..={}, got {}",
                    MAX_DATABASES, self.database.max_databases
                ),
            });
        }
        if self.search.scratch_buffer_size < 4 {
            return Err(Error::Configuration {
                message: "scratch_buffer_size must hold at least one word".to_string(),
            });
        }
        if self.delta.persist && self.delta.delta_dir.as_os_str().is_empty() {
            return Err(Error::Configuration {
                message: "delta persistence enabled without a delta_dir".to_string(),
            });
        }
        Ok(())
    }
}

/// Database loading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_databases: usize,
    /// Verify the chunk directory checksum on load
    pub verify_checksum: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_databases: MAX_DATABASES,
            verify_checksum: true,
        }
    }
}

/// Table search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Scratch buffer size for partitioned searches (bytes)
    pub scratch_buffer_size: usize,
    /// Tables larger than this are searched partition by partition (bytes)
    pub partition_threshold: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            scratch_buffer_size: 4 * 1024, // 4KB
            partition_threshold: 64 * 1024, // 64KB
        }
    }
}

/// Delta (runtime override) persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    pub persist: bool,
    pub delta_dir: PathBuf,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            persist: false,
            delta_dir: PathBuf::from("./delta"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

//! Bootstrap configuration loading and config file resolution
//!
//! Runtime tunables live in the `settings` table (see the engine's
//! `RuntimeSettings`); this file only covers what is needed before the
//! database is open.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the bootstrap TOML file
pub const CONFIG_ENV_VAR: &str = "GRADES_CONFIG";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct GradesConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory of course structure snapshots (`*.json`)
    #[serde(default)]
    pub structure_dir: Option<PathBuf>,

    /// Learner roster JSON file
    #[serde(default)]
    pub roster_path: Option<PathBuf>,

    /// Where generated reports are stored
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for GradesConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            structure_dir: None,
            roster_path: None,
            report_dir: default_report_dir(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("grades"))
        .unwrap_or_else(|| PathBuf::from("./grades_data"))
}

fn default_database_path() -> PathBuf {
    default_data_dir().join("grades.db")
}

fn default_report_dir() -> PathBuf {
    default_data_dir().join("reports")
}

impl GradesConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Load configuration from an explicit file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file {:?}: {}", path, e)))?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Resolve and load the bootstrap configuration
    ///
    /// A resolved path that does not exist falls back to defaults with a
    /// warning; a file that exists but fails to parse is an error.
    pub fn load(cli_arg: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_arg) {
            Some(path) if path.exists() => Self::from_file(&path),
            Some(path) => {
                warn!("Config file {:?} not found, using built-in defaults", path);
                Ok(Self::default())
            }
            None => {
                warn!("No config file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Config file resolution by priority:
/// 1. Command-line argument
/// 2. `GRADES_CONFIG` environment variable
/// 3. Platform config directory (`<config_dir>/grades/config.toml`), if present
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|d| d.join("grades").join("config.toml"))
        .filter(|p| p.exists())
}

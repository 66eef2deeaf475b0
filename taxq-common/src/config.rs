//! Configuration loading and root folder resolution
//!
//! Bootstrap settings are resolved in this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing TOML file is never fatal: the service logs a warning and runs on
//! defaults. A TOML file that exists but does not parse is an error.

use crate::db::Market;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ENV_ROOT_FOLDER: &str = "TAXQ_ROOT_FOLDER";

/// Database file created inside the root folder
pub const DATABASE_FILE_NAME: &str = "taxq.db";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Folder holding the database (overridden by CLI / environment)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Explicit database file; defaults to `<root_folder>/taxq.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Event consumer tuning
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Event consumer settings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Actor recorded in audit entries written by the consumer
    #[serde(default = "default_actor")]
    pub actor: String,

    /// Market assigned to events that do not name one
    #[serde(default = "default_market")]
    pub default_market: Market,

    /// Upper bound on a single poll of the event source
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Maximum total time spent retrying a locked database write
    #[serde(default = "default_max_lock_wait_ms")]
    pub max_lock_wait_ms: u64,

    /// Period of the factor recalculation pass; 0 disables it
    #[serde(default = "default_recalc_interval_secs")]
    pub recalc_interval_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            actor: default_actor(),
            default_market: default_market(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_lock_wait_ms: default_max_lock_wait_ms(),
            recalc_interval_secs: default_recalc_interval_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_actor() -> String {
    "system:event-consumer".to_string()
}

fn default_market() -> Market {
    Market::Acciones
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_max_lock_wait_ms() -> u64 {
    5000
}

fn default_recalc_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Load from a file that must exist
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Load from an explicit path, or from the platform default location
    ///
    /// An explicit path that does not exist is an error. A missing default
    /// file yields built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let config = Self::load(path)?;
            info!("Loaded configuration from {}", path.display());
            return Ok(config);
        }

        match default_config_path() {
            Some(path) if path.exists() => {
                let config = Self::load(&path)?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            _ => {
                warn!("No configuration file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Resolve the root folder (CLI > environment > TOML > compiled default)
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ENV_ROOT_FOLDER) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Resolve the database file (CLI > TOML > `<root>/taxq.db`)
pub fn resolve_database_path(
    cli_arg: Option<&Path>,
    toml: &TomlConfig,
    root_folder: &Path,
) -> PathBuf {
    cli_arg
        .map(Path::to_path_buf)
        .or_else(|| toml.database_path.clone())
        .unwrap_or_else(|| root_folder.join(DATABASE_FILE_NAME))
}

/// Platform configuration file location (`<config_dir>/taxq/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    if cfg!(target_os = "linux") {
        let user_config = dirs::config_dir().map(|d| d.join("taxq").join("config.toml"));
        if let Some(path) = user_config.filter(|p| p.exists()) {
            return Some(path);
        }
        Some(PathBuf::from("/etc/taxq/config.toml"))
    } else {
        dirs::config_dir().map(|d| d.join("taxq").join("config.toml"))
    }
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("taxq"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/taxq"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("taxq"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/taxq"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("taxq"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\taxq"))
    } else {
        PathBuf::from("./taxq_data")
    }
}

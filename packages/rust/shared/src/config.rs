//! Application configuration for Reservoir.
//!
//! User config lives at `~/.reservoir/reservoir.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReservoirError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "reservoir.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".reservoir";

// ---------------------------------------------------------------------------
// Config structs (matching reservoir.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database location and connection behaviour.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Ingest flow and clustering limits.
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one database file per tenant.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// How long a writer waits for a competing writer's lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Rows fetched per cursor page during reindex.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout_ms(),
            fetch_size: default_fetch_size(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.reservoir/data".into()
}
fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_fetch_size() -> u32 {
    50
}

/// `[ingest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Maximum per-record pipelines in flight.
    #[serde(default = "default_window")]
    pub window: usize,

    /// Match values longer than this many characters are truncated.
    #[serde(default = "default_match_value_max_length")]
    pub match_value_max_length: usize,

    /// Extra attempts for a per-record transaction after a storage conflict.
    #[serde(default = "default_retries")]
    pub retries: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            match_value_max_length: default_match_value_max_length(),
            retries: default_retries(),
        }
    }
}

fn default_window() -> usize {
    5
}
fn default_match_value_max_length() -> usize {
    600
}
fn default_retries() -> usize {
    1
}

impl AppConfig {
    /// Reject values that would stall or corrupt ingest.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.window == 0 {
            return Err(ReservoirError::config("ingest.window must be at least 1"));
        }
        if self.ingest.match_value_max_length == 0 {
            return Err(ReservoirError::config(
                "ingest.match_value_max_length must be at least 1",
            ));
        }
        if self.storage.fetch_size == 0 {
            return Err(ReservoirError::config("storage.fetch_size must be at least 1"));
        }
        Ok(())
    }

    /// Resolve `data_dir`, expanding a leading `~/`.
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.storage.data_dir)
    }

    /// Path of the database file for `tenant`.
    pub fn database_path(&self, tenant: &crate::TenantId) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(format!("{tenant}.db")))
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ReservoirError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.reservoir/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ReservoirError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.reservoir/reservoir.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ReservoirError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        ReservoirError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ReservoirError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ReservoirError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ReservoirError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

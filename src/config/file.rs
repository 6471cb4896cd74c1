//! TOML configuration file loading
//!
//! Supports `~/.config/voice-terminal/config.toml` as a persistent config source.
//! Every section and field is optional; missing values keep their defaults.

use std::path::{Path, PathBuf};

use super::Config;
use crate::Result;

/// Load the TOML config file from the standard path
///
/// Returns `Config::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> Config {
    let Some(path) = config_file_path() else {
        return Config::default();
    };

    if !path.exists() {
        return Config::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            Config::default()
        }
    }
}

/// Read and parse a specific config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Parse config from TOML text
///
/// # Errors
///
/// Returns error if the text is not valid TOML for the config schema
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/voice-terminal/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-terminal").join("config.toml"))
}

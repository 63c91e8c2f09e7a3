//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Like [`load_config`], but a missing file means defaults.
pub fn load_or_default(path: &Path) -> Result<ServerConfig, ConfigError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "No configuration file, using defaults");
        let config = ServerConfig::default();
        validate_config(&config).map_err(ConfigError::Validation)?;
        return Ok(config);
    }
    load_config(path)
}

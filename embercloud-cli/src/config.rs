//! Client configuration loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use embercloud_core::ClientConfig;

/// Where the configuration lives when no path is given.
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().join("client.toml"))
        .unwrap_or_else(|| PathBuf::from("embercloud.toml"))
}

/// Load, normalize and validate a TOML client configuration.
pub fn load_config(path: Option<&Path>) -> Result<(ClientConfig, PathBuf)> {
    let config_path = path.map_or_else(default_config_path, Path::to_path_buf);
    let contents = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config from {:?}", config_path))?;
    let config = parse_config(&contents)
        .with_context(|| format!("Failed to parse config from {:?}", config_path))?;
    Ok((config, config_path))
}

/// Parse TOML text into a validated configuration.
pub fn parse_config(contents: &str) -> Result<ClientConfig> {
    let config: ClientConfig = toml::from_str(contents)?;
    let config = config.normalized();
    config.validate()?;
    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "embercloud", "embercloud")
}

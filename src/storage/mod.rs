//! Storage Layer
//!
//! Locations of the engine config file and template patches on disk.

use anyhow::Result;
use std::path::PathBuf;

const CONFIG_FILE: &str = "engine.toml";

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "anchorocr", "AnchorOcr")
        .ok_or_else(|| anyhow::anyhow!("Could not determine project directories"))
}

/// Get the application data directory (template patches, batch exports)
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Path of the default engine config file (may not exist yet)
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

/// Directory where extracted template patches are stored by default
pub fn get_templates_dir() -> Result<PathBuf> {
    let dir = get_data_dir()?.join("templates");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

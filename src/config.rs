use anyhow::{Context, Result};
use reconcile::{ClusterConfig, EngineConfig};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("converge"))
}

/// Path of the engine config file
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config_dir()?.join("config.toml")),
    }
}

/// Load engine settings; a missing file yields defaults
pub fn load_engine_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    let path = config_path(explicit)?;
    if !path.exists() {
        if explicit.is_some() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        log::debug!("no config at {}, using defaults", path.display());
        return Ok(EngineConfig::default());
    }
    load_file(&path)
}

/// Load a configuration tree
pub fn load_tree(path: &Path) -> Result<ClusterConfig> {
    load_file(path)
}

/// Load an optional tree, defaulting to an empty cluster
pub fn load_tree_or_empty(path: Option<&Path>) -> Result<ClusterConfig> {
    path.map_or_else(|| Ok(ClusterConfig::default()), load_tree)
}

/// Save a configuration tree in the format its extension names
pub fn save_tree(path: &Path, tree: &ClusterConfig) -> Result<()> {
    let content = if is_json(path) {
        serde_json::to_string_pretty(tree)?
    } else {
        toml::to_string_pretty(tree)?
    };
    fs::write(path, content).with_context(|| format!("Could not write {}", path.display()))
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    if is_json(path) {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {}", path.display()))
    } else {
        toml::from_str(&content).with_context(|| format!("Invalid TOML in {}", path.display()))
    }
}

//! Configuration file loading

use anyhow::{Context, Result};
use directories::ProjectDirs;
use saorsa_call_core::CallManagerConfig;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

/// Platform default location of the config file
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "saorsa", "saorsa-call")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Resolve which config file to use: an explicit path wins
pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(default_config_path)
}

/// Load and validate configuration
///
/// A missing file at the default location gives the defaults; a missing
/// file that was asked for explicitly is an error.
pub fn load(explicit: Option<&Path>) -> Result<CallManagerConfig> {
    let Some(path) = resolve_path(explicit) else {
        tracing::debug!("No config directory on this platform, using defaults");
        return Ok(CallManagerConfig::default());
    };
    if !path.exists() {
        if explicit.is_some() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(CallManagerConfig::default());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: CallManagerConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Write the default configuration, refusing to clobber an existing file
pub fn write_default(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, default_json()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Defaults as pretty-printed JSON
pub fn default_json() -> Result<String> {
    Ok(serde_json::to_string_pretty(&CallManagerConfig::default())?)
}

//! Centralized path resolution for keel
//!
//! # Environment Variables
//!
//! - `KEEL_CONFIG_DIR` - Override config directory
//! - `KEEL_STATE_DIR` - Override state directory (state databases, run reports)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `KEEL_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/keel` (if set)
//! 3. Platform default:
//!    - Windows: `%APPDATA%\keel`
//!    - macOS/Linux: `~/.config/keel`
//!
//! For state_dir():
//! 1. `KEEL_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/keel` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\keel`
//!    - macOS/Linux: `~/.local/state/keel`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "KEEL_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "KEEL_STATE_DIR";

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE: &str = "keel.toml";

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get the keel config directory path
pub fn config_dir() -> Result<PathBuf> {
    config_dir_with(env_var)
}

fn config_dir_with(lookup: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(dir) = lookup(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!("Using config dir from {}: {}", ENV_CONFIG_DIR, path.display());
        return Ok(path);
    }

    if let Some(xdg_config) = lookup("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join("keel");
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("keel"));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join("keel");
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Get the keel state directory path
pub fn state_dir() -> Result<PathBuf> {
    state_dir_with(env_var)
}

fn state_dir_with(lookup: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(dir) = lookup(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Some(xdg_state) = lookup("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join("keel");
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            return Ok(local_app_data.join("keel"));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join("keel");
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Default configuration file, `<config_dir>/keel.toml`
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Default state database for an environment
pub fn state_db(state_dir: &Path, environment: &str) -> PathBuf {
    state_dir.join(format!("{environment}.db"))
}

/// Directory holding persisted run reports for an environment
pub fn reports_dir(state_dir: &Path, environment: &str) -> PathBuf {
    state_dir.join("reports").join(environment)
}

/// Expand ~ and environment variables in a path string.
///
/// Unknown variables are left as written.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================

//! Configuration file location
//!
//! Uses the directories crate for platform-appropriate locations:
//! - Linux: `~/.config/proxy-e2e/`
//! - macOS: `~/Library/Application Support/proxy-e2e/`
//! - Windows: `%APPDATA%\proxy-e2e\`

use std::path::PathBuf;

/// Application name used for config and data directories
const APP_NAME: &str = "proxy-e2e";

/// Environment variable that points at an explicit config file
pub const CONFIG_ENV: &str = "PROXY_E2E_CONFIG";

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
///
/// `PROXY_E2E_CONFIG` wins over the platform location.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        if !explicit.is_empty() {
            return Some(PathBuf::from(explicit));
        }
    }
    config_dir().map(|dir| dir.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_toml() {
        if std::env::var(CONFIG_ENV).is_ok() {
            return;
        }
        if let Some(path) = config_path() {
            assert_eq!(path.extension().and_then(|e| e.to_str()), Some("toml"));
        }
    }
}

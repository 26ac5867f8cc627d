//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// TOML configuration file contents
///
/// All keys are optional; missing keys fall through to the next resolution
/// tier (environment variable or compiled default).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Root folder for the QDP data directory (database lives under it)
    pub root_folder: Option<String>,
    /// HTTP listen port for the quality-engine service
    pub port: Option<u16>,
}

impl TomlConfig {
    /// Load the platform config file if one exists, otherwise defaults.
    pub fn load() -> Self {
        match find_config_file() {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(content) => toml::from_str(&content).unwrap_or_default(),
                Err(_) => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable (`QDP_ROOT_FOLDER`)
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, toml_config: &TomlConfig) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var("QDP_ROOT_FOLDER") {
        return PathBuf::from(path);
    }

    // Priority 3: TOML config file
    if let Some(path) = &toml_config.root_folder {
        return PathBuf::from(path);
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Get default configuration file path for the platform
fn find_config_file() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        // Try ~/.config/qdp/config.toml first, then /etc/qdp/config.toml
        if let Some(path) = dirs::config_dir().map(|d| d.join("qdp").join("config.toml")) {
            if path.exists() {
                return Ok(path);
            }
        }
        let system_config = PathBuf::from("/etc/qdp/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
        Err(Error::Config("No config file found".to_string()))
    } else {
        let path = dirs::config_dir()
            .map(|d| d.join("qdp").join("config.toml"))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::Config(format!("Config file not found: {:?}", path)))
        }
    }
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("qdp"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/qdp"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("qdp"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/qdp"))
    } else {
        dirs::data_dir()
            .map(|d| d.join("qdp"))
            .unwrap_or_else(|| PathBuf::from("qdp-data"))
    }
}

/// Ensure the root folder exists and return the database path under it.
pub fn database_path(root_folder: &PathBuf) -> Result<PathBuf> {
    std::fs::create_dir_all(root_folder)?;
    Ok(root_folder.join("qdp.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_cli_arg_takes_priority() {
        std::env::set_var("QDP_ROOT_FOLDER", "/env/path");
        let toml = TomlConfig {
            root_folder: Some("/toml/path".to_string()),
            port: None,
        };
        let resolved = resolve_root_folder(Some("/cli/path"), &toml);
        assert_eq!(resolved, PathBuf::from("/cli/path"));
        std::env::remove_var("QDP_ROOT_FOLDER");
    }

    #[test]
    #[serial]
    fn test_env_var_beats_toml() {
        std::env::set_var("QDP_ROOT_FOLDER", "/env/path");
        let toml = TomlConfig {
            root_folder: Some("/toml/path".to_string()),
            port: None,
        };
        let resolved = resolve_root_folder(None, &toml);
        assert_eq!(resolved, PathBuf::from("/env/path"));
        std::env::remove_var("QDP_ROOT_FOLDER");
    }

    #[test]
    #[serial]
    fn test_toml_beats_default() {
        std::env::remove_var("QDP_ROOT_FOLDER");
        let toml = TomlConfig {
            root_folder: Some("/toml/path".to_string()),
            port: None,
        };
        let resolved = resolve_root_folder(None, &toml);
        assert_eq!(resolved, PathBuf::from("/toml/path"));
    }
}

//! Configuration management for the radiopadre launcher

mod client;
pub mod serde_utils;

pub use client::{
    BrowserConfig, ClientConfig, HomeVolume, KubernetesConfig, RetryConfig, SshConfig,
    DEFAULT_DOCKER_IMAGE,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("radiopadre")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Home directory of the current user
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Per-user radiopadre state directory (`~/.radiopadre`)
pub fn radiopadre_dir() -> PathBuf {
    home_dir().join(".radiopadre")
}

/// Directory holding one record directory per running container session
pub fn sessions_dir() -> PathBuf {
    radiopadre_dir().join(".sessions")
}

/// Name of the current user
pub fn user_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| whoami::username())
}

/// Full name of the current user (the GECOS field on unix)
pub fn real_name() -> String {
    whoami::realname()
}

/// Host name of this machine
pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load configuration, falling back to defaults
///
/// A missing file yields defaults silently; a file that fails to parse yields
/// defaults with a warning.
pub fn load_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match load_config(path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => T::default(),
        Err(e) => {
            tracing::warn!("ignoring config file {}: {}", path.display(), e);
            T::default()
        }
    }
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config: ClientConfig = load_or_default(&dir.path().join("nope.toml"));
        assert_eq!(config.num_ports, 5);
        assert!(matches!(
            load_config::<ClientConfig>(&dir.path().join("nope.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_garbage_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "num_ports = [").unwrap();
        let config: ClientConfig = load_or_default(&path);
        assert!(config.grim_reaper);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let mut config = ClientConfig::default();
        config.ssh.host = Some("cluster.example.org".into());
        config.kubernetes.namespace = Some("padre".into());
        save_config(&path, &config).unwrap();

        let loaded: ClientConfig = load_config(&path).unwrap();
        assert_eq!(loaded.ssh.host.as_deref(), Some("cluster.example.org"));
        assert_eq!(loaded.kubernetes.namespace.as_deref(), Some("padre"));
        assert_eq!(loaded.shutdown_grace, config.shutdown_grace);
    }
}

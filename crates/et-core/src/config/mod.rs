//! Configuration management for ephemeral-tunnel

pub mod serde_utils;
mod tunnel;

pub use tunnel::{
    BackendConfig, HelperKind, ProcessBackendConfig, ProtocolBackendConfig, TunnelConfig,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ephemeral-tunnel")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("tunnel.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read {:?}: {}", path, e)))?;

    tracing::debug!("Loaded configuration from {:?}", path);
    Ok(toml::from_str(&content)?)
}

/// Save configuration to a file, creating its directory if needed
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create {:?}: {}", parent, e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TunnelTarget;
    use std::time::Duration;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tunnel.toml");

        let mut config = TunnelConfig::new(TunnelTarget::Host("10.0.0.5".into()), 8080)
            .with_local_port(18080);
        config.shutdown_timeout = Duration::from_millis(1500);

        save_config(&path, &config).unwrap();
        let loaded: TunnelConfig = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<TunnelConfig, _> = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_default_path_is_namespaced() {
        let path = default_config_path();
        assert!(path.ends_with("ephemeral-tunnel/tunnel.toml"));
    }
}

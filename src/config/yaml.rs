//! YAML configuration parsing.

use std::path::Path;

use super::{ConfigError, EngineConfig};

/// Loader for `crony.yaml` files.
pub struct YamlLoader;

impl YamlLoader {
    /// Load and validate a configuration file.
    pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    ///
    /// An empty document yields the defaults.
    pub fn parse_config(yaml: &str) -> Result<EngineConfig, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
        if config.event_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "event_capacity must be greater than 0".into(),
            ));
        }
        if config.max_nap_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_nap_secs must be greater than 0".into(),
            ));
        }
        if config.max_buffer_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_buffer_bytes must be greater than 0".into(),
            ));
        }
        if let Some(shell) = &config.shell {
            if shell.program.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "shell.program must not be empty".into(),
                ));
            }
        }
        config.output_fallback()?;
        if config.api.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("api.host must not be empty".into()));
        }
        Ok(())
    }
}

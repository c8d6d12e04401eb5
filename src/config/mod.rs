//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the engine, the HTTP
//! API and the command-line tool.

mod error;
mod types;
mod yaml;

pub use error::ConfigError;
pub use types::{
    ApiConfig, DEFAULT_DATABASE_FILE, DEFAULT_TASKS_FILE, EngineConfig, StorageConfig,
};
pub use yaml::YamlLoader;

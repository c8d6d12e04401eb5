//! Configuration type definitions.
//!
//! `crony.yaml` is deserialized into [`EngineConfig`]; every field is
//! optional and falls back to its default.

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::task::DEFAULT_MAX_RESULT_BYTES;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::execution::{DEFAULT_MAX_BUFFER_BYTES, DEFAULT_STOP_GRACE, Shell};
use crate::scheduler::DEFAULT_MAX_NAP;

/// File name of the JSON task store inside the data directory.
pub const DEFAULT_TASKS_FILE: &str = "tasks.json";

/// File name of the SQLite task store inside the data directory.
pub const DEFAULT_DATABASE_FILE: &str = "tasks.db";

/// Engine configuration (crony.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the task store. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    /// Storage backend.
    pub storage: StorageConfig,
    /// Shell used to run task commands. Defaults to the platform shell.
    pub shell: Option<Shell>,
    /// Encoding label (e.g. `gbk`) used for command output that is not
    /// UTF-8. Defaults to `gbk` on Windows and none elsewhere.
    pub fallback_encoding: Option<String>,
    /// Grace period between SIGTERM and SIGKILL on stop, in milliseconds.
    pub stop_grace_ms: u64,
    /// Cap on the output kept in a task's last result.
    pub max_result_bytes: usize,
    /// Cap on the live output buffered per run.
    pub max_buffer_bytes: usize,
    /// Per-subscriber event queue length.
    pub event_capacity: usize,
    /// Longest the scheduler sleeps without re-checking the clock, in seconds.
    pub max_nap_secs: u64,
    /// HTTP API settings.
    pub api: ApiConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            storage: StorageConfig::default(),
            shell: None,
            fallback_encoding: default_fallback_encoding(),
            stop_grace_ms: DEFAULT_STOP_GRACE.as_millis() as u64,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_nap_secs: DEFAULT_MAX_NAP.as_secs(),
            api: ApiConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for a throwaway engine: in-memory storage, defaults otherwise.
    pub fn ephemeral() -> Self {
        Self {
            storage: StorageConfig::Memory,
            ..Self::default()
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn max_nap(&self) -> Duration {
        Duration::from_secs(self.max_nap_secs)
    }

    /// Resolve [`EngineConfig::fallback_encoding`] to an encoding.
    pub fn output_fallback(&self) -> Result<Option<&'static Encoding>, super::ConfigError> {
        match &self.fallback_encoding {
            None => Ok(None),
            Some(label) => Encoding::for_label(label.trim().as_bytes())
                .map(Some)
                .ok_or_else(|| {
                    super::ConfigError::InvalidConfig(format!("unknown fallback_encoding '{}'", label))
                }),
        }
    }

    /// The configured data directory, or `<platform data dir>/crony`.
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("crony")))
    }
}

fn default_fallback_encoding() -> Option<String> {
    cfg!(windows).then(|| "gbk".to_string())
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// A single JSON document (default).
    #[serde(rename = "json")]
    Json {
        /// Path to the file. Relative to the data directory when not absolute.
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file. Relative to the data directory when not absolute.
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// In-memory storage (non-persistent).
    #[serde(rename = "memory")]
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Json { path: None }
    }
}

impl StorageConfig {
    /// Whether tasks survive a restart with this backend.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, StorageConfig::Memory)
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8565,
        }
    }
}

impl EngineConfig {
    /// Location of the task store file, or `None` for in-memory storage.
    ///
    /// Relative paths are resolved against the data directory.
    pub fn storage_path(&self) -> Result<Option<PathBuf>, super::ConfigError> {
        let (configured, default_name) = match &self.storage {
            StorageConfig::Memory => return Ok(None),
            StorageConfig::Json { path } => (path.as_ref(), DEFAULT_TASKS_FILE),
            StorageConfig::Sqlite { path } => (path.as_ref(), DEFAULT_DATABASE_FILE),
        };

        if let Some(path) = configured.filter(|p| p.is_absolute()) {
            return Ok(Some(path.clone()));
        }

        let data_dir = self.resolved_data_dir().ok_or(super::ConfigError::NoDataDir)?;
        Ok(Some(match configured {
            Some(relative) => data_dir.join(relative),
            None => data_dir.join(default_name),
        }))
    }
}

//! Runtime configuration.
//!
//! Every field has a default, so an absent or partial configuration file is
//! valid. The file path comes from the first command-line argument or the
//! `FLOWVISOR_CONFIG` environment variable.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const CONFIG_ENV: &str = "FLOWVISOR_CONFIG";

// ================================================================================================
// STORAGE CONFIGURATION
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Where the persisted FlowSpace lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file for the sqlite backend
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("./var/data/flowspace.db"),
        }
    }
}

// ================================================================================================
// CONTROLLER CONFIGURATION
// ================================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Batches that may wait for the worker before submission blocks
    pub queue_capacity: usize,
    /// Undelivered notifications buffered per subscriber
    pub listener_queue_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            listener_queue_capacity: 32,
        }
    }
}

// ================================================================================================
// TOP LEVEL
// ================================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowVisorConfig {
    pub storage: StorageConfig,
    pub controller: ControllerConfig,
    /// Records used to seed an empty store at startup
    pub bootstrap_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for FlowVisorConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            controller: ControllerConfig::default(),
            bootstrap_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl FlowVisorConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, BridgeError> {
        let config: FlowVisorConfig = serde_json::from_str(text)
            .map_err(|e| BridgeError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from the path in `arg` or, failing that, `FLOWVISOR_CONFIG`.
    /// With neither set the defaults are used.
    pub fn resolve(arg: Option<String>) -> Result<Self, BridgeError> {
        match arg.or_else(|| std::env::var(CONFIG_ENV).ok()) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.controller.queue_capacity == 0 {
            return Err(BridgeError::Config("controller.queue_capacity must be positive".into()));
        }
        if self.controller.listener_queue_capacity == 0 {
            return Err(BridgeError::Config(
                "controller.listener_queue_capacity must be positive".into(),
            ));
        }
        self.level_filter()?;
        Ok(())
    }

    pub fn level_filter(&self) -> Result<log::LevelFilter, BridgeError> {
        log::LevelFilter::from_str(&self.log_level)
            .map_err(|_| BridgeError::Config(format!("unknown log level '{}'", self.log_level)))
    }
}

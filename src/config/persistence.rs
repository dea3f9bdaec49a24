//! Persistence configuration.

use std::path::PathBuf;

use serde::Deserialize;

/// Storage hook configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Store sessions and retained messages across restarts
    pub enabled: bool,

    /// Keyspace directory
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("./data"),
        }
    }
}

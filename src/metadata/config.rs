//! Configuration for the metadata database

use std::env;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

/// Metadata database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Database file path
    pub db_path: String,
    /// How long a unit of work waits for the write lock
    pub busy_timeout_ms: u64,
    /// Enable WAL mode
    pub wal_mode: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/metadata.db".to_string(),
            busy_timeout_ms: 5_000,
            wal_mode: true,
        }
    }
}

impl MetadataConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Override the database location from the environment
    pub fn apply_env(&mut self) {
        if let Ok(path) = env::var("DB_FILE") {
            info!("Using database path from environment: {}", path);
            self.db_path = path;
        }
    }
}

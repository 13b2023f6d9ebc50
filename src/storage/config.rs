//! Configuration for blob storage backends

use std::env;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::VaultResult;
use crate::storage::{local_store::LocalFsBlobStore, mock_store::MockBlobStore, BlobStorage};

/// Available blob storage backends
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum StorageBackend {
    #[default]
    LocalFs,
    Mock,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "localfs" | "local" | "fs" => Ok(StorageBackend::LocalFs),
            "mock" | "memory" => Ok(StorageBackend::Mock),
            _ => Err(format!("Unknown storage backend: {}", s)),
        }
    }
}

/// Blob storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend type
    pub backend: StorageBackend,
    /// Root directory for blob files
    pub base_path: String,
    /// Uploads up to this many bytes are spooled in memory before hitting disk
    pub spool_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::LocalFs,
            base_path: "./data/blobs".to_string(),
            spool_threshold: 8 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Override the configured backend and directory from the environment
    pub fn apply_env(&mut self) {
        if let Ok(backend_str) = env::var("STORAGE_BACKEND") {
            match backend_str.parse::<StorageBackend>() {
                Ok(backend) => {
                    info!("Using storage backend from environment: {:?}", backend);
                    self.backend = backend;
                }
                Err(e) => {
                    warn!("Invalid storage backend in environment: {}. Keeping {:?}.", e, self.backend);
                }
            }
        }
        if let Ok(dir) = env::var("STORAGE_DIRECTORY") {
            info!("Using storage directory from environment: {}", dir);
            self.base_path = dir;
        }
    }

    /// Create a storage instance based on the configuration
    pub fn create_store(&self) -> VaultResult<Arc<dyn BlobStorage>> {
        match self.backend {
            StorageBackend::LocalFs => Ok(Arc::new(LocalFsBlobStore::new(&self.base_path)?)),
            StorageBackend::Mock => {
                info!("Using in-memory blob storage backend");
                Ok(Arc::new(MockBlobStore::new()))
            }
        }
    }
}

//! Application State Management
//!
//! This module provides the application state that contains all services
//! and their dependencies, following the dependency injection pattern.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::config::AppConfig;
use crate::error::VaultResult;
use crate::metadata::MetadataStore;
use crate::service::rate_limiter::RateLimiter;
use crate::service::vault::FileVault;
use crate::storage::config::StorageBackend;
use crate::storage::mock_store::MockBlobStore;
use crate::storage::BlobStorage;

/// Application state containing all services and their dependencies
#[derive(Clone)]
pub struct AppState {
    pub vault: FileVault,
    /// `None` when rate limiting is disabled
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub config: AppConfig,
}

impl AppState {
    /// Create application state from configuration
    pub fn from_config(config: AppConfig) -> VaultResult<Self> {
        info!("Initializing application state with configuration");

        info!(
            "Using {:?} blob storage at {}",
            config.storage.backend, config.storage.base_path
        );
        let blobs = config.storage.create_store()?;

        info!(
            "Using SQLite metadata at {} (wal_mode: {})",
            config.metadata.db_path, config.metadata.wal_mode
        );
        let metadata = Arc::new(MetadataStore::open(&config.metadata)?);

        let state = Self::with_stores(config, metadata, blobs);
        info!("Application state initialized successfully");
        Ok(state)
    }

    /// Assemble the state around already opened stores
    pub fn with_stores(config: AppConfig, metadata: Arc<MetadataStore>, blobs: Arc<dyn BlobStorage>) -> Self {
        let vault = FileVault::new(metadata, blobs, config.vault_settings());
        let rate_limiter = if config.rate_limit.enabled {
            info!("Rate limiting at {} requests/s per user", config.rate_limit.requests_per_second);
            Some(Arc::new(RateLimiter::new(config.rate_limit.requests_per_second)))
        } else {
            None
        };

        Self {
            vault,
            rate_limiter,
            config,
        }
    }

    /// Create application state for testing: in-memory blobs, a SQLite file
    /// under `dir`, and no rate limiting
    pub fn for_testing(dir: &Path) -> VaultResult<Self> {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Mock;
        config.metadata.db_path = dir.join("metadata.db").to_string_lossy().into_owned();
        config.rate_limit.enabled = false;
        config.sweeper.enabled = false;

        let metadata = Arc::new(MetadataStore::open(&config.metadata)?);
        Ok(Self::with_stores(config, metadata, Arc::new(MockBlobStore::new())))
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }
}

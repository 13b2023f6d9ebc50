//! Application Configuration
//!
//! This module provides configuration management for the application,
//! supporting YAML configuration files with sensible defaults and the
//! environment overrides used by existing deployments.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::metadata::config::MetadataConfig;
use crate::service::orphan_sweeper::SweeperConfig;
use crate::service::quota::QuotaBasis;
use crate::service::upload::UploadSettings;
use crate::service::vault::VaultSettings;
use crate::storage::config::StorageConfig;

/// Environment variable naming an alternative configuration file
pub const CONFIG_PATH_ENV: &str = "DEDUP_DRIVE_CONFIG";

const MIB: u64 = 1024 * 1024;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Blob storage configuration
    pub storage: StorageConfig,
    /// Metadata database configuration
    pub metadata: MetadataConfig,
    /// Upload validation limits
    pub upload: UploadConfig,
    /// Per-user storage quota
    pub quota: QuotaConfig,
    /// Per-user request rate limiting
    pub rate_limit: RateLimitConfig,
    /// Public link settings
    pub visibility: VisibilityConfig,
    /// Orphan sweeper configuration
    pub sweeper: SweeperConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum payload size in bytes for JSON bodies
    pub max_payload_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9710,
            workers: 4,
            max_payload_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Largest accepted upload in bytes
    pub max_file_size: u64,
    /// Accepted media types; empty accepts everything
    pub allowed_types: Vec<String>,
    /// Deadline for a single request, in seconds
    pub request_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * MIB,
            allowed_types: Vec::new(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Per-user limit in bytes; absent disables enforcement
    pub per_user_limit_bytes: Option<u64>,
    /// Counter compared against the limit
    pub basis: QuotaBasis,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            per_user_limit_bytes: Some(10 * MIB),
            basis: QuotaBasis::Actual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Sustained requests per second per user, also the burst size
    pub requests_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    /// Token generation attempts before giving up on a collision
    pub max_token_attempts: u32,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self { max_token_attempts: 5 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Path to log configuration file
    pub config_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            config_file: "server_log.yaml".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file, use defaults if not found, then apply
    /// environment overrides
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.yaml".to_string());
        let mut config = Self::load_from(&config_path)?;
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from `path` without consulting the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: AppConfig = serde_yaml::from_str(&content)?;
            info!("Loaded configuration from {}", path.display());
            Ok(config)
        } else {
            warn!("Config file {} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn apply_env(&mut self) {
        self.storage.apply_env();
        self.metadata.apply_env();

        if let Ok(raw) = env::var("USER_STORAGE_QUOTA_MB") {
            match raw.trim().parse::<u64>() {
                Ok(0) => {
                    info!("Storage quota disabled by environment");
                    self.quota.per_user_limit_bytes = None;
                }
                Ok(mb) => match mb.checked_mul(MIB) {
                    Some(bytes) => {
                        info!("Using storage quota from environment: {} MB", mb);
                        self.quota.per_user_limit_bytes = Some(bytes);
                    }
                    None => warn!("USER_STORAGE_QUOTA_MB {} is too large, keeping configured quota", mb),
                },
                Err(e) => warn!("Invalid USER_STORAGE_QUOTA_MB {:?}: {}", raw, e),
            }
        }

        if let Ok(raw) = env::var("API_RATE_LIMIT") {
            match raw.trim().parse::<u32>() {
                Ok(0) => {
                    info!("Rate limiting disabled by environment");
                    self.rate_limit.enabled = false;
                }
                Ok(limit) => {
                    info!("Using rate limit from environment: {}/s", limit);
                    self.rate_limit.enabled = true;
                    self.rate_limit.requests_per_second = limit;
                }
                Err(e) => warn!("Invalid API_RATE_LIMIT {:?}: {}", raw, e),
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.request_timeout_secs.max(1))
    }

    pub fn vault_settings(&self) -> VaultSettings {
        VaultSettings {
            upload: UploadSettings {
                max_file_size: self.upload.max_file_size,
                allowed_types: self.upload.allowed_types.clone(),
                spool_threshold: self.storage.spool_threshold,
            },
            quota_limit: self.quota.per_user_limit_bytes,
            quota_basis: self.quota.basis,
            max_token_attempts: self.visibility.max_token_attempts,
        }
    }
}

//! Blob Storage Layer Abstraction
//!
//! This module provides an abstraction over durable byte storage, allowing the
//! system to use different backends (local files, in-memory for tests) without
//! affecting the content store built on top of it. Blobs are addressed by an
//! opaque `StorageLocator` that is always derived from a generated identifier,
//! never from a user-supplied filename.

pub mod local_store;
pub mod mock_store;
pub mod config;

#[cfg(test)]
mod comprehensive_test;

use std::fmt;
use std::io::Read;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{VaultError, VaultResult};
use crate::service::user_context::RequestContext;

/// Chunk size used when copying streams into a backend
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Location of one blob inside a storage backend, e.g. `3f/3f2a...`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageLocator(String);

impl StorageLocator {
    /// Fresh locator, sharded by the first two hex digits of a v4 UUID
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self(format!("{}/{}", &id[..2], id))
    }

    /// Parse a locator read back from metadata or a directory listing.
    /// Only `<2 hex>/<32 hex>` is accepted, so a locator can never escape the
    /// storage root.
    pub fn parse(raw: &str) -> VaultResult<Self> {
        let valid = match raw.split_once('/') {
            Some((shard, id)) => {
                shard.len() == 2
                    && id.len() == 32
                    && id.starts_with(shard)
                    && id.bytes().all(|b| b.is_ascii_hexdigit())
            }
            None => false,
        };
        if !valid {
            return Err(VaultError::InvariantViolation(format!(
                "malformed storage locator: {}",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A blob as seen by a directory listing
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub locator: StorageLocator,
    pub modified: SystemTime,
}

/// Trait defining the blob storage interface
pub trait BlobStorage: Send + Sync {
    /// Stream `reader` into a new blob at `locator`, returning the bytes written.
    /// Partially written data must not be visible at `locator` on failure.
    fn write_at_locator(
        &self,
        ctx: &RequestContext,
        locator: &StorageLocator,
        reader: &mut dyn Read,
    ) -> VaultResult<u64>;

    /// Read a whole blob; NotFound if it is absent
    fn read_at_locator(&self, ctx: &RequestContext, locator: &StorageLocator) -> VaultResult<Vec<u8>>;

    /// Remove a blob. Returns `false` when the blob was already absent.
    fn remove_at_locator(&self, locator: &StorageLocator) -> VaultResult<bool>;

    fn exists(&self, locator: &StorageLocator) -> VaultResult<bool>;

    /// Every blob currently held, used by the orphan sweeper
    fn list_locators(&self) -> VaultResult<Vec<StoredBlob>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_locator_parses() {
        let locator = StorageLocator::generate();
        let parsed = StorageLocator::parse(locator.as_str()).unwrap();
        assert_eq!(parsed, locator);
        assert_ne!(StorageLocator::generate(), locator);
    }

    #[test]
    fn test_locator_rejects_traversal() {
        assert!(StorageLocator::parse("../etc/passwd").is_err());
        assert!(StorageLocator::parse("ab/../../x").is_err());
        assert!(StorageLocator::parse("report.pdf").is_err());
        assert!(StorageLocator::parse("zz/zz000000000000000000000000000000").is_err());
    }
}

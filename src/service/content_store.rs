//! Content Store
//!
//! Content-addressed physical storage. Bytes live in a `BlobStorage` backend
//! under a generated locator; the `content_objects` row records the hash,
//! size, media type and the number of links referring to it.

use std::io::{Cursor, Read};
use std::sync::Arc;

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};
use crate::metadata::{content_repo, ContentHash, ContentObject, MetadataStore, UnitOfWork};
use crate::service::user_context::RequestContext;
use crate::storage::{BlobStorage, StorageLocator};

/// Outcome of registering content metadata for a staged blob
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// A new object now owns the staged blob
    Created(ContentObject),
    /// The hash was already known; the staged blob is surplus
    Existing(ContentObject),
}

impl Registration {
    pub fn object(&self) -> &ContentObject {
        match self {
            Registration::Created(object) | Registration::Existing(object) => object,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

#[derive(Clone)]
pub struct ContentStore {
    metadata: Arc<MetadataStore>,
    blobs: Arc<dyn BlobStorage>,
}

impl ContentStore {
    pub fn new(metadata: Arc<MetadataStore>, blobs: Arc<dyn BlobStorage>) -> Self {
        Self { metadata, blobs }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStorage> {
        &self.blobs
    }

    pub fn hash(data: &[u8]) -> ContentHash {
        ContentHash::from_digest(&Sha256::digest(data))
    }

    /// Write a stream under a freshly generated locator
    pub fn stage(&self, ctx: &RequestContext, reader: &mut dyn Read) -> VaultResult<StorageLocator> {
        let locator = StorageLocator::generate();
        let written = self.blobs.write_at_locator(ctx, &locator, reader)?;
        debug!("Staged {} bytes at {}", written, locator);
        Ok(locator)
    }

    /// Remove a staged blob that no metadata will point at. Failures are only
    /// logged; the orphan sweeper reaps whatever is left behind.
    pub fn discard(&self, locator: &StorageLocator) {
        match self.blobs.remove_at_locator(locator) {
            Ok(_) => debug!("Discarded staged blob {}", locator),
            Err(e) => warn!("Failed to discard staged blob {}: {}", locator, e),
        }
    }

    pub fn get(&self, ctx: &RequestContext, id: i64) -> VaultResult<ContentObject> {
        self.metadata.read(ctx, |conn| content_repo::get(conn, id))
    }

    pub fn find_by_hash(&self, ctx: &RequestContext, hash: &ContentHash) -> VaultResult<Option<ContentObject>> {
        self.metadata.read(ctx, |conn| content_repo::find_by_hash(conn, hash))
    }

    /// Record metadata for a blob already staged at `locator`. If another
    /// upload registered the same hash first, that object is returned instead
    /// and the caller owns the cleanup of `locator`.
    pub fn register(
        &self,
        uow: &UnitOfWork<'_>,
        hash: &ContentHash,
        size_bytes: u64,
        mime_type: &str,
        locator: &StorageLocator,
    ) -> VaultResult<Registration> {
        if let Some(existing) = content_repo::find_by_hash(uow, hash)? {
            return Ok(Registration::Existing(existing));
        }
        match content_repo::insert(uow, hash, size_bytes, mime_type, locator) {
            Ok(object) => {
                info!("New content object {} for hash {}", object.id, hash);
                Ok(Registration::Created(object))
            }
            Err(e) if e.is_unique_violation() => {
                debug!("Lost creation race for hash {}, using existing object", hash);
                content_repo::find_by_hash(uow, hash)?
                    .map(Registration::Existing)
                    .ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn increment_ref(&self, uow: &UnitOfWork<'_>, id: i64) -> VaultResult<u64> {
        content_repo::increment_ref(uow, id)
    }

    pub fn decrement_ref(&self, uow: &UnitOfWork<'_>, id: i64) -> VaultResult<u64> {
        content_repo::decrement_ref(uow, id)
    }

    /// Delete the metadata of an object that has dropped to zero references.
    /// The blob must be removed with `remove_blob` once the unit of work commits.
    pub fn purge_metadata(&self, uow: &UnitOfWork<'_>, object: &ContentObject) -> VaultResult<()> {
        if !content_repo::delete_unreferenced(uow, object.id)? {
            error!("Refusing to purge content object {} that is still referenced", object.id);
            return Err(VaultError::InvariantViolation(format!(
                "content object {} is still referenced",
                object.id
            )));
        }
        Ok(())
    }

    /// Remove physical bytes; an already absent blob counts as removed
    pub fn remove_blob(&self, locator: &StorageLocator) -> VaultResult<()> {
        if !self.blobs.remove_at_locator(locator)? {
            debug!("Blob {} was already absent", locator);
        }
        Ok(())
    }

    /// Delete an unreferenced object and its bytes
    pub fn purge(&self, ctx: &RequestContext, id: i64) -> VaultResult<()> {
        let object = self.metadata.unit_of_work(ctx, |uow| {
            let object = content_repo::get(uow, id)?;
            self.purge_metadata(uow, &object)?;
            Ok(object)
        })?;
        self.remove_blob(&object.storage_locator)
    }

    /// Store `data` unless identical bytes are already present. Idempotent by
    /// hash: a repeated call returns the existing object without a new write.
    /// The reference count is left to the caller that links the object.
    pub fn put(&self, ctx: &RequestContext, data: &[u8], mime_type: &str) -> VaultResult<ContentObject> {
        let hash = Self::hash(data);
        if let Some(existing) = self.find_by_hash(ctx, &hash)? {
            return Ok(existing);
        }

        let locator = self.stage(ctx, &mut Cursor::new(data))?;
        let registration = self.metadata.unit_of_work(ctx, |uow| {
            self.register(uow, &hash, data.len() as u64, mime_type, &locator)
        });
        match registration {
            Ok(Registration::Created(object)) => Ok(object),
            Ok(Registration::Existing(object)) => {
                self.discard(&locator);
                Ok(object)
            }
            Err(e) => {
                self.discard(&locator);
                Err(e)
            }
        }
    }

    pub fn read(&self, ctx: &RequestContext, object: &ContentObject) -> VaultResult<Vec<u8>> {
        self.blobs.read_at_locator(ctx, &object.storage_locator)
    }
}

//! In-memory implementation of BlobStorage for testing

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use log::info;

use crate::error::{VaultError, VaultResult};
use crate::service::user_context::RequestContext;
use crate::storage::{BlobStorage, StorageLocator, StoredBlob};

/// Keeps blobs in a map and counts physical writes, with switches to inject
/// write and removal failures.
pub struct MockBlobStore {
    blobs: Arc<Mutex<HashMap<StorageLocator, (Vec<u8>, SystemTime)>>>,
    writes: AtomicUsize,
    removals: AtomicUsize,
    fail_writes: AtomicBool,
    fail_removals: AtomicBool,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(Mutex::new(HashMap::new())),
            writes: AtomicUsize::new(0),
            removals: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_removals: AtomicBool::new(false),
        }
    }

    /// Number of blobs currently held
    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    /// Number of successful physical writes since creation
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn removal_count(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail after consuming part of the stream
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::SeqCst);
    }

    /// Insert a blob directly, bypassing the write counter
    pub fn insert_raw(&self, locator: StorageLocator, data: Vec<u8>, modified: SystemTime) {
        self.blobs.lock().unwrap().insert(locator, (data, modified));
    }

    pub fn clear(&self) {
        self.blobs.lock().unwrap().clear();
    }
}

impl Default for MockBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStorage for MockBlobStore {
    fn write_at_locator(
        &self,
        ctx: &RequestContext,
        locator: &StorageLocator,
        reader: &mut dyn Read,
    ) -> VaultResult<u64> {
        ctx.check_deadline()?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(VaultError::StorageIo(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }

        let size = data.len() as u64;
        let mut blobs = self.blobs.lock().unwrap();
        if blobs.contains_key(locator) {
            return Err(VaultError::StorageIo(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("blob {} already exists", locator),
            )));
        }
        blobs.insert(locator.clone(), (data, SystemTime::now()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        info!("Mock store wrote blob {} ({} bytes)", locator, size);
        Ok(size)
    }

    fn read_at_locator(&self, ctx: &RequestContext, locator: &StorageLocator) -> VaultResult<Vec<u8>> {
        ctx.check_deadline()?;
        self.blobs
            .lock()
            .unwrap()
            .get(locator)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| VaultError::NotFound(format!("blob {} missing from storage", locator)))
    }

    fn remove_at_locator(&self, locator: &StorageLocator) -> VaultResult<bool> {
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(VaultError::StorageIo(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "injected removal failure",
            )));
        }
        let removed = self.blobs.lock().unwrap().remove(locator).is_some();
        if removed {
            self.removals.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    fn exists(&self, locator: &StorageLocator) -> VaultResult<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(locator))
    }

    fn list_locators(&self) -> VaultResult<Vec<StoredBlob>> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .map(|(locator, (_, modified))| StoredBlob {
                locator: locator.clone(),
                modified: *modified,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_mock_blob_store_counts_writes() {
        let store = MockBlobStore::new();
        let ctx = RequestContext::for_user(1);
        let locator = StorageLocator::generate();

        store
            .write_at_locator(&ctx, &locator, &mut Cursor::new(b"abc".to_vec()))
            .unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.blob_count(), 1);
        assert_eq!(store.read_at_locator(&ctx, &locator).unwrap(), b"abc");

        // Locators are never overwritten
        assert!(store
            .write_at_locator(&ctx, &locator, &mut Cursor::new(b"xyz".to_vec()))
            .is_err());
        assert_eq!(store.write_count(), 1);

        assert!(store.remove_at_locator(&locator).unwrap());
        assert!(!store.remove_at_locator(&locator).unwrap());
        assert_eq!(store.removal_count(), 1);
    }

    #[test]
    fn test_mock_blob_store_injected_failures() {
        let store = MockBlobStore::new();
        let ctx = RequestContext::for_user(1);
        let locator = StorageLocator::generate();

        store.set_fail_writes(true);
        let err = store
            .write_at_locator(&ctx, &locator, &mut Cursor::new(b"abc".to_vec()))
            .unwrap_err();
        assert!(matches!(err, VaultError::StorageIo(_)));
        assert_eq!(store.blob_count(), 0);

        store.set_fail_writes(false);
        store
            .write_at_locator(&ctx, &locator, &mut Cursor::new(b"abc".to_vec()))
            .unwrap();
        store.set_fail_removals(true);
        assert!(store.remove_at_locator(&locator).is_err());
        assert!(store.exists(&locator).unwrap());
    }
}

//! Local filesystem blob storage implementation

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{VaultError, VaultResult};
use crate::service::user_context::RequestContext;
use crate::storage::{BlobStorage, StorageLocator, StoredBlob, COPY_CHUNK_SIZE};

/// Blobs live at `<base_path>/<shard>/<id>`; writes go through a temporary
/// sibling file that is renamed into place once fully synced.
pub struct LocalFsBlobStore {
    base_path: PathBuf,
}

impl LocalFsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> VaultResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        info!("Using local blob storage directory: {}", base_path.display());
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, locator: &StorageLocator) -> PathBuf {
        self.base_path.join(locator.as_str())
    }

    fn copy_into(
        ctx: &RequestContext,
        reader: &mut dyn Read,
        file: &mut File,
    ) -> VaultResult<u64> {
        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            ctx.check_deadline()?;
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            file.write_all(&buffer[..n])?;
            written += n as u64;
        }
        file.sync_all()?;
        Ok(written)
    }
}

impl BlobStorage for LocalFsBlobStore {
    fn write_at_locator(
        &self,
        ctx: &RequestContext,
        locator: &StorageLocator,
        reader: &mut dyn Read,
    ) -> VaultResult<u64> {
        let final_path = self.blob_path(locator);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = final_path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        let result = Self::copy_into(ctx, reader, &mut file)
            .and_then(|written| {
                drop(file);
                fs::rename(&temp_path, &final_path)?;
                Ok(written)
            });

        match result {
            Ok(written) => {
                debug!("Wrote blob {} ({} bytes)", locator, written);
                Ok(written)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp_path) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove partial blob {}: {}", temp_path.display(), cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    fn read_at_locator(&self, ctx: &RequestContext, locator: &StorageLocator) -> VaultResult<Vec<u8>> {
        ctx.check_deadline()?;
        match fs::read(self.blob_path(locator)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(VaultError::NotFound(format!(
                "blob {} missing from storage",
                locator
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_at_locator(&self, locator: &StorageLocator) -> VaultResult<bool> {
        match fs::remove_file(self.blob_path(locator)) {
            Ok(()) => {
                debug!("Removed blob {}", locator);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, locator: &StorageLocator) -> VaultResult<bool> {
        Ok(self.blob_path(locator).is_file())
    }

    fn list_locators(&self) -> VaultResult<Vec<StoredBlob>> {
        let mut blobs = Vec::new();
        for shard in fs::read_dir(&self.base_path)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name().to_string_lossy().into_owned();
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                // Skips in-flight `.tmp` files and anything not written by us.
                let Ok(locator) = StorageLocator::parse(&format!("{}/{}", shard_name, name)) else {
                    continue;
                };
                let modified = entry.metadata()?.modified()?;
                blobs.push(StoredBlob { locator, modified });
            }
        }
        Ok(blobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;

    #[test]
    fn test_local_blob_store_basic_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsBlobStore::new(dir.path()).unwrap();
        let ctx = RequestContext::for_user(1);
        let locator = StorageLocator::generate();
        let test_data = b"Hello, local blob storage!";

        let written = store
            .write_at_locator(&ctx, &locator, &mut Cursor::new(test_data.to_vec()))
            .unwrap();
        assert_eq!(written, test_data.len() as u64);
        assert!(store.exists(&locator).unwrap());

        let retrieved = store.read_at_locator(&ctx, &locator).unwrap();
        assert_eq!(retrieved, test_data);

        let listed = store.list_locators().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].locator, locator);

        assert!(store.remove_at_locator(&locator).unwrap());
        assert!(!store.exists(&locator).unwrap());
        // Already absent is not an error
        assert!(!store.remove_at_locator(&locator).unwrap());
    }

    #[test]
    fn test_read_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsBlobStore::new(dir.path()).unwrap();
        let ctx = RequestContext::for_user(1);

        let err = store
            .read_at_locator(&ctx, &StorageLocator::generate())
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[test]
    fn test_expired_deadline_leaves_no_partial_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsBlobStore::new(dir.path()).unwrap();
        let ctx = RequestContext::for_user(1).with_deadline(Instant::now());
        let locator = StorageLocator::generate();

        let err = store
            .write_at_locator(&ctx, &locator, &mut Cursor::new(vec![7u8; 1024]))
            .unwrap_err();
        assert!(matches!(err, VaultError::Timeout));
        assert!(!store.exists(&locator).unwrap());
        assert!(store.list_locators().unwrap().is_empty());
        // The shard directory holds no leftover temp file either
        let shard = dir.path().join(&locator.as_str()[..2]);
        assert_eq!(fs::read_dir(shard).unwrap().count(), 0);
    }
}

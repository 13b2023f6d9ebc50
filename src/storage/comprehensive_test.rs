//! Comprehensive tests for the blob storage abstraction layer

#[cfg(test)]
mod integration_tests {
    use crate::service::user_context::RequestContext;
    use crate::storage::config::{StorageBackend, StorageConfig};
    use crate::storage::StorageLocator;
    use std::io::Cursor;

    #[test]
    fn test_storage_abstraction_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let backends = vec![StorageBackend::Mock, StorageBackend::LocalFs];

        for backend in backends {
            let config = StorageConfig {
                backend: backend.clone(),
                base_path: dir.path().join(format!("{:?}", backend)).to_string_lossy().into_owned(),
                ..StorageConfig::default()
            };
            let store = config.create_store().expect("Store creation failed");
            let ctx = RequestContext::for_user(42);

            let locator = StorageLocator::generate();
            let test_data = format!("End-to-end test data for {:?}", backend).into_bytes();

            store
                .write_at_locator(&ctx, &locator, &mut Cursor::new(test_data.clone()))
                .expect("Write failed");
            assert!(store.exists(&locator).expect("Exists failed"));

            let retrieved = store.read_at_locator(&ctx, &locator).expect("Read failed");
            assert_eq!(retrieved, test_data);

            let listed = store.list_locators().expect("List failed");
            assert_eq!(listed.len(), 1, "backend {:?}", backend);
            assert_eq!(listed[0].locator, locator);

            assert!(store.remove_at_locator(&locator).expect("Remove failed"));
            assert!(store.read_at_locator(&ctx, &locator).is_err());
            assert!(!store.remove_at_locator(&locator).expect("Second remove failed"));
        }
    }

    #[test]
    fn test_large_stream_is_copied_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::LocalFs,
            base_path: dir.path().to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };
        let store = config.create_store().unwrap();
        let ctx = RequestContext::for_user(1);

        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let locator = StorageLocator::generate();
        let written = store
            .write_at_locator(&ctx, &locator, &mut Cursor::new(payload.clone()))
            .unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(store.read_at_locator(&ctx, &locator).unwrap(), payload);
    }

    #[test]
    fn test_distinct_locators_do_not_collide() {
        let store = StorageConfig {
            backend: StorageBackend::Mock,
            ..StorageConfig::default()
        }
        .create_store()
        .unwrap();
        let ctx = RequestContext::for_user(1);

        let first = StorageLocator::generate();
        let second = StorageLocator::generate();
        store.write_at_locator(&ctx, &first, &mut Cursor::new(b"one".to_vec())).unwrap();
        store.write_at_locator(&ctx, &second, &mut Cursor::new(b"two".to_vec())).unwrap();

        assert_eq!(store.read_at_locator(&ctx, &first).unwrap(), b"one");
        assert_eq!(store.read_at_locator(&ctx, &second).unwrap(), b"two");
    }
}

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use dedup_drive::error::VaultError;
use dedup_drive::metadata::{content_repo, link_repo, ContentObject, LinkFilter, MetadataStore, Visibility};
use dedup_drive::service::content_store::ContentStore;
use dedup_drive::service::user_context::RequestContext;
use dedup_drive::service::vault::{FileVault, VaultSettings};
use dedup_drive::storage::mock_store::MockBlobStore;

fn setup(settings: VaultSettings) -> (tempfile::TempDir, FileVault, Arc<MockBlobStore>) {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(
        MetadataStore::open_path(dir.path().join("meta.db"), Duration::from_secs(10), true).unwrap(),
    );
    let blobs = Arc::new(MockBlobStore::new());
    let vault = FileVault::new(metadata, blobs.clone(), settings);
    (dir, vault, blobs)
}

fn register(vault: &FileVault, name: &str) -> RequestContext {
    let account = vault
        .register_user(&RequestContext::anonymous(), name, &format!("{}@example.com", name), "hash")
        .unwrap();
    RequestContext::for_user(account.id)
}

fn object_for(vault: &FileVault, data: &[u8]) -> Option<ContentObject> {
    let hash = ContentStore::hash(data);
    vault
        .metadata()
        .read(&RequestContext::anonymous(), |conn| content_repo::find_by_hash(conn, &hash))
        .unwrap()
}

fn pdf_bytes(len: usize) -> Vec<u8> {
    let mut data = b"%PDF-1.4\n".to_vec();
    data.extend((0..len - data.len()).map(|i| (i % 251) as u8));
    data
}

#[test]
fn test_shared_report_lifecycle() {
    let (_dir, vault, blobs) = setup(VaultSettings::default());
    let alice = register(&vault, "alice");
    let bob = register(&vault, "bob");
    let data = pdf_bytes(500_000);

    let first = vault.upload(&alice, &mut data.as_slice(), "report.pdf", Some(500_000)).unwrap();
    assert!(first.is_owner);
    assert_eq!(first.mime_type, "application/pdf");
    assert_eq!(object_for(&vault, &data).unwrap().reference_count, 1);

    let second = vault.upload(&bob, &mut data.as_slice(), "copy.pdf", None).unwrap();
    assert!(!second.is_owner);
    assert_eq!(second.content_id, first.content_id);
    assert_eq!(second.filename, "copy.pdf");
    assert_eq!(object_for(&vault, &data).unwrap().reference_count, 2);
    assert_eq!(blobs.write_count(), 1);

    let a_stats = vault.quota_stats(&alice).unwrap();
    assert_eq!((a_stats.actual_bytes, a_stats.expected_bytes), (500_000, 500_000));
    let b_stats = vault.quota_stats(&bob).unwrap();
    assert_eq!((b_stats.actual_bytes, b_stats.expected_bytes), (0, 500_000));
    assert_eq!(b_stats.savings_bytes, 500_000);

    let outcome = vault.delete(&alice, first.id).unwrap();
    assert_eq!(outcome.remaining_references, 1);
    assert!(!outcome.purged);
    assert_eq!(object_for(&vault, &data).unwrap().reference_count, 1);
    assert_eq!(blobs.blob_count(), 1);
    assert_eq!(vault.quota_stats(&alice).unwrap().actual_bytes, 0);

    // Bob still reads the bytes Alice introduced
    let ticket = vault.download(&bob, second.id).unwrap();
    assert_eq!(vault.read_blob(&bob, &ticket.locator).unwrap(), data);

    let outcome = vault.delete(&bob, second.id).unwrap();
    assert!(outcome.purged);
    assert!(outcome.blob_removal_error.is_none());
    assert!(object_for(&vault, &data).is_none());
    assert_eq!(blobs.blob_count(), 0);
    assert_eq!(vault.quota_stats(&bob).unwrap().expected_bytes, 0);
}

#[test]
fn test_identical_uploads_share_one_object() {
    let (_dir, vault, blobs) = setup(VaultSettings::default());
    let data = b"the same notes for everybody".to_vec();

    for i in 0..5 {
        let ctx = register(&vault, &format!("user{}", i));
        vault
            .upload(&ctx, &mut data.as_slice(), &format!("notes-{}.txt", i), None)
            .unwrap();
    }

    let object = object_for(&vault, &data).unwrap();
    assert_eq!(object.reference_count, 5);
    assert_eq!(blobs.write_count(), 1);
    assert_eq!(blobs.blob_count(), 1);
    let links = vault
        .metadata()
        .read(&RequestContext::anonymous(), |conn| link_repo::count_for_content(conn, object.id))
        .unwrap();
    assert_eq!(links, 5);
}

#[test]
fn test_reupload_of_held_content_conflicts() {
    let (_dir, vault, blobs) = setup(VaultSettings::default());
    let ctx = register(&vault, "carol");
    let data = b"draft".to_vec();

    vault.upload(&ctx, &mut data.as_slice(), "draft.txt", None).unwrap();
    let again = vault.upload(&ctx, &mut data.as_slice(), "renamed.txt", None);
    assert!(matches!(again, Err(VaultError::Conflict(_))));

    assert_eq!(object_for(&vault, &data).unwrap().reference_count, 1);
    assert_eq!(blobs.write_count(), 1);
    assert_eq!(vault.quota_stats(&ctx).unwrap().expected_bytes, 5);
}

#[test]
fn test_public_link_toggle() {
    let (_dir, vault, _blobs) = setup(VaultSettings::default());
    let owner = register(&vault, "owner");
    let holder = register(&vault, "holder");
    let data = b"shareable content".to_vec();

    let link = vault.upload(&owner, &mut data.as_slice(), "share.txt", None).unwrap();
    let held = vault.upload(&holder, &mut data.as_slice(), "mine.txt", None).unwrap();

    let public = vault.set_visibility(&owner, link.id, true).unwrap();
    assert_eq!(public.visibility, Visibility::Public);
    let token = public.public_token.clone().unwrap();
    assert_eq!(token.len(), 32);
    assert_eq!(public.public_link.as_deref(), Some(format!("/api/public/{}", token).as_str()));
    assert_eq!(public.download_count, Some(0));

    // Publishing again keeps the token
    let again = vault.set_visibility(&owner, link.id, true).unwrap();
    assert_eq!(again.public_token.as_deref(), Some(token.as_str()));

    let anonymous = RequestContext::anonymous();
    let ticket = vault.resolve_public(&anonymous, &token).unwrap();
    assert_eq!(ticket.filename, "share.txt");
    assert_eq!(vault.read_blob(&anonymous, &ticket.locator).unwrap(), data);

    let listed = vault.list(&owner, &LinkFilter::default()).unwrap();
    assert_eq!(listed[0].download_count, Some(1));

    assert!(matches!(
        vault.set_visibility(&holder, held.id, true),
        Err(VaultError::Forbidden(_))
    ));
    assert!(matches!(
        vault.set_visibility(&holder, link.id, true),
        Err(VaultError::NotFound(_))
    ));

    let private = vault.set_visibility(&owner, link.id, false).unwrap();
    assert_eq!(private.visibility, Visibility::Private);
    assert!(private.public_token.is_none());
    assert!(private.download_count.is_none());
    assert!(matches!(
        vault.resolve_public(&anonymous, &token),
        Err(VaultError::InvalidOrPrivate)
    ));
}

#[test]
fn test_quota_exceeded_leaves_nothing_behind() {
    let settings = VaultSettings {
        quota_limit: Some(1_000),
        ..VaultSettings::default()
    };
    let (_dir, vault, blobs) = setup(settings);
    let ctx = register(&vault, "dave");

    vault.upload(&ctx, &mut vec![b'a'; 600].as_slice(), "first.txt", None).unwrap();
    let result = vault.upload(&ctx, &mut vec![b'b'; 600].as_slice(), "second.txt", None);
    match result {
        Err(VaultError::QuotaExceeded { requested, available, .. }) => {
            assert_eq!(requested, 600);
            assert_eq!(available, 400);
        }
        other => panic!("expected QuotaExceeded, got {:?}", other.map(|v| v.id)),
    }

    assert!(matches!(
        vault.upload(&ctx, &mut vec![b'c'; 600].as_slice(), "third.txt", Some(600)),
        Err(VaultError::QuotaExceeded { .. })
    ));
    assert_eq!(blobs.write_count(), 1);
    assert_eq!(vault.list(&ctx, &LinkFilter::default()).unwrap().len(), 1);
    assert_eq!(vault.quota_stats(&ctx).unwrap().actual_bytes, 600);
}

#[test]
fn test_storage_failure_rolls_back_upload() {
    let (_dir, vault, blobs) = setup(VaultSettings::default());
    let ctx = register(&vault, "erin");
    let data = b"this write will fail".to_vec();

    blobs.set_fail_writes(true);
    let result = vault.upload(&ctx, &mut data.as_slice(), "doomed.txt", None);
    assert!(matches!(result, Err(VaultError::StorageIo(_))));

    assert_eq!(blobs.blob_count(), 0);
    assert!(object_for(&vault, &data).is_none());
    assert!(vault.list(&ctx, &LinkFilter::default()).unwrap().is_empty());
    let stats = vault.quota_stats(&ctx).unwrap();
    assert_eq!((stats.actual_bytes, stats.expected_bytes), (0, 0));

    blobs.set_fail_writes(false);
    vault.upload(&ctx, &mut data.as_slice(), "doomed.txt", None).unwrap();
    assert_eq!(object_for(&vault, &data).unwrap().reference_count, 1);
}

#[test]
fn test_blob_removal_failure_is_reported() {
    let (_dir, vault, blobs) = setup(VaultSettings::default());
    let ctx = register(&vault, "frank");
    let data = b"sticky bytes".to_vec();
    let link = vault.upload(&ctx, &mut data.as_slice(), "sticky.txt", None).unwrap();

    blobs.set_fail_removals(true);
    let outcome = vault.delete(&ctx, link.id).unwrap();
    assert!(outcome.purged);
    assert!(outcome.blob_removal_error.is_some());
    assert!(object_for(&vault, &data).is_none());
    assert_eq!(blobs.blob_count(), 1);

    assert!(matches!(vault.delete(&ctx, link.id), Err(VaultError::NotFound(_))));
}

#[test]
fn test_listing_filters() {
    let (_dir, vault, _blobs) = setup(VaultSettings::default());
    let ctx = register(&vault, "grace");
    vault.upload(&ctx, &mut b"alpha".as_slice(), "Alpha.txt", None).unwrap();
    vault.upload(&ctx, &mut pdf_bytes(2_000).as_slice(), "annual-report.pdf", None).unwrap();
    vault.upload(&ctx, &mut b"gamma gamma".as_slice(), "gamma.md", None).unwrap();

    let all = vault.list(&ctx, &LinkFilter::default()).unwrap();
    assert_eq!(all.len(), 3);

    let by_name = LinkFilter {
        filename: Some("alpha".to_string()),
        ..LinkFilter::default()
    };
    assert_eq!(vault.list(&ctx, &by_name).unwrap()[0].filename, "Alpha.txt");

    let pdfs = LinkFilter {
        mime_type: Some("pdf".to_string()),
        ..LinkFilter::default()
    };
    assert_eq!(vault.list(&ctx, &pdfs).unwrap().len(), 1);

    let large = LinkFilter {
        min_size: Some(10),
        ..LinkFilter::default()
    };
    assert_eq!(vault.list(&ctx, &large).unwrap().len(), 2);

    let inverted = LinkFilter {
        min_size: Some(10),
        max_size: Some(5),
        ..LinkFilter::default()
    };
    assert!(matches!(vault.list(&ctx, &inverted), Err(VaultError::Validation(_))));
}

#[test]
fn test_concurrent_identical_uploads() {
    let (_dir, vault, blobs) = setup(VaultSettings::default());
    let data = Arc::new(b"popular download".repeat(100));
    let users: Vec<RequestContext> = (0..8).map(|i| register(&vault, &format!("racer{}", i))).collect();

    let handles: Vec<_> = users
        .into_iter()
        .enumerate()
        .map(|(i, ctx)| {
            let vault = vault.clone();
            let data = data.clone();
            thread::spawn(move || {
                vault
                    .upload(&ctx, &mut data.as_slice(), &format!("copy{}.txt", i), None)
                    .unwrap()
            })
        })
        .collect();

    let views: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(views.iter().filter(|v| v.is_owner).count(), 1);

    let object = object_for(&vault, &data).unwrap();
    assert_eq!(object.reference_count, 8);
    assert_eq!(blobs.blob_count(), 1);
}

#[test]
fn test_quota_race_discards_losing_upload() {
    for _ in 0..10 {
        let settings = VaultSettings {
            quota_limit: Some(1_000),
            ..VaultSettings::default()
        };
        let (_dir, vault, blobs) = setup(settings);
        let ctx = register(&vault, "henry");
        let barrier = Arc::new(Barrier::new(2));
        let payloads: Vec<Vec<u8>> = vec![vec![b'x'; 600], vec![b'y'; 600]];

        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, data)| {
                let vault = vault.clone();
                let ctx = ctx.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    vault.upload(&ctx, &mut data.as_slice(), &format!("part{}.txt", i), None)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 1);
        for result in &results {
            if let Err(e) = result {
                assert!(matches!(e, VaultError::QuotaExceeded { .. }), "unexpected error: {}", e);
            }
        }

        // Whichever upload lost leaves neither bytes nor a content row
        assert_eq!(blobs.blob_count(), succeeded);
        let stored = payloads.iter().filter(|p| object_for(&vault, p).is_some()).count();
        assert_eq!(stored, succeeded);
        assert_eq!(vault.quota_stats(&ctx).unwrap().actual_bytes, 600);
    }
}

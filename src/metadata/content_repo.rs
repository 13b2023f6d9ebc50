//! content_repo.rs
//!
//! Queries over the `content_objects` table. Reference counts are only ever
//! adjusted with a single `UPDATE ... RETURNING` statement.

use chrono::Utc;
use log::error;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{VaultError, VaultResult};
use crate::metadata::{hash_column, locator_column, time_column, to_db_time};
use crate::metadata::{ContentHash, ContentObject, UnitOfWork};
use crate::storage::StorageLocator;

const COLUMNS: &str =
    "id, content_hash, size_bytes, mime_type, storage_locator, reference_count, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ContentObject> {
    let hash: String = row.get(1)?;
    let locator: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    Ok(ContentObject {
        id: row.get(0)?,
        content_hash: hash_column(1, &hash)?,
        size_bytes: row.get::<_, i64>(2)? as u64,
        mime_type: row.get(3)?,
        storage_locator: locator_column(4, &locator)?,
        reference_count: row.get::<_, i64>(5)? as u64,
        created_at: time_column(6, &created_at)?,
    })
}

/// Insert a new content object with a reference count of zero. A UNIQUE
/// violation on `content_hash` is returned as-is so the caller can fall back
/// to the dedup path.
pub fn insert(
    uow: &UnitOfWork<'_>,
    hash: &ContentHash,
    size_bytes: u64,
    mime_type: &str,
    locator: &StorageLocator,
) -> VaultResult<ContentObject> {
    let now = Utc::now();
    uow.execute(
        "INSERT INTO content_objects
            (content_hash, size_bytes, mime_type, storage_locator, reference_count, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![hash.as_str(), size_bytes as i64, mime_type, locator.as_str(), to_db_time(&now)],
    )?;
    let id = uow.last_insert_rowid();
    get(uow, id)
}

pub fn find(conn: &Connection, id: i64) -> VaultResult<Option<ContentObject>> {
    let sql = format!("SELECT {} FROM content_objects WHERE id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], from_row).optional()?)
}

pub fn get(conn: &Connection, id: i64) -> VaultResult<ContentObject> {
    find(conn, id)?.ok_or_else(|| VaultError::NotFound(format!("content object {}", id)))
}

pub fn find_by_hash(conn: &Connection, hash: &ContentHash) -> VaultResult<Option<ContentObject>> {
    let sql = format!("SELECT {} FROM content_objects WHERE content_hash = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![hash.as_str()], from_row).optional()?)
}

pub fn find_by_locator(conn: &Connection, locator: &StorageLocator) -> VaultResult<Option<ContentObject>> {
    let sql = format!("SELECT {} FROM content_objects WHERE storage_locator = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![locator.as_str()], from_row).optional()?)
}

/// Atomically add one reference and return the new count
pub fn increment_ref(uow: &UnitOfWork<'_>, id: i64) -> VaultResult<u64> {
    let count: Option<i64> = uow
        .query_row(
            "UPDATE content_objects SET reference_count = reference_count + 1
             WHERE id = ?1 RETURNING reference_count",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    count
        .map(|c| c as u64)
        .ok_or_else(|| VaultError::NotFound(format!("content object {}", id)))
}

/// Atomically remove one reference and return the new count. The row is
/// never taken below zero; an attempt to do so is an invariant violation.
pub fn decrement_ref(uow: &UnitOfWork<'_>, id: i64) -> VaultResult<u64> {
    let count: Option<i64> = uow
        .query_row(
            "UPDATE content_objects SET reference_count = reference_count - 1
             WHERE id = ?1 AND reference_count > 0 RETURNING reference_count",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match count {
        Some(c) => Ok(c as u64),
        None => {
            if find(uow, id)?.is_some() {
                error!("Reference count underflow on content object {}", id);
                Err(VaultError::InvariantViolation(format!(
                    "reference count of content object {} would drop below zero",
                    id
                )))
            } else {
                Err(VaultError::NotFound(format!("content object {}", id)))
            }
        }
    }
}

/// Delete a content object row whose reference count is zero. Returns false
/// if the row is missing or still referenced.
pub fn delete_unreferenced(uow: &UnitOfWork<'_>, id: i64) -> VaultResult<bool> {
    let deleted = uow.execute(
        "DELETE FROM content_objects WHERE id = ?1 AND reference_count = 0
         AND NOT EXISTS (SELECT 1 FROM ownership_links WHERE content_id = ?1)",
        params![id],
    )?;
    Ok(deleted == 1)
}

/// Content objects left at zero references with no links pointing at them
pub fn find_unreferenced(conn: &Connection) -> VaultResult<Vec<ContentObject>> {
    let sql = format!(
        "SELECT {} FROM content_objects c WHERE reference_count = 0
         AND NOT EXISTS (SELECT 1 FROM ownership_links l WHERE l.content_id = c.id)",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use crate::service::user_context::RequestContext;
    use std::time::Duration;

    fn temp_store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MetadataStore::open_path(dir.path().join("meta.db"), Duration::from_secs(5), true).unwrap();
        (dir, store)
    }

    fn hash_of(byte: u8) -> ContentHash {
        ContentHash::from_digest(&[byte; 32])
    }

    #[test]
    fn test_insert_starts_at_zero_references() {
        let (_dir, store) = temp_store();
        let ctx = RequestContext::anonymous();
        let locator = StorageLocator::generate();

        let object = store
            .unit_of_work(&ctx, |uow| insert(uow, &hash_of(1), 42, "text/plain", &locator))
            .unwrap();
        assert_eq!(object.reference_count, 0);
        assert_eq!(object.size_bytes, 42);
        assert_eq!(object.storage_locator, locator);

        let found = store.read(&ctx, |conn| find_by_hash(conn, &hash_of(1))).unwrap();
        assert_eq!(found, Some(object.clone()));
        let by_locator = store.read(&ctx, |conn| find_by_locator(conn, &locator)).unwrap();
        assert_eq!(by_locator.map(|o| o.id), Some(object.id));
    }

    #[test]
    fn test_duplicate_hash_is_unique_violation() {
        let (_dir, store) = temp_store();
        let ctx = RequestContext::anonymous();
        store
            .unit_of_work(&ctx, |uow| {
                insert(uow, &hash_of(2), 1, "text/plain", &StorageLocator::generate())
            })
            .unwrap();

        let err = store
            .unit_of_work(&ctx, |uow| {
                insert(uow, &hash_of(2), 1, "text/plain", &StorageLocator::generate())
            })
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn test_reference_counting() {
        let (_dir, store) = temp_store();
        let ctx = RequestContext::anonymous();
        let id = store
            .unit_of_work(&ctx, |uow| {
                insert(uow, &hash_of(3), 10, "text/plain", &StorageLocator::generate()).map(|o| o.id)
            })
            .unwrap();

        let counts = store
            .unit_of_work(&ctx, |uow| {
                let a = increment_ref(uow, id)?;
                let b = increment_ref(uow, id)?;
                let c = decrement_ref(uow, id)?;
                Ok((a, b, c))
            })
            .unwrap();
        assert_eq!(counts, (1, 2, 1));

        let zero = store.unit_of_work(&ctx, |uow| decrement_ref(uow, id)).unwrap();
        assert_eq!(zero, 0);

        let underflow = store.unit_of_work(&ctx, |uow| decrement_ref(uow, id));
        assert!(matches!(underflow, Err(VaultError::InvariantViolation(_))));
        assert_eq!(store.read(&ctx, |conn| get(conn, id)).unwrap().reference_count, 0);

        let missing = store.unit_of_work(&ctx, |uow| increment_ref(uow, 9999));
        assert!(matches!(missing, Err(VaultError::NotFound(_))));
    }

    #[test]
    fn test_delete_unreferenced_only_at_zero() {
        let (_dir, store) = temp_store();
        let ctx = RequestContext::anonymous();
        let id = store
            .unit_of_work(&ctx, |uow| {
                let object = insert(uow, &hash_of(4), 10, "text/plain", &StorageLocator::generate())?;
                increment_ref(uow, object.id)?;
                Ok(object.id)
            })
            .unwrap();

        assert!(!store.unit_of_work(&ctx, |uow| delete_unreferenced(uow, id)).unwrap());
        assert!(store.read(&ctx, find_unreferenced).unwrap().is_empty());

        store.unit_of_work(&ctx, |uow| decrement_ref(uow, id)).unwrap();
        assert_eq!(store.read(&ctx, find_unreferenced).unwrap().len(), 1);
        assert!(store.unit_of_work(&ctx, |uow| delete_unreferenced(uow, id)).unwrap());
        assert!(store.read(&ctx, |conn| find(conn, id)).unwrap().is_none());
    }
}

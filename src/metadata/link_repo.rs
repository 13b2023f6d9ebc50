//! link_repo.rs
//!
//! Queries over the `ownership_links` table. Listing joins each link against
//! its content object and owning account.

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{is_foreign_key_violation, is_unique_violation, VaultError, VaultResult};
use crate::metadata::{hash_column, locator_column, time_column, to_db_time};
use crate::metadata::{ContentHash, LinkFilter, LinkRow, OwnershipLink, UnitOfWork, Visibility};

const COLUMNS: &str = "l.id, l.user_id, l.content_id, l.display_name, l.uploaded_at, \
                       l.download_count, l.is_owner, l.visibility, l.public_token";

const ROW_COLUMNS: &str = "l.id, l.user_id, l.content_id, l.display_name, l.uploaded_at, \
                           l.download_count, l.is_owner, l.visibility, l.public_token, \
                           c.size_bytes, c.mime_type, c.content_hash, c.storage_locator, u.username";

const ROW_JOIN: &str = "FROM ownership_links l
     JOIN content_objects c ON c.id = l.content_id
     JOIN users u ON u.id = l.user_id";

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<OwnershipLink> {
    let uploaded_at: String = row.get(4)?;
    Ok(OwnershipLink {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content_id: row.get(2)?,
        display_name: row.get(3)?,
        uploaded_at: time_column(4, &uploaded_at)?,
        download_count: row.get::<_, i64>(5)? as u64,
        is_owner: row.get(6)?,
        visibility: row.get(7)?,
        public_token: row.get(8)?,
    })
}

fn joined_from_row(row: &Row<'_>) -> rusqlite::Result<LinkRow> {
    let hash: String = row.get(11)?;
    let locator: String = row.get(12)?;
    Ok(LinkRow {
        link: link_from_row(row)?,
        size_bytes: row.get::<_, i64>(9)? as u64,
        mime_type: row.get(10)?,
        content_hash: hash_column(11, &hash)?,
        storage_locator: locator_column(12, &locator)?,
        username: row.get(13)?,
    })
}

/// Create a private link. A second link for the same (user, content) pair is
/// a Conflict; a link for an unknown user is NotFound.
pub fn insert(
    uow: &UnitOfWork<'_>,
    user_id: i64,
    content_id: i64,
    display_name: &str,
    is_owner: bool,
) -> VaultResult<OwnershipLink> {
    let result = uow.execute(
        "INSERT INTO ownership_links (user_id, content_id, display_name, uploaded_at, is_owner, visibility)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id,
            content_id,
            display_name,
            to_db_time(&Utc::now()),
            is_owner,
            Visibility::Private
        ],
    );
    match result {
        Ok(_) => get(uow, uow.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => Err(VaultError::Conflict(format!(
            "user {} already holds content {}",
            user_id, content_id
        ))),
        Err(e) if is_foreign_key_violation(&e) => {
            Err(VaultError::NotFound(format!("user {} or content {}", user_id, content_id)))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn find(conn: &Connection, id: i64) -> VaultResult<Option<OwnershipLink>> {
    let sql = format!("SELECT {} FROM ownership_links l WHERE l.id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], link_from_row).optional()?)
}

pub fn get(conn: &Connection, id: i64) -> VaultResult<OwnershipLink> {
    find(conn, id)?.ok_or_else(|| VaultError::NotFound(format!("link {}", id)))
}

/// Resolve a link scoped to its user; links held by anyone else are invisible
pub fn get_for_user(conn: &Connection, user_id: i64, id: i64) -> VaultResult<OwnershipLink> {
    let sql = format!(
        "SELECT {} FROM ownership_links l WHERE l.id = ?1 AND l.user_id = ?2",
        COLUMNS
    );
    conn.query_row(&sql, params![id, user_id], link_from_row)
        .optional()?
        .ok_or_else(|| VaultError::NotFound(format!("link {}", id)))
}

/// A link joined with its content and account
pub fn find_row(conn: &Connection, id: i64) -> VaultResult<Option<LinkRow>> {
    let sql = format!("SELECT {} {} WHERE l.id = ?1", ROW_COLUMNS, ROW_JOIN);
    Ok(conn.query_row(&sql, params![id], joined_from_row).optional()?)
}

/// Only public links are resolvable by token
pub fn find_by_public_token(conn: &Connection, token: &str) -> VaultResult<Option<LinkRow>> {
    let sql = format!(
        "SELECT {} {} WHERE l.public_token = ?1 AND l.visibility = ?2",
        ROW_COLUMNS, ROW_JOIN
    );
    Ok(conn
        .query_row(&sql, params![token, Visibility::Public], joined_from_row)
        .optional()?)
}

pub fn user_has_hash(conn: &Connection, user_id: i64, hash: &ContentHash) -> VaultResult<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (
            SELECT 1 FROM ownership_links l
            JOIN content_objects c ON c.id = l.content_id
            WHERE l.user_id = ?1 AND c.content_hash = ?2)",
        params![user_id, hash.as_str()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Remove the link for (user, content); NotFound when there is none
pub fn delete_by_user_content(uow: &UnitOfWork<'_>, user_id: i64, content_id: i64) -> VaultResult<()> {
    let deleted = uow.execute(
        "DELETE FROM ownership_links WHERE user_id = ?1 AND content_id = ?2",
        params![user_id, content_id],
    )?;
    if deleted == 0 {
        return Err(VaultError::NotFound(format!(
            "link for user {} and content {}",
            user_id, content_id
        )));
    }
    Ok(())
}

pub fn count_for_content(conn: &Connection, content_id: i64) -> VaultResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM ownership_links WHERE content_id = ?1",
        params![content_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn increment_download_count(uow: &UnitOfWork<'_>, id: i64) -> VaultResult<()> {
    let updated = uow.execute(
        "UPDATE ownership_links SET download_count = download_count + 1 WHERE id = ?1",
        params![id],
    )?;
    if updated == 0 {
        return Err(VaultError::NotFound(format!("link {}", id)));
    }
    Ok(())
}

/// Persist a visibility transition. Token collisions surface as the raw
/// UNIQUE violation so the caller can retry with a fresh token.
pub fn update_visibility(
    uow: &UnitOfWork<'_>,
    id: i64,
    visibility: Visibility,
    token: Option<&str>,
) -> VaultResult<OwnershipLink> {
    let updated = uow.execute(
        "UPDATE ownership_links SET visibility = ?2, public_token = ?3 WHERE id = ?1",
        params![id, visibility, token],
    )?;
    if updated == 0 {
        return Err(VaultError::NotFound(format!("link {}", id)));
    }
    get(uow, id)
}

fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Size bounds beyond what SQLite can store saturate instead of wrapping
fn clamp_size(bound: u64) -> i64 {
    i64::try_from(bound).unwrap_or(i64::MAX)
}

/// Every link of `user_id` satisfying all predicates present in `filter`,
/// newest first
pub fn list_for_user(conn: &Connection, user_id: i64, filter: &LinkFilter) -> VaultResult<Vec<LinkRow>> {
    let mut clauses = vec!["l.user_id = ?".to_string()];
    let mut values: Vec<Value> = vec![Value::Integer(user_id)];

    if let Some(name) = filter.filename.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("l.display_name LIKE ? ESCAPE '\\'".to_string());
        values.push(Value::Text(like_pattern(name)));
    }
    if let Some(mime) = filter.mime_type.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("c.mime_type LIKE ? ESCAPE '\\'".to_string());
        values.push(Value::Text(like_pattern(mime)));
    }
    if let Some(min) = filter.min_size {
        clauses.push("c.size_bytes >= ?".to_string());
        values.push(Value::Integer(clamp_size(min)));
    }
    if let Some(max) = filter.max_size {
        clauses.push("c.size_bytes <= ?".to_string());
        values.push(Value::Integer(clamp_size(max)));
    }
    if let Some(after) = filter.uploaded_after {
        clauses.push("l.uploaded_at >= ?".to_string());
        values.push(Value::Text(to_db_time(&after)));
    }
    if let Some(before) = filter.uploaded_before {
        clauses.push("l.uploaded_at <= ?".to_string());
        values.push(Value::Text(to_db_time(&before)));
    }

    let sql = format!(
        "SELECT {} {} WHERE {} ORDER BY l.uploaded_at DESC, l.id DESC",
        ROW_COLUMNS,
        ROW_JOIN,
        clauses.join(" AND ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), joined_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

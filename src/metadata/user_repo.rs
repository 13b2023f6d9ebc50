//! Queries over the `users` table, including the quota counters

use chrono::Utc;
use log::error;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{is_unique_violation, VaultError, VaultResult};
use crate::metadata::{time_column, to_db_time, UnitOfWork, UserAccount};

const COLUMNS: &str =
    "id, username, email, password_hash, expected_storage_bytes, actual_storage_bytes, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<UserAccount> {
    let created_at: String = row.get(6)?;
    Ok(UserAccount {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        expected_storage_bytes: row.get::<_, i64>(4)? as u64,
        actual_storage_bytes: row.get::<_, i64>(5)? as u64,
        created_at: time_column(6, &created_at)?,
    })
}

/// Create an account with zeroed counters. Duplicate usernames or emails are
/// reported as Conflict.
pub fn insert(
    uow: &UnitOfWork<'_>,
    username: &str,
    email: &str,
    password_hash: &str,
) -> VaultResult<UserAccount> {
    let result = uow.execute(
        "INSERT INTO users (username, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![username, email, password_hash, to_db_time(&Utc::now())],
    );
    match result {
        Ok(_) => get(uow, uow.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => Err(VaultError::Conflict(format!(
            "username or email already registered: {}",
            username
        ))),
        Err(e) => Err(e.into()),
    }
}

pub fn find(conn: &Connection, id: i64) -> VaultResult<Option<UserAccount>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], from_row).optional()?)
}

pub fn get(conn: &Connection, id: i64) -> VaultResult<UserAccount> {
    find(conn, id)?.ok_or_else(|| VaultError::NotFound(format!("user {}", id)))
}

/// Add signed deltas to both counters in one statement. The update is
/// refused rather than clamped when either counter would go negative.
pub fn apply_delta(
    uow: &UnitOfWork<'_>,
    id: i64,
    actual_delta: i64,
    expected_delta: i64,
) -> VaultResult<UserAccount> {
    let updated = uow.execute(
        "UPDATE users SET
            actual_storage_bytes = actual_storage_bytes + ?2,
            expected_storage_bytes = expected_storage_bytes + ?3
         WHERE id = ?1
           AND actual_storage_bytes + ?2 >= 0
           AND expected_storage_bytes + ?3 >= 0",
        params![id, actual_delta, expected_delta],
    )?;
    if updated == 0 {
        let user = get(uow, id)?;
        error!(
            "Storage counter underflow for user {}: actual {} {:+}, expected {} {:+}",
            id, user.actual_storage_bytes, actual_delta, user.expected_storage_bytes, expected_delta
        );
        return Err(VaultError::InvariantViolation(format!(
            "storage counters of user {} would go negative",
            id
        )));
    }
    get(uow, id)
}

//! Metadata Storage Layer
//!
//! Row models, the SQLite schema and the `UnitOfWork` transaction scope.
//! Repositories are free functions over a connection: read helpers accept any
//! `&Connection`, mutating helpers require a `&UnitOfWork` so that every write
//! happens inside a transaction.

pub mod sqlite_store;
pub mod config;
pub mod content_repo;
pub mod link_repo;
pub mod user_repo;


use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::storage::StorageLocator;

pub use sqlite_store::{MetadataStore, UnitOfWork};

/// Hex-encoded SHA-256 of the raw bytes; the global dedup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn parse(raw: &str) -> VaultResult<Self> {
        if raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(raw.to_string()))
        } else {
            Err(VaultError::Validation(format!("not a SHA-256 hex digest: {}", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Visibility::Private),
            "public" => Ok(Visibility::Public),
            other => Err(format!("unknown visibility: {}", other)),
        }
    }
}

impl ToSql for Visibility {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Visibility {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Physical content shared by every link that points at it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentObject {
    pub id: i64,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub mime_type: String,
    pub storage_locator: StorageLocator,
    pub reference_count: u64,
    pub created_at: DateTime<Utc>,
}

/// A user's claim on a content object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnershipLink {
    pub id: i64,
    pub user_id: i64,
    pub content_id: i64,
    pub display_name: String,
    pub uploaded_at: DateTime<Utc>,
    pub download_count: u64,
    pub is_owner: bool,
    pub visibility: Visibility,
    pub public_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserAccount {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub expected_storage_bytes: u64,
    pub actual_storage_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Optional predicates for listing a user's links; all present predicates must hold
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LinkFilter {
    /// Case-insensitive substring of the display name
    pub filename: Option<String>,
    /// Substring of the MIME type
    pub mime_type: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
}

/// A link joined against its content object and owning account
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRow {
    pub link: OwnershipLink,
    pub size_bytes: u64,
    pub mime_type: String,
    pub content_hash: ContentHash,
    pub storage_locator: StorageLocator,
    pub username: String,
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that string
/// comparison in SQL matches chronological order.
pub fn to_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn time_column(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn locator_column(idx: usize, raw: &str) -> rusqlite::Result<StorageLocator> {
    StorageLocator::parse(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn hash_column(idx: usize, raw: &str) -> rusqlite::Result<ContentHash> {
    ContentHash::parse(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_content_hash_parse() {
        let hash = ContentHash::from_digest(&[0xab; 32]);
        assert_eq!(hash.as_str().len(), 64);
        assert_eq!(ContentHash::parse(hash.as_str()).unwrap(), hash);
        assert!(ContentHash::parse("ABCD").is_err());
        assert!(ContentHash::parse(&"G".repeat(64)).is_err());
    }

    #[test]
    fn test_visibility_round_trip_strings() {
        assert_eq!("public".parse::<Visibility>().unwrap(), Visibility::Public);
        assert_eq!(Visibility::Private.as_str(), "private");
        assert!("shared".parse::<Visibility>().is_err());
    }

    #[test]
    fn test_db_time_orders_lexically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 11, 2, 3, 4, 5).unwrap();
        assert!(to_db_time(&early) < to_db_time(&late));
        assert_eq!(time_column(0, &to_db_time(&early)).unwrap(), early);
    }
}

//! SQLite metadata store and the unit-of-work transaction scope

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::VaultResult;
use crate::metadata::config::MetadataConfig;
use crate::service::user_context::RequestContext;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        expected_storage_bytes INTEGER NOT NULL DEFAULT 0 CHECK (expected_storage_bytes >= 0),
        actual_storage_bytes INTEGER NOT NULL DEFAULT 0 CHECK (actual_storage_bytes >= 0),
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS content_objects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content_hash TEXT NOT NULL UNIQUE,
        size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
        mime_type TEXT NOT NULL,
        storage_locator TEXT NOT NULL UNIQUE,
        reference_count INTEGER NOT NULL DEFAULT 0 CHECK (reference_count >= 0),
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS ownership_links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        content_id INTEGER NOT NULL REFERENCES content_objects(id),
        display_name TEXT NOT NULL,
        uploaded_at TEXT NOT NULL,
        download_count INTEGER NOT NULL DEFAULT 0,
        is_owner INTEGER NOT NULL DEFAULT 0,
        visibility TEXT NOT NULL DEFAULT 'private' CHECK (visibility IN ('private', 'public')),
        public_token TEXT UNIQUE,
        UNIQUE (user_id, content_id),
        CHECK ((visibility = 'public') = (public_token IS NOT NULL))
    );

    CREATE INDEX IF NOT EXISTS idx_links_content ON ownership_links(content_id);
    CREATE INDEX IF NOT EXISTS idx_links_user_uploaded ON ownership_links(user_id, uploaded_at);
";

/// Opens one connection per unit of work, so concurrent requests only contend
/// on SQLite's own write lock.
pub struct MetadataStore {
    db_path: PathBuf,
    busy_timeout: Duration,
    wal_mode: bool,
}

impl MetadataStore {
    pub fn open(config: &MetadataConfig) -> VaultResult<Self> {
        Self::open_path(&config.db_path, config.busy_timeout(), config.wal_mode)
    }

    pub fn open_path(db_path: impl AsRef<Path>, busy_timeout: Duration, wal_mode: bool) -> VaultResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            db_path,
            busy_timeout,
            wal_mode,
        };
        let conn = store.connect(&RequestContext::anonymous())?;
        if store.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch(SCHEMA)?;
        info!("Metadata database ready at {}", store.db_path.display());
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self, ctx: &RequestContext) -> VaultResult<Connection> {
        ctx.check_deadline()?;
        let conn = Connection::open(&self.db_path)?;
        let timeout = match ctx.remaining() {
            Some(remaining) => remaining.min(self.busy_timeout),
            None => self.busy_timeout,
        };
        conn.busy_timeout(timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Run read-only queries outside of an explicit transaction
    pub fn read<T, F>(&self, ctx: &RequestContext, work: F) -> VaultResult<T>
    where
        F: FnOnce(&Connection) -> VaultResult<T>,
    {
        let conn = self.connect(ctx)?;
        work(&conn)
    }

    /// Run `work` inside one IMMEDIATE transaction. The transaction commits
    /// only if `work` succeeds and the caller's deadline has not passed;
    /// otherwise every mutation made through the unit of work is rolled back.
    pub fn unit_of_work<T, F>(&self, ctx: &RequestContext, work: F) -> VaultResult<T>
    where
        F: FnOnce(&UnitOfWork<'_>) -> VaultResult<T>,
    {
        let mut conn = self.connect(ctx)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let uow = UnitOfWork { tx };

        match work(&uow).and_then(|value| ctx.check_deadline().map(|_| value)) {
            Ok(value) => {
                uow.tx.commit()?;
                debug!("Unit of work committed");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = uow.tx.rollback() {
                    warn!("Rollback failed after {}: {}", e, rollback);
                }
                debug!("Unit of work rolled back: {}", e);
                Err(e)
            }
        }
    }
}

/// A single database transaction shared by every mutation of one logical
/// operation. Dereferences to the underlying connection for reads.
pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> Deref for UnitOfWork<'conn> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

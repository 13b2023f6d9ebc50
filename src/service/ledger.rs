//! Ownership Ledger
//!
//! Per-user links to content objects. Lookups by link id are always scoped to
//! the requesting user so one user can never observe another user's links.

use std::sync::Arc;

use log::debug;
use rusqlite::Connection;

use crate::error::{VaultError, VaultResult};
use crate::metadata::{link_repo, ContentHash, LinkFilter, LinkRow, MetadataStore, OwnershipLink, UnitOfWork, Visibility};
use crate::service::user_context::RequestContext;

/// Longest accepted display name, in bytes
pub const MAX_DISPLAY_NAME_LEN: usize = 255;

/// Reduce a client-supplied filename to a safe display name: the last path
/// component, non-empty, at most `MAX_DISPLAY_NAME_LEN` bytes, no control characters.
pub fn display_name(raw: &str) -> VaultResult<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(VaultError::Validation(format!("invalid file name: {:?}", raw)));
    }
    if name.len() > MAX_DISPLAY_NAME_LEN {
        return Err(VaultError::Validation(format!(
            "file name longer than {} bytes",
            MAX_DISPLAY_NAME_LEN
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(VaultError::Validation("file name contains control characters".to_string()));
    }
    Ok(name.to_string())
}

#[derive(Clone)]
pub struct OwnershipLedger {
    metadata: Arc<MetadataStore>,
}

impl OwnershipLedger {
    pub fn new(metadata: Arc<MetadataStore>) -> Self {
        Self { metadata }
    }

    pub fn create(
        &self,
        uow: &UnitOfWork<'_>,
        user_id: i64,
        content_id: i64,
        display_name: &str,
        is_owner: bool,
    ) -> VaultResult<OwnershipLink> {
        let link = link_repo::insert(uow, user_id, content_id, display_name, is_owner)?;
        debug!(
            "Linked content {} to user {} as {:?} (owner: {})",
            content_id, user_id, display_name, is_owner
        );
        Ok(link)
    }

    pub fn list_for_user(&self, ctx: &RequestContext, user_id: i64, filter: &LinkFilter) -> VaultResult<Vec<LinkRow>> {
        if let (Some(min), Some(max)) = (filter.min_size, filter.max_size) {
            if min > max {
                return Err(VaultError::Validation(format!(
                    "minimum size {} exceeds maximum size {}",
                    min, max
                )));
            }
        }
        if let (Some(after), Some(before)) = (filter.uploaded_after, filter.uploaded_before) {
            if after > before {
                return Err(VaultError::Validation("start date is after end date".to_string()));
            }
        }
        self.metadata.read(ctx, |conn| link_repo::list_for_user(conn, user_id, filter))
    }

    /// The link `link_id` if it belongs to `user_id`; NotFound otherwise
    pub fn get_user_link(&self, conn: &Connection, user_id: i64, link_id: i64) -> VaultResult<OwnershipLink> {
        link_repo::get_for_user(conn, user_id, link_id)
    }

    /// The link `link_id` if `user_id` holds it as owner. Holding the link
    /// without owning the content is Forbidden.
    pub fn get_owned_link(&self, conn: &Connection, user_id: i64, link_id: i64) -> VaultResult<OwnershipLink> {
        let link = self.get_user_link(conn, user_id, link_id)?;
        if !link.is_owner {
            return Err(VaultError::Forbidden(format!(
                "user {} does not own the content behind link {}",
                user_id, link_id
            )));
        }
        Ok(link)
    }

    /// A link of `user_id` joined with its content
    pub fn get_user_row(&self, ctx: &RequestContext, user_id: i64, link_id: i64) -> VaultResult<LinkRow> {
        self.metadata.read(ctx, |conn| {
            link_repo::find_row(conn, link_id)?
                .filter(|row| row.link.user_id == user_id)
                .ok_or_else(|| VaultError::NotFound(format!("link {}", link_id)))
        })
    }

    pub fn user_has_hash(&self, ctx: &RequestContext, user_id: i64, hash: &ContentHash) -> VaultResult<bool> {
        self.metadata.read(ctx, |conn| link_repo::user_has_hash(conn, user_id, hash))
    }

    pub fn delete(&self, uow: &UnitOfWork<'_>, user_id: i64, content_id: i64) -> VaultResult<()> {
        link_repo::delete_by_user_content(uow, user_id, content_id)
    }

    pub fn count_references(&self, conn: &Connection, content_id: i64) -> VaultResult<u64> {
        link_repo::count_for_content(conn, content_id)
    }

    pub fn increment_download_count(&self, ctx: &RequestContext, link_id: i64) -> VaultResult<()> {
        self.metadata
            .unit_of_work(ctx, |uow| link_repo::increment_download_count(uow, link_id))
    }

    pub fn find_public(&self, ctx: &RequestContext, token: &str) -> VaultResult<Option<LinkRow>> {
        self.metadata.read(ctx, |conn| link_repo::find_by_public_token(conn, token))
    }

    pub fn set_visibility(
        &self,
        uow: &UnitOfWork<'_>,
        link_id: i64,
        visibility: Visibility,
        token: Option<&str>,
    ) -> VaultResult<OwnershipLink> {
        link_repo::update_visibility(uow, link_id, visibility, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{content_repo, user_repo};
    use crate::storage::StorageLocator;
    use std::time::Duration;

    #[test]
    fn test_display_name_takes_basename() {
        assert_eq!(display_name("report.pdf").unwrap(), "report.pdf");
        assert_eq!(display_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(display_name("C:\\Users\\me\\notes.txt").unwrap(), "notes.txt");
        assert!(display_name("").is_err());
        assert!(display_name("dir/").is_err());
        assert!(display_name("..").is_err());
        assert!(display_name("bad\nname.txt").is_err());
        assert!(display_name(&"a".repeat(256)).is_err());
        assert!(display_name(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_owned_link_distinguishes_forbidden_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(
            MetadataStore::open_path(dir.path().join("meta.db"), Duration::from_secs(5), true).unwrap(),
        );
        let ledger = OwnershipLedger::new(metadata.clone());
        let ctx = RequestContext::anonymous();

        let (owner, holder, owner_link, holder_link) = metadata
            .unit_of_work(&ctx, |uow| {
                let owner = user_repo::insert(uow, "owner", "owner@example.com", "h")?;
                let holder = user_repo::insert(uow, "holder", "holder@example.com", "h")?;
                let content = content_repo::insert(
                    uow,
                    &ContentHash::from_digest(&[1; 32]),
                    3,
                    "text/plain",
                    &StorageLocator::generate(),
                )?;
                let a = ledger.create(uow, owner.id, content.id, "a.txt", true)?;
                let b = ledger.create(uow, holder.id, content.id, "b.txt", false)?;
                Ok((owner.id, holder.id, a.id, b.id))
            })
            .unwrap();

        metadata
            .read(&ctx, |conn| {
                assert!(ledger.get_owned_link(conn, owner, owner_link).is_ok());
                assert!(matches!(
                    ledger.get_owned_link(conn, holder, holder_link),
                    Err(VaultError::Forbidden(_))
                ));
                assert!(matches!(
                    ledger.get_owned_link(conn, holder, owner_link),
                    Err(VaultError::NotFound(_))
                ));
                Ok(())
            })
            .unwrap();

        let row = ledger.get_user_row(&ctx, holder, holder_link).unwrap();
        assert_eq!(row.size_bytes, 3);
        assert!(ledger.get_user_row(&ctx, owner, holder_link).is_err());
    }

    #[test]
    fn test_list_rejects_inverted_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(
            MetadataStore::open_path(dir.path().join("meta.db"), Duration::from_secs(5), true).unwrap(),
        );
        let ledger = OwnershipLedger::new(metadata);
        let filter = LinkFilter {
            min_size: Some(10),
            max_size: Some(1),
            ..LinkFilter::default()
        };
        assert!(matches!(
            ledger.list_for_user(&RequestContext::anonymous(), 1, &filter),
            Err(VaultError::Validation(_))
        ));
    }
}

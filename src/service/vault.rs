//! File Vault
//!
//! The operations exposed to the boundary layer. Every call takes a
//! `RequestContext`; user-scoped calls act on behalf of `ctx.user_id`.

use std::io::Read;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::error::{VaultError, VaultResult};
use crate::metadata::{user_repo, LinkFilter, LinkRow, MetadataStore, UserAccount, Visibility};
use crate::service::content_store::ContentStore;
use crate::service::deletion::{DeleteOutcome, DeletionPipeline};
use crate::service::ledger::OwnershipLedger;
use crate::service::orphan_sweeper::{OrphanSweeper, SweeperConfig};
use crate::service::quota::{QuotaAccountant, QuotaBasis, QuotaStats};
use crate::service::upload::{UploadPipeline, UploadSettings};
use crate::service::user_context::RequestContext;
use crate::service::visibility::{TokenSource, VisibilityManager};
use crate::storage::{BlobStorage, StorageLocator};

/// A link as presented to its holder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkView {
    pub id: i64,
    pub content_id: i64,
    pub filename: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub content_hash: String,
    pub uploaded_at: DateTime<Utc>,
    /// True when this user's upload introduced the content
    pub is_owner: bool,
    pub visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_link: Option<String>,
    /// Only reported while the link is public
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_count: Option<u64>,
}

impl From<LinkRow> for LinkView {
    fn from(row: LinkRow) -> Self {
        let public = row.link.visibility == Visibility::Public;
        Self {
            id: row.link.id,
            content_id: row.link.content_id,
            filename: row.link.display_name,
            size_bytes: row.size_bytes,
            mime_type: row.mime_type,
            content_hash: row.content_hash.to_string(),
            uploaded_at: row.link.uploaded_at,
            is_owner: row.link.is_owner,
            visibility: row.link.visibility,
            public_link: row.link.public_token.as_ref().map(|t| format!("/api/public/{}", t)),
            public_token: row.link.public_token,
            download_count: public.then_some(row.link.download_count),
        }
    }
}

/// Everything needed to stream a download back to the client
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTicket {
    pub locator: StorageLocator,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl From<&LinkRow> for DownloadTicket {
    fn from(row: &LinkRow) -> Self {
        Self {
            locator: row.storage_locator.clone(),
            filename: row.link.display_name.clone(),
            mime_type: row.mime_type.clone(),
            size_bytes: row.size_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub upload: UploadSettings,
    /// Per-user limit in bytes; `None` disables enforcement
    pub quota_limit: Option<u64>,
    pub quota_basis: QuotaBasis,
    pub max_token_attempts: u32,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            upload: UploadSettings::default(),
            quota_limit: Some(10 * 1024 * 1024),
            quota_basis: QuotaBasis::Actual,
            max_token_attempts: 5,
        }
    }
}

#[derive(Clone)]
pub struct FileVault {
    metadata: Arc<MetadataStore>,
    content: ContentStore,
    ledger: OwnershipLedger,
    quota: QuotaAccountant,
    visibility: VisibilityManager,
    uploads: UploadPipeline,
    deletions: DeletionPipeline,
}

impl FileVault {
    pub fn new(metadata: Arc<MetadataStore>, blobs: Arc<dyn BlobStorage>, settings: VaultSettings) -> Self {
        let content = ContentStore::new(metadata.clone(), blobs);
        let ledger = OwnershipLedger::new(metadata.clone());
        let quota = QuotaAccountant::new(metadata.clone(), settings.quota_limit, settings.quota_basis);
        let visibility = VisibilityManager::new(metadata.clone(), ledger.clone(), settings.max_token_attempts);
        let uploads = UploadPipeline::new(
            metadata.clone(),
            content.clone(),
            ledger.clone(),
            quota.clone(),
            settings.upload,
        );
        let deletions = DeletionPipeline::new(metadata.clone(), content.clone(), ledger.clone(), quota.clone());

        Self {
            metadata,
            content,
            ledger,
            quota,
            visibility,
            uploads,
            deletions,
        }
    }

    /// Replace the generator used for public tokens
    pub fn with_token_source(mut self, tokens: TokenSource) -> Self {
        self.visibility = self.visibility.with_token_source(tokens);
        self
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn upload_settings(&self) -> &UploadSettings {
        self.uploads.settings()
    }

    pub fn sweeper(&self, config: &SweeperConfig) -> OrphanSweeper {
        OrphanSweeper::new(self.metadata.clone(), self.content.clone(), config)
    }

    pub fn register_user(
        &self,
        ctx: &RequestContext,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> VaultResult<UserAccount> {
        let username = username.trim();
        let email = email.trim();
        if username.is_empty() || email.is_empty() || password_hash.is_empty() {
            return Err(VaultError::Validation(
                "username, email and password hash are required".to_string(),
            ));
        }
        if !email.contains('@') {
            return Err(VaultError::Validation(format!("invalid email address: {}", email)));
        }
        let account = self
            .metadata
            .unit_of_work(ctx, |uow| user_repo::insert(uow, username, email, password_hash))?;
        info!("Registered user {} ({})", account.id, account.username);
        Ok(account)
    }

    pub fn upload(
        &self,
        ctx: &RequestContext,
        source: &mut dyn Read,
        filename: &str,
        declared_size: Option<u64>,
    ) -> VaultResult<LinkView> {
        self.uploads
            .run(ctx, source, filename, declared_size)
            .map(LinkView::from)
    }

    pub fn list(&self, ctx: &RequestContext, filter: &LinkFilter) -> VaultResult<Vec<LinkView>> {
        let user_id = ctx.require_user()?;
        let rows = self.ledger.list_for_user(ctx, user_id, filter)?;
        Ok(rows.into_iter().map(LinkView::from).collect())
    }

    /// Resolve one of the caller's links for download and count it
    pub fn download(&self, ctx: &RequestContext, link_id: i64) -> VaultResult<DownloadTicket> {
        let user_id = ctx.require_user()?;
        let row = self.ledger.get_user_row(ctx, user_id, link_id)?;
        if let Err(e) = self.ledger.increment_download_count(ctx, link_id) {
            warn!("Failed to count download of link {}: {}", link_id, e);
        }
        Ok(DownloadTicket::from(&row))
    }

    pub fn delete(&self, ctx: &RequestContext, link_id: i64) -> VaultResult<DeleteOutcome> {
        self.deletions.run(ctx, link_id)
    }

    pub fn set_visibility(&self, ctx: &RequestContext, link_id: i64, make_public: bool) -> VaultResult<LinkView> {
        let user_id = ctx.require_user()?;
        self.visibility.set_visibility(ctx, user_id, link_id, make_public)?;
        self.ledger
            .get_user_row(ctx, user_id, link_id)
            .map(LinkView::from)
    }

    /// Anyone holding a valid token may download; no user is required
    pub fn resolve_public(&self, ctx: &RequestContext, token: &str) -> VaultResult<DownloadTicket> {
        let row = self.visibility.resolve_public(ctx, token)?;
        Ok(DownloadTicket::from(&row))
    }

    /// Fail fast when `incoming` bytes cannot fit the caller's quota
    pub fn check_quota(&self, ctx: &RequestContext, incoming: u64) -> VaultResult<()> {
        let user_id = ctx.require_user()?;
        self.quota.check_quota(ctx, user_id, incoming)
    }

    pub fn quota_stats(&self, ctx: &RequestContext) -> VaultResult<QuotaStats> {
        let user_id = ctx.require_user()?;
        self.quota.stats(ctx, user_id)
    }

    pub fn read_blob(&self, ctx: &RequestContext, locator: &StorageLocator) -> VaultResult<Vec<u8>> {
        self.content.blobs().read_at_locator(ctx, locator)
    }
}

//! Upload Pipeline
//!
//! validate -> inspect (hash, spool, sniff) -> dedup lookup -> stage bytes on
//! a miss -> one unit of work that registers content, links it, counts the
//! reference and charges the quota. Staged bytes that end up unused, or that
//! belong to a failed unit of work, are removed before returning.

use std::io::Read;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{VaultError, VaultResult};
use crate::metadata::{content_repo, ContentHash, LinkRow, MetadataStore, UnitOfWork};
use crate::service::content_store::{ContentStore, Registration};
use crate::service::inspect::inspect_stream;
use crate::service::ledger::{display_name, OwnershipLedger};
use crate::service::quota::QuotaAccountant;
use crate::service::sniff;
use crate::service::user_context::RequestContext;
use crate::storage::StorageLocator;

/// Bounds the retries when a dedup hit disappears before it can be linked
const MAX_LINK_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Largest accepted upload in bytes
    pub max_file_size: u64,
    /// Accepted media types; empty accepts everything
    pub allowed_types: Vec<String>,
    /// Uploads up to this many bytes stay in memory while being inspected
    pub spool_threshold: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            allowed_types: Vec::new(),
            spool_threshold: 8 * 1024 * 1024,
        }
    }
}

/// What one unit-of-work attempt achieved
enum Attempt {
    Linked { link_id: i64, created: bool },
    /// The content vanished between lookup and commit and no bytes are staged
    NeedsBytes,
}

struct Inspected<'a> {
    user_id: i64,
    display_name: &'a str,
    hash: &'a ContentHash,
    size: u64,
    mime_type: &'a str,
}

#[derive(Clone)]
pub struct UploadPipeline {
    metadata: Arc<MetadataStore>,
    content: ContentStore,
    ledger: OwnershipLedger,
    quota: QuotaAccountant,
    settings: UploadSettings,
}

impl UploadPipeline {
    pub fn new(
        metadata: Arc<MetadataStore>,
        content: ContentStore,
        ledger: OwnershipLedger,
        quota: QuotaAccountant,
        settings: UploadSettings,
    ) -> Self {
        Self {
            metadata,
            content,
            ledger,
            quota,
            settings,
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Ingest `source` as `filename` for the context's user. `declared_size`,
    /// when known, is checked before a single byte is read.
    pub fn run(
        &self,
        ctx: &RequestContext,
        source: &mut dyn Read,
        filename: &str,
        declared_size: Option<u64>,
    ) -> VaultResult<LinkRow> {
        let user_id = ctx.require_user()?;
        let name = display_name(filename)?;

        let read_limit = match declared_size {
            Some(size) if size > self.settings.max_file_size => {
                return Err(VaultError::Validation(format!(
                    "declared size {} exceeds the maximum of {} bytes",
                    size, self.settings.max_file_size
                )));
            }
            Some(size) => {
                self.quota.check_quota(ctx, user_id, size)?;
                size
            }
            None => {
                self.quota.check_quota(ctx, user_id, 0)?;
                self.settings.max_file_size
            }
        };

        let mut upload = inspect_stream(ctx, source, read_limit, self.settings.spool_threshold)?;
        if let Some(size) = declared_size {
            if size != upload.size {
                return Err(VaultError::Validation(format!(
                    "declared size {} does not match the {} bytes received",
                    size, upload.size
                )));
            }
        } else {
            self.quota.check_quota(ctx, user_id, upload.size)?;
        }

        let mime_type = sniff::resolve_type(&name, &upload.head, &self.settings.allowed_types)?;

        if self.ledger.user_has_hash(ctx, user_id, &upload.hash)? {
            return Err(VaultError::Conflict(format!(
                "user {} already stores this content",
                user_id
            )));
        }

        let mut staged: Option<StorageLocator> = None;
        for attempt in 1..=MAX_LINK_ATTEMPTS {
            if staged.is_none() && self.content.find_by_hash(ctx, &upload.hash)?.is_none() {
                staged = Some(self.content.stage(ctx, upload.reader())?);
            }

            let inspected = Inspected {
                user_id,
                display_name: &name,
                hash: &upload.hash,
                size: upload.size,
                mime_type: &mime_type,
            };
            let result = self
                .metadata
                .unit_of_work(ctx, |uow| self.link_content(uow, &inspected, staged.as_ref()));

            match result {
                Ok(Attempt::Linked { link_id, created }) => {
                    if !created {
                        if let Some(locator) = staged.take() {
                            debug!("Content {} was registered concurrently, dropping staged copy", upload.hash);
                            self.content.discard(&locator);
                        }
                    }
                    info!(
                        "User {} uploaded {:?} ({} bytes, {}, {})",
                        user_id,
                        name,
                        upload.size,
                        mime_type,
                        if created { "new content" } else { "deduplicated" }
                    );
                    return self.ledger.get_user_row(ctx, user_id, link_id);
                }
                Ok(Attempt::NeedsBytes) => {
                    warn!(
                        "Content {} disappeared before it could be linked (attempt {})",
                        upload.hash, attempt
                    );
                }
                Err(e) => {
                    if let Some(locator) = staged.take() {
                        self.content.discard(&locator);
                    }
                    return Err(e);
                }
            }
        }

        if let Some(locator) = staged.take() {
            self.content.discard(&locator);
        }
        Err(VaultError::Conflict(format!(
            "content {} kept changing during upload",
            upload.hash
        )))
    }

    fn link_content(
        &self,
        uow: &UnitOfWork<'_>,
        upload: &Inspected<'_>,
        staged: Option<&StorageLocator>,
    ) -> VaultResult<Attempt> {
        let registration = match content_repo::find_by_hash(uow, upload.hash)? {
            Some(object) => Registration::Existing(object),
            None => match staged {
                Some(locator) => {
                    self.content
                        .register(uow, upload.hash, upload.size, upload.mime_type, locator)?
                }
                None => return Ok(Attempt::NeedsBytes),
            },
        };

        let object = registration.object();
        let created = registration.is_created();
        let link = self
            .ledger
            .create(uow, upload.user_id, object.id, upload.display_name, created)?;
        self.content.increment_ref(uow, object.id)?;

        let size = object.size_bytes as i64;
        let actual = if created { size } else { 0 };
        self.quota.apply_delta(uow, upload.user_id, actual, size)?;

        Ok(Attempt::Linked {
            link_id: link.id,
            created,
        })
    }
}

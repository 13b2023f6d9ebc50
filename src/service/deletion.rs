//! Deletion/GC Pipeline
//!
//! Removing a link releases one reference on its content. The link removal,
//! the decrement, the quota refund and (at zero references) the content row
//! removal commit together; the blob is removed only after that commit.

use std::sync::Arc;

use log::{error, info};
use serde::Serialize;

use crate::error::{VaultError, VaultResult};
use crate::metadata::{content_repo, MetadataStore};
use crate::service::content_store::ContentStore;
use crate::service::ledger::OwnershipLedger;
use crate::service::quota::QuotaAccountant;
use crate::service::user_context::RequestContext;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteOutcome {
    pub link_id: i64,
    pub content_id: i64,
    pub remaining_references: u64,
    /// The content object and its bytes were released
    pub purged: bool,
    /// Set when the metadata was purged but removing the bytes failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_removal_error: Option<String>,
}

#[derive(Clone)]
pub struct DeletionPipeline {
    metadata: Arc<MetadataStore>,
    content: ContentStore,
    ledger: OwnershipLedger,
    quota: QuotaAccountant,
}

impl DeletionPipeline {
    pub fn new(
        metadata: Arc<MetadataStore>,
        content: ContentStore,
        ledger: OwnershipLedger,
        quota: QuotaAccountant,
    ) -> Self {
        Self {
            metadata,
            content,
            ledger,
            quota,
        }
    }

    pub fn run(&self, ctx: &RequestContext, link_id: i64) -> VaultResult<DeleteOutcome> {
        let user_id = ctx.require_user()?;

        let (link, object, remaining) = self.metadata.unit_of_work(ctx, |uow| {
            let link = self.ledger.get_user_link(uow, user_id, link_id)?;
            let object = content_repo::get(uow, link.content_id)?;

            self.ledger.delete(uow, user_id, object.id)?;
            let remaining = self.content.decrement_ref(uow, object.id)?;
            let counted = self.ledger.count_references(uow, object.id)?;
            if counted != remaining {
                error!(
                    "Reference count mismatch on content {}: counter says {}, {} links exist",
                    object.id, remaining, counted
                );
                return Err(VaultError::InvariantViolation(format!(
                    "content {} has {} links but a reference count of {}",
                    object.id, counted, remaining
                )));
            }

            let size = object.size_bytes as i64;
            let actual = if link.is_owner { -size } else { 0 };
            self.quota.apply_delta(uow, user_id, actual, -size)?;

            if remaining == 0 {
                self.content.purge_metadata(uow, &object)?;
            }
            Ok((link, object, remaining))
        })?;

        let mut outcome = DeleteOutcome {
            link_id: link.id,
            content_id: object.id,
            remaining_references: remaining,
            purged: remaining == 0,
            blob_removal_error: None,
        };

        if remaining == 0 {
            match self.content.remove_blob(&object.storage_locator) {
                Ok(()) => info!(
                    "Purged content {} ({} bytes) after its last link was deleted",
                    object.id, object.size_bytes
                ),
                Err(e) => {
                    error!(
                        "Content {} was purged but blob {} could not be removed: {}",
                        object.id, object.storage_locator, e
                    );
                    outcome.blob_removal_error = Some(e.to_string());
                }
            }
        } else {
            info!(
                "User {} deleted link {}; content {} still has {} references",
                user_id, link.id, object.id, remaining
            );
        }
        Ok(outcome)
    }
}

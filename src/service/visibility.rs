//! Visibility Manager
//!
//! A link starts private. Publishing it issues a random 128-bit token that
//! anyone can use to download the content; unpublishing clears the token, so
//! a revoked token never resolves again.

use std::sync::Arc;

use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{VaultError, VaultResult};
use crate::metadata::{LinkRow, MetadataStore, OwnershipLink, Visibility};
use crate::service::ledger::OwnershipLedger;
use crate::service::user_context::RequestContext;

/// Produces candidate public tokens
pub type TokenSource = Arc<dyn Fn() -> String + Send + Sync>;

/// 16 bytes from the OS CSPRNG, hex encoded
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_well_formed(token: &str) -> bool {
    token.len() == 32 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Clone)]
pub struct VisibilityManager {
    metadata: Arc<MetadataStore>,
    ledger: OwnershipLedger,
    max_attempts: u32,
    tokens: TokenSource,
}

impl VisibilityManager {
    pub fn new(metadata: Arc<MetadataStore>, ledger: OwnershipLedger, max_attempts: u32) -> Self {
        Self {
            metadata,
            ledger,
            max_attempts: max_attempts.max(1),
            tokens: Arc::new(generate_token),
        }
    }

    /// Replace the token generator
    pub fn with_token_source(mut self, tokens: TokenSource) -> Self {
        self.tokens = tokens;
        self
    }

    /// Publish or unpublish a link. Only the user who introduced the content
    /// may do so. Publishing an already public link keeps its token.
    pub fn set_visibility(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        link_id: i64,
        make_public: bool,
    ) -> VaultResult<OwnershipLink> {
        self.metadata.unit_of_work(ctx, |uow| {
            let link = self.ledger.get_owned_link(uow, user_id, link_id)?;

            if !make_public {
                if link.visibility == Visibility::Private {
                    return Ok(link);
                }
                let link = self.ledger.set_visibility(uow, link_id, Visibility::Private, None)?;
                info!("Link {} of user {} is now private", link_id, user_id);
                return Ok(link);
            }

            if link.visibility == Visibility::Public {
                return Ok(link);
            }
            for attempt in 1..=self.max_attempts {
                let token = (self.tokens)();
                match self.ledger.set_visibility(uow, link_id, Visibility::Public, Some(&token)) {
                    Ok(link) => {
                        info!("Link {} of user {} is now public", link_id, user_id);
                        return Ok(link);
                    }
                    Err(e) if e.is_unique_violation() => {
                        warn!("Public token collision on attempt {} for link {}", attempt, link_id);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(VaultError::Conflict(format!(
                "could not issue a unique public token for link {} after {} attempts",
                link_id, self.max_attempts
            )))
        })
    }

    /// Resolve a public token to its link. Counting the download is best
    /// effort and never prevents serving the content.
    pub fn resolve_public(&self, ctx: &RequestContext, token: &str) -> VaultResult<LinkRow> {
        if !is_well_formed(token) {
            return Err(VaultError::InvalidOrPrivate);
        }
        let row = self
            .ledger
            .find_public(ctx, token)?
            .ok_or(VaultError::InvalidOrPrivate)?;

        if let Err(e) = self.ledger.increment_download_count(ctx, row.link.id) {
            warn!("Failed to count public download of link {}: {}", row.link.id, e);
        }
        Ok(row)
    }
}

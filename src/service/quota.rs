//! Quota Accountant
//!
//! Each account carries two counters. `expected` is the logical total of
//! every link the user holds; `actual` is the physical bytes of content the
//! user introduced. The difference is what deduplication saved them.

use std::sync::Arc;

use log::{debug, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::metadata::{user_repo, MetadataStore, UnitOfWork, UserAccount};
use crate::service::user_context::RequestContext;

/// Which counter is compared against the limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaBasis {
    #[default]
    Actual,
    Expected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStats {
    pub user_id: i64,
    pub expected_bytes: u64,
    pub actual_bytes: u64,
    pub savings_bytes: u64,
    /// Savings as a percentage of expected bytes
    pub savings_percent: f64,
    pub limit_bytes: Option<u64>,
}

impl QuotaStats {
    fn from_account(account: &UserAccount, limit_bytes: Option<u64>) -> Self {
        let savings = account
            .expected_storage_bytes
            .saturating_sub(account.actual_storage_bytes);
        let percent = if account.expected_storage_bytes == 0 {
            0.0
        } else {
            savings as f64 * 100.0 / account.expected_storage_bytes as f64
        };
        Self {
            user_id: account.id,
            expected_bytes: account.expected_storage_bytes,
            actual_bytes: account.actual_storage_bytes,
            savings_bytes: savings,
            savings_percent: percent,
            limit_bytes,
        }
    }
}

#[derive(Clone)]
pub struct QuotaAccountant {
    metadata: Arc<MetadataStore>,
    limit: Option<u64>,
    basis: QuotaBasis,
}

impl QuotaAccountant {
    /// `limit` of `None` disables enforcement
    pub fn new(metadata: Arc<MetadataStore>, limit: Option<u64>, basis: QuotaBasis) -> Self {
        Self { metadata, limit, basis }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    fn used(&self, account: &UserAccount) -> u64 {
        match self.basis {
            QuotaBasis::Actual => account.actual_storage_bytes,
            QuotaBasis::Expected => account.expected_storage_bytes,
        }
    }

    fn check_account(&self, account: &UserAccount, incoming: u64) -> VaultResult<()> {
        let limit = match self.limit {
            Some(limit) => limit,
            None => return Ok(()),
        };
        let used = self.used(account);
        if used.saturating_add(incoming) > limit {
            warn!(
                "Quota exceeded for user {}: {} used, {} requested, limit {}",
                account.id, used, incoming, limit
            );
            return Err(VaultError::QuotaExceeded {
                user_id: account.id,
                requested: incoming,
                available: limit.saturating_sub(used),
            });
        }
        Ok(())
    }

    /// Fail fast before any bytes are written
    pub fn check_quota(&self, ctx: &RequestContext, user_id: i64, incoming: u64) -> VaultResult<()> {
        let account = self.metadata.read(ctx, |conn| user_repo::get(conn, user_id))?;
        self.check_account(&account, incoming)
    }

    /// Same check against a connection already inside a unit of work
    pub fn check_quota_in(&self, conn: &Connection, user_id: i64, incoming: u64) -> VaultResult<()> {
        let account = user_repo::get(conn, user_id)?;
        self.check_account(&account, incoming)
    }

    /// Apply signed deltas to both counters. Growth of the limited counter is
    /// re-checked here, inside the transaction, so concurrent uploads cannot
    /// overshoot the limit between the early check and the commit.
    pub fn apply_delta(
        &self,
        uow: &UnitOfWork<'_>,
        user_id: i64,
        actual_delta: i64,
        expected_delta: i64,
    ) -> VaultResult<UserAccount> {
        let growth = match self.basis {
            QuotaBasis::Actual => actual_delta,
            QuotaBasis::Expected => expected_delta,
        };
        if growth > 0 {
            self.check_quota_in(uow, user_id, growth as u64)?;
        }
        let account = user_repo::apply_delta(uow, user_id, actual_delta, expected_delta)?;
        debug!(
            "Quota for user {} now actual={} expected={}",
            user_id, account.actual_storage_bytes, account.expected_storage_bytes
        );
        Ok(account)
    }

    pub fn stats(&self, ctx: &RequestContext, user_id: i64) -> VaultResult<QuotaStats> {
        let account = self.metadata.read(ctx, |conn| user_repo::get(conn, user_id))?;
        Ok(QuotaStats::from_account(&account, self.limit))
    }
}

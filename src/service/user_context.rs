//! Per-request context carried through the pipelines

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{VaultError, VaultResult};

/// Caller identity plus the deadline every storage and persistence call honors.
/// This struct makes it easy to add new fields without changing function signatures
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Authenticated user, `None` for public token downloads
    pub user_id: Option<i64>,
    /// Point in time after which the operation must give up
    pub deadline: Option<Instant>,
    /// Free-form request attributes (request id, client address, ...)
    pub metadata: HashMap<String, String>,
}

impl RequestContext {
    /// Context for an authenticated user with no deadline
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            deadline: None,
            metadata: HashMap::new(),
        }
    }

    /// Context for an unauthenticated caller
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            deadline: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The authenticated user, or NotFound for anonymous contexts
    pub fn require_user(&self) -> VaultResult<i64> {
        self.user_id
            .ok_or_else(|| VaultError::NotFound("no authenticated user".to_string()))
    }

    /// Time left before the deadline; `None` means unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check_deadline(&self) -> VaultResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(VaultError::Timeout),
            _ => Ok(()),
        }
    }

    pub fn set_metadata(&mut self, key: String, value: String) {
        self.metadata.insert(key, value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&String> {
        self.metadata.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_deadline_is_timeout() {
        let ctx = RequestContext::for_user(7).with_deadline(Instant::now());
        assert!(matches!(ctx.check_deadline(), Err(VaultError::Timeout)));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_unbounded_context() {
        let ctx = RequestContext::for_user(7);
        assert!(ctx.check_deadline().is_ok());
        assert!(ctx.remaining().is_none());
        assert_eq!(ctx.require_user().unwrap(), 7);
    }

    #[test]
    fn test_anonymous_has_no_user() {
        let mut ctx = RequestContext::anonymous().with_timeout(Duration::from_secs(30));
        assert!(ctx.require_user().is_err());
        assert!(ctx.check_deadline().is_ok());

        ctx.set_metadata("request_id".to_string(), "abc".to_string());
        assert_eq!(ctx.get_metadata("request_id"), Some(&"abc".to_string()));
    }
}

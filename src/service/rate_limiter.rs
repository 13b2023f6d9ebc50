//! Per-user token bucket
//!
//! Each key owns a bucket holding at most `limit` tokens. Buckets refill
//! lazily at `limit` tokens per second whenever they are touched, and every
//! admitted request spends one token. A bucket idle for a full second has
//! refilled completely and is dropped, since a fresh bucket behaves the same.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Time after which any bucket is back at capacity
const REFILL_WINDOW: Duration = Duration::from_secs(1);

struct Buckets {
    by_key: HashMap<i64, Bucket>,
    last_prune: Instant,
}

impl Buckets {
    fn prune(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_prune) < REFILL_WINDOW {
            return;
        }
        let before = self.by_key.len();
        self.by_key
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < REFILL_WINDOW);
        self.last_prune = now;
        if self.by_key.len() < before {
            debug!("Dropped {} refilled rate limit buckets", before - self.by_key.len());
        }
    }
}

pub struct RateLimiter {
    limit: u32,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    /// `limit` requests per second with bursts of up to `limit`
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            buckets: Mutex::new(Buckets {
                by_key: HashMap::new(),
                last_prune: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Number of keys currently holding a partially drained bucket
    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().unwrap().by_key.len()
    }

    pub fn try_acquire(&self, key: i64) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    /// Same as `try_acquire` with an explicit clock reading
    pub fn try_acquire_at(&self, key: i64, now: Instant) -> bool {
        let capacity = f64::from(self.limit);
        let mut buckets = self.buckets.lock().unwrap();
        buckets.prune(now);
        let bucket = buckets.by_key.entry(key).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            debug!("Rate limit reached for key {} ({:.2} tokens left)", key, bucket.tokens);
            false
        }
    }

    /// Admit a request for `key` or fail with RateLimited
    pub fn check(&self, key: i64) -> VaultResult<()> {
        if self.try_acquire(key) {
            Ok(())
        } else {
            warn!("Rejecting request from user {}: rate limit of {}/s exceeded", key, self.limit);
            Err(VaultError::RateLimited)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_beyond_limit_is_rejected() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        let rejected = (0..6)
            .filter(|i| !limiter.try_acquire_at(1, start + Duration::from_millis(*i)))
            .count();
        assert_eq!(rejected, 1);
    }

    #[test]
    fn test_idle_refill_is_capped_at_limit() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.try_acquire_at(1, start));
        }
        assert!(!limiter.try_acquire_at(1, start));

        let later = start + Duration::from_secs(3600);
        let admitted = (0..10).filter(|_| limiter.try_acquire_at(1, later)).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_fractional_refill() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(7, start));
        assert!(limiter.try_acquire_at(7, start));
        assert!(!limiter.try_acquire_at(7, start + Duration::from_millis(250)));
        assert!(limiter.try_acquire_at(7, start + Duration::from_millis(500)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert!(limiter.try_acquire_at(1, now));
        assert!(!limiter.try_acquire_at(1, now));
        assert!(limiter.try_acquire_at(2, now));
        assert!(matches!(limiter.check(1), Err(VaultError::RateLimited)));
    }

    #[test]
    fn test_refilled_buckets_are_dropped() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        for key in 0..100 {
            assert!(limiter.try_acquire_at(key, start));
        }
        assert_eq!(limiter.tracked_keys(), 100);

        let later = start + Duration::from_secs(2);
        assert!(limiter.try_acquire_at(1, later));
        assert!(limiter.try_acquire_at(1, later));
        assert!(!limiter.try_acquire_at(1, later));
        assert_eq!(limiter.tracked_keys(), 1);
    }
}

//! Builds limiters for a configured policy.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::fixed_window::FixedWindowLimiter;
use super::limiter::{Limiter, NoLimiter};
use super::policy::{parse_interval, Rate, RateLimitPolicy};
use super::sliding_window::SlidingWindowLimiter;
use super::storage::Storage;
use super::token_bucket::TokenBucketLimiter;
use crate::error::{Result, ThrottleError};
use crate::lock::{LockFactory, DEFAULT_LOCK_TTL};

/// Creates one limiter per key, all sharing a policy.
#[derive(Clone)]
pub struct RateLimiterFactory {
    id: String,
    policy: RateLimitPolicy,
    limit: u32,
    interval: Duration,
    rate: Rate,
    storage: Arc<dyn Storage>,
    lock_factory: Option<LockFactory>,
}

impl RateLimiterFactory {
    /// Create a factory.
    ///
    /// `interval` is parsed with [`parse_interval`]; a zero `limit` is only
    /// allowed for the `no_limit` policy.
    pub fn new(
        id: impl Into<String>,
        policy: RateLimitPolicy,
        limit: u32,
        interval: &str,
        storage: Arc<dyn Storage>,
        lock_factory: Option<LockFactory>,
    ) -> Result<Self> {
        let id = id.into();
        if policy != RateLimitPolicy::NoLimit && limit == 0 {
            return Err(ThrottleError::InvalidArgument(format!(
                "limiter {:?} needs a positive limit",
                id
            )));
        }

        let interval = parse_interval(interval)?;
        // A zero `no_limit` limit never reaches a bucket.
        let rate = Rate::new(interval, limit.max(1))?;

        Ok(Self {
            id,
            policy,
            limit,
            interval,
            rate,
            storage,
            lock_factory,
        })
    }

    /// Refill token buckets at `rate` instead of `limit` per interval.
    pub fn with_rate(mut self, rate: Rate) -> Self {
        self.rate = rate;
        self
    }

    /// Factory id, the prefix of every limiter id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Create the limiter for `key`.
    pub fn create(&self, key: &str) -> Box<dyn Limiter> {
        let id = format!("{}-{}", self.id, key);
        let lock = self
            .lock_factory
            .as_ref()
            .map(|factory| factory.create_lock(&id, Some(DEFAULT_LOCK_TTL), true));

        debug!(id = %id, policy = %self.policy, locked = lock.is_some(), "Creating limiter");

        let storage = Arc::clone(&self.storage);
        match self.policy {
            RateLimitPolicy::FixedWindow => Box::new(FixedWindowLimiter::new(
                id,
                self.limit,
                self.interval,
                storage,
                lock,
            )),
            RateLimitPolicy::SlidingWindow => Box::new(SlidingWindowLimiter::new(
                id,
                self.limit,
                self.interval,
                storage,
                lock,
            )),
            RateLimitPolicy::TokenBucket => Box::new(TokenBucketLimiter::new(
                id,
                self.limit,
                self.rate,
                storage,
                lock,
            )),
            RateLimitPolicy::NoLimit => Box::new(NoLimiter),
        }
    }
}

impl std::fmt::Debug for RateLimiterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterFactory")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("limit", &self.limit)
            .field("interval", &self.interval)
            .field("rate", &self.rate)
            .field("locked", &self.lock_factory.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::lock::DbLockStore;
    use crate::ratelimit::DbStorage;

    async fn parts() -> (Arc<dyn Storage>, LockFactory) {
        let db = Database::connect_url("sqlite::memory:").await.unwrap();
        db.ensure_schema().await.unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let storage = Arc::new(DbStorage::new(db.clone()).with_clock(clock.clone()));
        let store = DbLockStore::new(db, 0.0, 300).unwrap().with_clock(clock);
        (storage, LockFactory::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_keys_are_limited_independently() {
        let (storage, locks) = parts().await;
        let factory = RateLimiterFactory::new(
            "api",
            RateLimitPolicy::FixedWindow,
            1,
            "1 minute",
            storage,
            Some(locks),
        )
        .unwrap();

        let mut alice = factory.create("alice");
        let mut bob = factory.create("bob");

        assert!(alice.consume(1).await.unwrap().accepted);
        assert!(!alice.consume(1).await.unwrap().accepted);
        assert!(bob.consume(1).await.unwrap().accepted);

        // A second limiter for the same key shares the stored state.
        assert!(!factory.create("alice").consume(1).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn test_no_limit_policy() {
        let (storage, _locks) = parts().await;
        let factory =
            RateLimiterFactory::new("open", RateLimitPolicy::NoLimit, 0, "1 second", storage, None)
                .unwrap();

        let mut limiter = factory.create("anyone");
        for _ in 0..20 {
            assert!(limiter.consume(5).await.unwrap().accepted);
        }
    }

    #[tokio::test]
    async fn test_invalid_settings() {
        let (storage, _locks) = parts().await;
        assert!(RateLimiterFactory::new(
            "api",
            RateLimitPolicy::TokenBucket,
            0,
            "1 minute",
            storage.clone(),
            None
        )
        .is_err());
        assert!(RateLimiterFactory::new(
            "api",
            RateLimitPolicy::TokenBucket,
            5,
            "whenever",
            storage,
            None
        )
        .is_err());
    }
}

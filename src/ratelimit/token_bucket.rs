//! Token bucket rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::limiter::{secs, Limiter, LimiterCore, RateLimit};
use super::policy::Rate;
use super::storage::Storage;
use crate::error::Result;
use crate::lock::Lock;

const CLASS: &str = "TokenBucket";

/// Persisted bucket state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bucket {
    /// Tokens left at `timer`
    tokens: f64,
    /// Last time the bucket was updated, in epoch seconds
    timer: f64,
}

/// A bucket of `limit` tokens refilled at a steady rate.
///
/// The bucket starts full, so up to `limit` tokens can be consumed in a
/// burst.
pub struct TokenBucketLimiter {
    core: LimiterCore,
    rate: Rate,
}

impl TokenBucketLimiter {
    /// Create a new token bucket limiter.
    pub fn new(
        id: impl Into<String>,
        limit: u32,
        rate: Rate,
        storage: Arc<dyn Storage>,
        lock: Option<Lock>,
    ) -> Self {
        Self {
            core: LimiterCore::new(id.into(), limit, storage, lock),
            rate,
        }
    }

    async fn consume_unlocked(&mut self, tokens: u32) -> Result<RateLimit> {
        let now = self.core.now();
        let burst = self.core.limit as f64;

        let mut bucket = self.core.load::<Bucket>(CLASS).await?.unwrap_or(Bucket {
            tokens: burst,
            timer: now,
        });

        let elapsed = (now - bucket.timer).max(0.0);
        let available = (bucket.tokens + elapsed * self.rate.tokens_per_second()).min(burst);
        let requested = tokens as f64;

        let limit = if available >= requested {
            bucket.tokens = available - requested;
            RateLimit {
                available_tokens: bucket.tokens.floor() as u32,
                retry_after: std::time::Duration::ZERO,
                accepted: true,
                limit: self.core.limit,
            }
        } else {
            bucket.tokens = available;
            let wait = self.rate.time_for(requested - available);
            debug!(id = %self.core.id, tokens = tokens, available = available, wait = wait, "Rate limit exceeded");
            RateLimit {
                available_tokens: available.floor() as u32,
                retry_after: secs(wait),
                accepted: false,
                limit: self.core.limit,
            }
        };
        bucket.timer = now;

        trace!(id = %self.core.id, tokens = bucket.tokens, "Token bucket updated");
        // The state is only worth keeping until the bucket would be full again.
        let expiry = secs(self.rate.time_for(burst - bucket.tokens).max(1.0));
        self.core.store(CLASS, &bucket, expiry).await?;
        Ok(limit)
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    async fn consume(&mut self, tokens: u32) -> Result<RateLimit> {
        self.core.check_tokens(tokens)?;
        self.core.lock().await?;
        let result = self.consume_unlocked(tokens).await;
        self.core.unlock().await;
        result
    }

    async fn reset(&mut self) -> Result<()> {
        self.core.reset().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::ratelimit::DbStorage;

    async fn limiter(limit: u32, rate: Rate) -> (TokenBucketLimiter, Arc<ManualClock>) {
        let db = Database::connect_url("sqlite::memory:").await.unwrap();
        db.ensure_schema().await.unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let storage = Arc::new(DbStorage::new(db).with_clock(clock.clone()));
        (
            TokenBucketLimiter::new("api-user:1", limit, rate, storage, None),
            clock,
        )
    }

    #[tokio::test]
    async fn test_burst_then_reject() {
        let (mut limiter, _clock) = limiter(10, Rate::per_second(1).unwrap()).await;

        let limit = limiter.consume(10).await.unwrap();
        assert!(limit.accepted);
        assert_eq!(limit.available_tokens, 0);

        let limit = limiter.consume(2).await.unwrap();
        assert!(!limit.accepted);
        assert_eq!(limit.retry_after, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_refills_over_time() {
        let (mut limiter, clock) = limiter(10, Rate::per_second(2).unwrap()).await;

        assert!(limiter.consume(10).await.unwrap().accepted);
        clock.advance(Duration::from_secs(2));

        let limit = limiter.consume(3).await.unwrap();
        assert!(limit.accepted);
        assert_eq!(limit.available_tokens, 1);

        assert!(!limiter.consume(2).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn test_refill_caps_at_limit() {
        let (mut limiter, clock) = limiter(5, Rate::per_second(1).unwrap()).await;

        assert!(limiter.consume(1).await.unwrap().accepted);
        clock.advance(Duration::from_secs(3_600));

        let limit = limiter.consume(1).await.unwrap();
        assert!(limit.accepted);
        assert_eq!(limit.available_tokens, 4);
    }

    #[tokio::test]
    async fn test_extremely_slow_refill_saturates_wait() {
        let rate = Rate::new(Duration::from_secs(u64::MAX), 1).unwrap();
        let (mut limiter, _clock) = limiter(5, rate).await;

        assert!(limiter.consume(5).await.unwrap().accepted);
        let limit = limiter.consume(1).await.unwrap();
        assert!(!limit.accepted);
        assert!(limit.retry_after > Duration::from_secs(u64::MAX / 2));
    }
}

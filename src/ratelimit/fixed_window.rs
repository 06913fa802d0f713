//! Fixed window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::limiter::{secs, Limiter, LimiterCore, RateLimit};
use super::storage::Storage;
use crate::error::Result;
use crate::lock::Lock;

const CLASS: &str = "FixedWindow";

/// Persisted window state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Window {
    hit_count: u32,
    /// When the window started, in epoch seconds
    timer: f64,
}

/// Allows `limit` tokens per `interval`, counting from the first hit.
pub struct FixedWindowLimiter {
    core: LimiterCore,
    interval: Duration,
}

impl FixedWindowLimiter {
    /// Create a new fixed window limiter.
    pub fn new(
        id: impl Into<String>,
        limit: u32,
        interval: Duration,
        storage: Arc<dyn Storage>,
        lock: Option<Lock>,
    ) -> Self {
        Self {
            core: LimiterCore::new(id.into(), limit, storage, lock),
            interval,
        }
    }

    async fn consume_unlocked(&mut self, tokens: u32) -> Result<RateLimit> {
        let now = self.core.now();
        let interval = self.interval.as_secs_f64();

        let mut window = match self.core.load::<Window>(CLASS).await? {
            Some(window) if now - window.timer < interval => window,
            _ => Window {
                hit_count: 0,
                timer: now,
            },
        };

        let available = self.core.limit.saturating_sub(window.hit_count);
        let window_end = window.timer + interval;

        let limit = if available >= tokens {
            window.hit_count += tokens;
            let remaining = available - tokens;
            RateLimit {
                available_tokens: remaining,
                retry_after: if remaining > 0 {
                    Duration::ZERO
                } else {
                    secs(window_end - now)
                },
                accepted: true,
                limit: self.core.limit,
            }
        } else {
            debug!(id = %self.core.id, tokens = tokens, available = available, "Rate limit exceeded");
            RateLimit {
                available_tokens: available,
                retry_after: secs(window_end - now),
                accepted: false,
                limit: self.core.limit,
            }
        };

        trace!(id = %self.core.id, hits = window.hit_count, "Fixed window updated");
        self.core.store(CLASS, &window, self.interval).await?;
        Ok(limit)
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
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
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::ratelimit::DbStorage;

    async fn limiter(limit: u32, interval: Duration) -> (FixedWindowLimiter, Arc<ManualClock>) {
        let db = Database::connect_url("sqlite::memory:").await.unwrap();
        db.ensure_schema().await.unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let storage = Arc::new(DbStorage::new(db).with_clock(clock.clone()));
        (
            FixedWindowLimiter::new("api-user:1", limit, interval, storage, None),
            clock,
        )
    }

    #[tokio::test]
    async fn test_accepts_up_to_limit() {
        let (mut limiter, _clock) = limiter(5, Duration::from_secs(60)).await;

        for remaining in (0..5).rev() {
            let limit = limiter.consume(1).await.unwrap();
            assert!(limit.accepted);
            assert_eq!(limit.available_tokens, remaining);
        }

        let limit = limiter.consume(1).await.unwrap();
        assert!(!limit.accepted);
        assert_eq!(limit.available_tokens, 0);
        assert_eq!(limit.retry_after, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_window_resets_after_interval() {
        let (mut limiter, clock) = limiter(2, Duration::from_secs(10)).await;

        assert!(limiter.consume(2).await.unwrap().accepted);
        clock.advance(Duration::from_secs(4));
        let limit = limiter.consume(1).await.unwrap();
        assert!(!limit.accepted);
        assert_eq!(limit.retry_after, Duration::from_secs(6));

        clock.advance(Duration::from_secs(6));
        assert!(limiter.consume(1).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn test_rejects_more_tokens_than_limit() {
        let (mut limiter, _clock) = limiter(2, Duration::from_secs(10)).await;
        assert!(limiter.consume(3).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let (mut limiter, _clock) = limiter(1, Duration::from_secs(10)).await;

        assert!(limiter.consume(1).await.unwrap().accepted);
        assert!(!limiter.consume(1).await.unwrap().accepted);

        limiter.reset().await.unwrap();
        assert!(limiter.consume(1).await.unwrap().accepted);
    }
}

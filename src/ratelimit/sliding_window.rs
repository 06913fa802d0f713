//! Sliding window rate limiter.
//!
//! Hits of the previous window count towards the current one, weighted by
//! how much of the previous window still overlaps a window ending now.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::limiter::{secs, Limiter, LimiterCore, RateLimit};
use super::storage::Storage;
use crate::error::Result;
use crate::lock::Lock;

const CLASS: &str = "SlidingWindow";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Window {
    hit_count: u32,
    hit_count_for_last_window: u32,
    /// End of the current window, in epoch seconds
    window_end: f64,
}

impl Window {
    fn fresh(now: f64, interval: f64) -> Self {
        Self {
            hit_count: 0,
            hit_count_for_last_window: 0,
            window_end: now + interval,
        }
    }

    /// Roll over into the window following this one.
    fn next(&self, now: f64, interval: f64) -> Self {
        if now >= self.window_end + interval {
            return Self::fresh(now, interval);
        }
        Self {
            hit_count: 0,
            hit_count_for_last_window: self.hit_count,
            window_end: self.window_end + interval,
        }
    }

    fn elapsed_fraction(&self, now: f64, interval: f64) -> f64 {
        let start = self.window_end - interval;
        ((now - start) / interval).clamp(0.0, 1.0)
    }

    fn weighted_hits(&self, now: f64, interval: f64) -> u32 {
        let carried =
            self.hit_count_for_last_window as f64 * (1.0 - self.elapsed_fraction(now, interval));
        (carried + self.hit_count as f64).floor() as u32
    }

    /// Seconds until `tokens` more hits fit under `limit`.
    fn time_for(&self, limit: u32, tokens: u32, now: f64, interval: f64) -> f64 {
        let start = self.window_end - interval;

        if self.hit_count + tokens <= limit {
            // Only the previous window's share is in the way.
            let allowed = (limit - self.hit_count - tokens) as f64;
            let last = self.hit_count_for_last_window as f64;
            let fraction = 1.0 - allowed / last;
            return start + fraction * interval - now;
        }

        // Wait for the next window, then for this window's hits to fade.
        let allowed = limit.saturating_sub(tokens) as f64;
        let fraction = 1.0 - allowed / self.hit_count as f64;
        self.window_end + fraction.max(0.0) * interval - now
    }
}

/// Allows `limit` tokens per sliding `interval`.
pub struct SlidingWindowLimiter {
    core: LimiterCore,
    interval: Duration,
}

impl SlidingWindowLimiter {
    /// Create a new sliding window limiter.
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
            Some(window) if now > window.window_end => window.next(now, interval),
            Some(window) => window,
            None => Window::fresh(now, interval),
        };

        let hits = window.weighted_hits(now, interval);
        let available = self.core.limit.saturating_sub(hits);

        let limit = if available >= tokens {
            window.hit_count += tokens;
            RateLimit {
                available_tokens: available - tokens,
                retry_after: Duration::ZERO,
                accepted: true,
                limit: self.core.limit,
            }
        } else {
            let wait = window.time_for(self.core.limit, tokens, now, interval);
            debug!(id = %self.core.id, tokens = tokens, available = available, wait = wait, "Rate limit exceeded");
            RateLimit {
                available_tokens: available,
                retry_after: secs(wait),
                accepted: false,
                limit: self.core.limit,
            }
        };

        trace!(id = %self.core.id, hits = window.hit_count, last = window.hit_count_for_last_window, "Sliding window updated");
        // Hits stay relevant until the window after this one has ended.
        let expiry = secs(window.window_end + interval - now);
        self.core.store(CLASS, &window, expiry).await?;
        Ok(limit)
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
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

    async fn limiter(limit: u32, interval: Duration) -> (SlidingWindowLimiter, Arc<ManualClock>) {
        let db = Database::connect_url("sqlite::memory:").await.unwrap();
        db.ensure_schema().await.unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let storage = Arc::new(DbStorage::new(db).with_clock(clock.clone()));
        (
            SlidingWindowLimiter::new("api-user:1", limit, interval, storage, None),
            clock,
        )
    }

    #[test]
    fn test_previous_window_weight() {
        let window = Window {
            hit_count: 2,
            hit_count_for_last_window: 10,
            window_end: 100.0,
        };
        // A quarter into the window, three quarters of the last one remain.
        assert_eq!(window.weighted_hits(92.5, 10.0), 9);
        assert_eq!(window.weighted_hits(100.0, 10.0), 2);
    }

    #[test]
    fn test_rollover_drops_stale_windows() {
        let window = Window {
            hit_count: 4,
            hit_count_for_last_window: 1,
            window_end: 100.0,
        };
        let next = window.next(105.0, 10.0);
        assert_eq!(next.hit_count, 0);
        assert_eq!(next.hit_count_for_last_window, 4);
        assert_eq!(next.window_end, 110.0);

        let fresh = window.next(130.0, 10.0);
        assert_eq!(fresh.hit_count_for_last_window, 0);
        assert_eq!(fresh.window_end, 140.0);
    }

    #[tokio::test]
    async fn test_limit_within_window() {
        let (mut limiter, _clock) = limiter(3, Duration::from_secs(10)).await;

        assert!(limiter.consume(3).await.unwrap().accepted);
        let limit = limiter.consume(1).await.unwrap();
        assert!(!limit.accepted);
        assert!(limit.retry_after > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_previous_hits_fade_out() {
        let (mut limiter, clock) = limiter(4, Duration::from_secs(10)).await;

        assert!(limiter.consume(4).await.unwrap().accepted);

        // Halfway into the next window, half of the last window's hits count.
        clock.advance(Duration::from_secs(15));
        let limit = limiter.consume(2).await.unwrap();
        assert!(limit.accepted);
        assert_eq!(limit.available_tokens, 0);
        assert!(!limiter.consume(1).await.unwrap().accepted);

        // After two full windows everything is forgotten.
        clock.advance(Duration::from_secs(30));
        let limit = limiter.consume(4).await.unwrap();
        assert!(limit.accepted);
    }
}

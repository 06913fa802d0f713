//! Limiter trait and the state plumbing shared by every algorithm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};

use super::storage::{LimiterState, Storage};
use crate::clock::Clock;
use crate::error::{Result, ThrottleError};
use crate::lock::Lock;

/// How long a limiter waits for its lock before giving up.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

/// Outcome of a consume call.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimit {
    /// Tokens still available after this call
    pub available_tokens: u32,
    /// How long to wait before the request could be accepted
    pub retry_after: Duration,
    /// Whether the tokens were consumed
    pub accepted: bool,
    /// Configured limit
    pub limit: u32,
}

/// Trait for rate limiter implementations.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Consume `tokens`, returning whether they were accepted.
    async fn consume(&mut self, tokens: u32) -> Result<RateLimit>;

    /// Forget all consumption for this limiter.
    async fn reset(&mut self) -> Result<()>;
}

/// A limiter that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLimiter;

#[async_trait]
impl Limiter for NoLimiter {
    async fn consume(&mut self, _tokens: u32) -> Result<RateLimit> {
        Ok(RateLimit {
            available_tokens: u32::MAX,
            retry_after: Duration::ZERO,
            accepted: true,
            limit: u32::MAX,
        })
    }

    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Storage, lock and clock of one limiter id.
pub(crate) struct LimiterCore {
    pub(crate) id: String,
    pub(crate) limit: u32,
    storage: Arc<dyn Storage>,
    lock: Option<Lock>,
    clock: Arc<dyn Clock>,
}

impl LimiterCore {
    pub(crate) fn new(
        id: String,
        limit: u32,
        storage: Arc<dyn Storage>,
        lock: Option<Lock>,
    ) -> Self {
        let clock = storage.clock();
        Self {
            id,
            limit,
            storage,
            lock,
            clock,
        }
    }

    pub(crate) fn now(&self) -> f64 {
        self.clock.now()
    }

    pub(crate) fn check_tokens(&self, tokens: u32) -> Result<()> {
        if tokens > self.limit {
            return Err(ThrottleError::InvalidArgument(format!(
                "cannot reserve more tokens ({}) than the limit ({})",
                tokens, self.limit
            )));
        }
        Ok(())
    }

    pub(crate) async fn lock(&mut self) -> Result<()> {
        if let Some(lock) = self.lock.as_mut() {
            lock.acquire_blocking(DEFAULT_LOCK_WAIT).await?;
        }
        Ok(())
    }

    pub(crate) async fn unlock(&mut self) {
        if let Some(lock) = self.lock.as_mut() {
            if let Err(e) = lock.release().await {
                warn!(id = %self.id, error = %e, "Failed to release limiter lock");
            }
        }
    }

    /// Load the stored state, ignoring states written by another algorithm.
    pub(crate) async fn load<T: DeserializeOwned>(&self, class: &str) -> Result<Option<T>> {
        let Some(stored) = self.storage.fetch(&self.id).await? else {
            return Ok(None);
        };

        if stored.class != class {
            trace!(id = %self.id, stored = %stored.class, expected = %class, "Ignoring foreign limiter state");
            return Ok(None);
        }

        serde_json::from_slice(&stored.body)
            .map(Some)
            .map_err(|e| ThrottleError::Deserialization(format!("{} state: {}", class, e)))
    }

    pub(crate) async fn store<T: Serialize + Sync>(
        &self,
        class: &str,
        state: &T,
        expires_in: Duration,
    ) -> Result<()> {
        let body = serde_json::to_vec(state).map_err(|e| {
            ThrottleError::InvalidArgument(format!("cannot encode {} state: {}", class, e))
        })?;
        let state = LimiterState::new(self.id.clone(), class, body).with_expiration(expires_in);
        self.storage.save(&state).await
    }

    pub(crate) async fn reset(&mut self) -> Result<()> {
        self.lock().await?;
        let result = self.storage.delete(&self.id).await;
        self.unlock().await;
        result
    }
}

/// Seconds to a `Duration`: negative and NaN become zero, values too large
/// to represent saturate.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

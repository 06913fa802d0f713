//! Lock handles bound to a key and a store.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::key::Key;
use super::store::PersistingStore;
use crate::clock::Clock;
use crate::error::{Result, ThrottleError};

/// A lock on one resource.
///
/// A handle that acquired its lock and was created with `auto_release`
/// releases it when dropped, provided a tokio runtime is still running.
pub struct Lock {
    key: Arc<Key>,
    store: Arc<dyn PersistingStore>,
    clock: Arc<dyn Clock>,
    ttl: Option<f64>,
    auto_release: bool,
    dirty: bool,
}

impl Lock {
    /// Create a lock handle. Nothing is written until [`acquire`](Self::acquire).
    pub fn new(
        key: Key,
        store: Arc<dyn PersistingStore>,
        ttl: Option<f64>,
        auto_release: bool,
    ) -> Self {
        let clock = store.clock();
        Self {
            key: Arc::new(key),
            store,
            clock,
            ttl,
            auto_release,
            dirty: false,
        }
    }

    /// The key this handle acquires with.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Try once to acquire the lock.
    ///
    /// Returns `Ok(false)` when someone else holds it.
    pub async fn acquire(&mut self) -> Result<bool> {
        self.key.reset_lifetime();

        match self.store.save(&self.key).await {
            Ok(()) => {}
            Err(ThrottleError::LockConflicted(_)) => {
                self.dirty = false;
                info!(resource = %self.key, "Failed to acquire lock, someone else holds it");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.dirty = true;
        debug!(resource = %self.key, "Acquired lock");

        if let Some(ttl) = self.ttl {
            match self.refresh(Some(ttl)).await {
                Ok(()) => {}
                Err(ThrottleError::LockConflicted(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        if self.key.is_expired(self.clock.now()) {
            self.release_quietly().await;
            return Err(ThrottleError::LockExpired(self.key.resource().to_string()));
        }

        Ok(true)
    }

    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// Fails with `LockConflicted` when the lock could not be acquired in
    /// time.
    pub async fn acquire_blocking(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.acquire().await? {
                return Ok(());
            }

            let pause = Duration::from_millis(rand::thread_rng().gen_range(90..=110));
            if Instant::now() + pause > deadline {
                return Err(ThrottleError::LockConflicted(self.key.resource().to_string()));
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Extend the lock by `ttl` seconds, or by the handle's TTL.
    pub async fn refresh(&mut self, ttl: Option<f64>) -> Result<()> {
        let ttl = ttl.or(self.ttl).ok_or_else(|| {
            ThrottleError::InvalidArgument("an expiration duration is required".to_string())
        })?;

        self.key.reset_lifetime();
        match self.store.put_off_expiration(&self.key, ttl).await {
            Ok(()) => {}
            Err(e) => {
                if e.is_conflict() {
                    self.dirty = false;
                }
                return Err(e);
            }
        }
        self.dirty = true;

        if self.key.is_expired(self.clock.now()) {
            self.release_quietly().await;
            return Err(ThrottleError::LockExpired(self.key.resource().to_string()));
        }

        debug!(resource = %self.key, ttl = ttl, "Expiration defined for lock");
        Ok(())
    }

    /// Whether this handle currently owns the lock.
    pub async fn is_acquired(&mut self) -> Result<bool> {
        self.dirty = self.store.exists(&self.key).await?;
        Ok(self.dirty)
    }

    /// Release the lock.
    ///
    /// Fails with `LockReleasing` if the row is still owned afterwards.
    pub async fn release(&mut self) -> Result<()> {
        self.store.delete(&self.key).await?;
        self.dirty = false;

        if self.store.exists(&self.key).await? {
            return Err(ThrottleError::LockReleasing(self.key.resource().to_string()));
        }

        debug!(resource = %self.key, "Released lock");
        Ok(())
    }

    /// Whether the key's own lifetime has run out.
    pub fn is_expired(&self) -> bool {
        self.key.is_expired(self.clock.now())
    }

    /// Seconds left before the lock must be refreshed.
    pub fn remaining_lifetime(&self) -> Option<f64> {
        self.key.remaining_lifetime(self.clock.now())
    }

    async fn release_quietly(&mut self) {
        if let Err(e) = self.release().await {
            warn!(resource = %self.key, error = %e, "Failed to release lock");
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if !self.auto_release || !self.dirty {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(resource = %self.key, "No runtime to auto-release lock on drop");
            return;
        };

        let key = Arc::clone(&self.key);
        let store = Arc::clone(&self.store);
        runtime.spawn(async move {
            if let Err(e) = store.delete(&key).await {
                warn!(resource = %key, error = %e, "Failed to auto-release lock");
            }
        });
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("resource", &self.key.resource())
            .field("ttl", &self.ttl)
            .field("auto_release", &self.auto_release)
            .field("dirty", &self.dirty)
            .finish()
    }
}

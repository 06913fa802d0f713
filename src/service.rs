//! Entry point tying configuration, locks and rate limiters together.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{LockSetting, ThrottleConfig, DEFAULT_NAME};
use crate::db::Database;
use crate::error::{Result, ThrottleError};
use crate::lock::{DbLockStore, Lock, LockFactory};
use crate::ratelimit::{
    CompoundLimiter, DbStorage, Limiter, Rate, RateLimitPolicy, RateLimiterFactory, Storage,
};
use crate::registry::BackendRegistry;

/// Separates the factory id from the limiter key in a limiter address.
pub const ADDRESS_SEPARATOR: &str = "::";

/// Named lock stores and rate limiter factories, resolved once from
/// configuration.
pub struct ThrottleService {
    db: Database,
    clock: Arc<dyn Clock>,
    default_lock: String,
    default_rate_limiter: String,
    lock_factories: HashMap<String, LockFactory>,
    storages: HashMap<String, Arc<dyn Storage>>,
    rate_limiters: HashMap<String, RateLimiterFactory>,
}

impl ThrottleService {
    /// Build every configured backend and factory.
    ///
    /// Fails with `Config` when an entry names an unknown backend, lock
    /// store or storage.
    pub fn from_config(
        config: &ThrottleConfig,
        db: Database,
        registry: &BackendRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut lock_factories = HashMap::new();
        for (name, store_config) in &config.lock_stores {
            let store = registry.build_lock_store(&db, store_config, Arc::clone(&clock))?;
            lock_factories.insert(name.clone(), LockFactory::new(store));
        }

        let mut storages = HashMap::new();
        for (name, storage_config) in &config.storages {
            let storage = registry.build_storage(&db, storage_config, Arc::clone(&clock))?;
            storages.insert(name.clone(), storage);
        }

        let mut rate_limiters = HashMap::new();
        for (name, limiter_config) in &config.rate_limiters {
            let storage_name = limiter_config.storage.as_deref().unwrap_or(DEFAULT_NAME);
            let storage = storages.get(storage_name).cloned().ok_or_else(|| {
                ThrottleError::Config(format!(
                    "Rate limiter {:?} uses unknown storage {:?}",
                    name, storage_name
                ))
            })?;

            let lock_factory = match &limiter_config.lock {
                LockSetting::Enabled(false) => None,
                LockSetting::Enabled(true) => Some(&config.default_lock),
                LockSetting::Store(store) => Some(store),
            }
            .map(|store| {
                lock_factories.get(store).cloned().ok_or_else(|| {
                    ThrottleError::Config(format!(
                        "Rate limiter {:?} uses unknown lock store {:?}",
                        name, store
                    ))
                })
            })
            .transpose()?;

            let mut factory = RateLimiterFactory::new(
                name.clone(),
                limiter_config.policy,
                limiter_config.limit,
                &limiter_config.interval,
                storage,
                lock_factory,
            )?;
            if let Some(rate) = &limiter_config.rate {
                factory = factory.with_rate(Rate::parse(&rate.interval, rate.amount)?);
            }
            rate_limiters.insert(name.clone(), factory);
        }

        info!(
            lock_stores = lock_factories.len(),
            storages = storages.len(),
            rate_limiters = rate_limiters.len(),
            "Throttle service configured"
        );

        Ok(Self {
            db,
            clock,
            default_lock: config.default_lock.clone(),
            default_rate_limiter: config.default_rate_limiter.clone(),
            lock_factories,
            storages,
            rate_limiters,
        })
    }

    /// A lock factory by name, or the default one.
    pub fn lock_factory(&self, name: Option<&str>) -> Result<&LockFactory> {
        let name = name.unwrap_or(&self.default_lock);
        self.lock_factories
            .get(name)
            .ok_or_else(|| ThrottleError::Config(format!("Unknown lock store: {:?}", name)))
    }

    /// A limiter storage by name, or the default one.
    pub fn storage(&self, name: Option<&str>) -> Result<&Arc<dyn Storage>> {
        let name = name.unwrap_or(DEFAULT_NAME);
        self.storages
            .get(name)
            .ok_or_else(|| ThrottleError::Config(format!("Unknown storage: {:?}", name)))
    }

    /// A configured rate limiter factory by name, or the default one.
    pub fn rate_limiter(&self, name: Option<&str>) -> Result<&RateLimiterFactory> {
        let name = name.unwrap_or(&self.default_rate_limiter);
        self.rate_limiters
            .get(name)
            .ok_or_else(|| ThrottleError::Config(format!("Unknown rate limiter: {:?}", name)))
    }

    /// Try once to lock `resource` on the default lock store.
    ///
    /// Returns `None` when someone else holds it.
    pub async fn lock(
        &self,
        resource: &str,
        ttl: Option<f64>,
        auto_release: bool,
    ) -> Result<Option<Lock>> {
        let mut lock = self.lock_factory(None)?.create_lock(resource, ttl, auto_release);
        if lock.acquire().await? {
            Ok(Some(lock))
        } else {
            Ok(None)
        }
    }

    /// Take one of `slots` locks on `resource`.
    ///
    /// Tries `resource@1` through `resource@slots` once each and returns the
    /// first lock acquired with its slot number.
    pub async fn concurrent(
        &self,
        resource: &str,
        slots: usize,
        ttl: Option<f64>,
        auto_release: bool,
    ) -> Result<Option<(Lock, usize)>> {
        if slots == 0 {
            return Err(ThrottleError::InvalidArgument(
                "at least one concurrent slot is required".to_string(),
            ));
        }

        for slot in 1..=slots {
            let slot_resource = format!("{}@{}", resource, slot);
            if let Some(lock) = self.lock(&slot_resource, ttl, auto_release).await? {
                debug!(resource = %resource, slot = slot, "Acquired concurrent slot");
                return Ok(Some((lock, slot)));
            }
        }

        debug!(resource = %resource, slots = slots, "All concurrent slots are taken");
        Ok(None)
    }

    /// The limiter at `address` (`"factory::key"`) from a configured
    /// factory.
    pub fn limiter(&self, address: &str) -> Result<Box<dyn Limiter>> {
        let (factory, key) = split_address(address);
        Ok(self.rate_limiter(Some(factory))?.create(key))
    }

    /// Build an ad-hoc limiter at `address` (`"factory::key"`).
    ///
    /// State goes to the default storage; with `locked` the default lock
    /// store serializes updates.
    pub fn create_rate_limiter(
        &self,
        address: &str,
        policy: RateLimitPolicy,
        limit: u32,
        interval: &str,
        locked: bool,
    ) -> Result<Box<dyn Limiter>> {
        let (factory, key) = split_address(address);
        Ok(self
            .create_rate_limiter_factory(factory, policy, limit, interval, locked)?
            .create(key))
    }

    /// Build an ad-hoc rate limiter factory.
    pub fn create_rate_limiter_factory(
        &self,
        id: &str,
        policy: RateLimitPolicy,
        limit: u32,
        interval: &str,
        locked: bool,
    ) -> Result<RateLimiterFactory> {
        let lock_factory = if locked {
            Some(self.lock_factory(None)?.clone())
        } else {
            None
        };

        RateLimiterFactory::new(
            id,
            policy,
            limit,
            interval,
            Arc::clone(self.storage(None)?),
            lock_factory,
        )
    }

    /// A limiter consuming from every factory's limiter for `key`.
    pub fn create_compound_rate_limiter(
        &self,
        factories: &[&RateLimiterFactory],
        key: &str,
    ) -> Result<CompoundLimiter> {
        CompoundLimiter::new(factories.iter().map(|factory| factory.create(key)).collect())
    }

    /// Sweep expired rows from both tables.
    ///
    /// Returns the number of lock rows and limiter rows removed.
    pub async fn prune(&self) -> Result<(u64, u64)> {
        let locks = DbLockStore::with_defaults(self.db.clone())?
            .with_clock(Arc::clone(&self.clock))
            .prune()
            .await?;
        let states = DbStorage::new(self.db.clone())
            .with_clock(Arc::clone(&self.clock))
            .prune()
            .await?;

        info!(locks = locks, states = states, "Pruned expired rows");
        Ok((locks, states))
    }
}

/// Split `"factory::key"`; a missing key is empty.
fn split_address(address: &str) -> (&str, &str) {
    address.split_once(ADDRESS_SEPARATOR).unwrap_or((address, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("login::user:42"), ("login", "user:42"));
        assert_eq!(split_address("login::a::b"), ("login", "a::b"));
        assert_eq!(split_address("login"), ("login", ""));
    }
}

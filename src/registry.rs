//! Backend constructors addressed by name from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{LockStoreConfig, StorageConfig};
use crate::db::Database;
use crate::error::{Result, ThrottleError};
use crate::lock::{DbLockStore, PersistingStore};
use crate::ratelimit::{DbStorage, Storage};

/// Name of the built-in database backend.
pub const DATABASE_BACKEND: &str = "database";

/// Builds a lock store from its configuration.
pub type LockStoreBuilder =
    fn(&Database, &LockStoreConfig, Arc<dyn Clock>) -> Result<Arc<dyn PersistingStore>>;

/// Builds a limiter storage from its configuration.
pub type StorageBuilder = fn(&Database, &StorageConfig, Arc<dyn Clock>) -> Result<Arc<dyn Storage>>;

/// Known backends.
#[derive(Clone)]
pub struct BackendRegistry {
    lock_stores: HashMap<String, LockStoreBuilder>,
    storages: HashMap<String, StorageBuilder>,
}

impl BackendRegistry {
    /// A registry without any backend.
    pub fn empty() -> Self {
        Self {
            lock_stores: HashMap::new(),
            storages: HashMap::new(),
        }
    }

    /// Register a lock store backend, replacing any with the same name.
    pub fn register_lock_store(&mut self, name: impl Into<String>, builder: LockStoreBuilder) {
        self.lock_stores.insert(name.into(), builder);
    }

    /// Register a storage backend, replacing any with the same name.
    pub fn register_storage(&mut self, name: impl Into<String>, builder: StorageBuilder) {
        self.storages.insert(name.into(), builder);
    }

    /// Build the lock store described by `config`.
    pub fn build_lock_store(
        &self,
        db: &Database,
        config: &LockStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn PersistingStore>> {
        let builder = self.lock_stores.get(&config.backend).ok_or_else(|| {
            ThrottleError::Config(format!("Unknown lock store backend: {:?}", config.backend))
        })?;
        builder(db, config, clock)
    }

    /// Build the storage described by `config`.
    pub fn build_storage(
        &self,
        db: &Database,
        config: &StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn Storage>> {
        let builder = self.storages.get(&config.backend).ok_or_else(|| {
            ThrottleError::Config(format!("Unknown storage backend: {:?}", config.backend))
        })?;
        builder(db, config, clock)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_lock_store(DATABASE_BACKEND, database_lock_store);
        registry.register_storage(DATABASE_BACKEND, database_storage);
        registry
    }
}

fn database_lock_store(
    db: &Database,
    config: &LockStoreConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn PersistingStore>> {
    let store = DbLockStore::new(db.clone(), config.gc_probability, config.initial_ttl)?;
    Ok(Arc::new(store.with_clock(clock)))
}

fn database_storage(
    db: &Database,
    _config: &StorageConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Storage>> {
    Ok(Arc::new(DbStorage::new(db.clone()).with_clock(clock)))
}

//! Factory for lock handles sharing one store.

use std::sync::Arc;

use super::handle::Lock;
use super::key::Key;
use super::store::PersistingStore;

/// Default lock TTL in seconds.
pub const DEFAULT_LOCK_TTL: f64 = 300.0;

/// Creates [`Lock`] handles backed by one store.
#[derive(Clone)]
pub struct LockFactory {
    store: Arc<dyn PersistingStore>,
}

impl LockFactory {
    /// Create a factory over `store`.
    pub fn new(store: Arc<dyn PersistingStore>) -> Self {
        Self { store }
    }

    /// Create a lock for `resource` with a fresh key.
    pub fn create_lock(&self, resource: &str, ttl: Option<f64>, auto_release: bool) -> Lock {
        self.create_lock_from_key(Key::new(resource), ttl, auto_release)
    }

    /// Create a lock for an existing key.
    pub fn create_lock_from_key(&self, key: Key, ttl: Option<f64>, auto_release: bool) -> Lock {
        Lock::new(key, Arc::clone(&self.store), ttl, auto_release)
    }
}

impl std::fmt::Debug for LockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFactory").finish_non_exhaustive()
    }
}

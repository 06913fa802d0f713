//! Distributed locks over a relational table.

mod factory;
mod handle;
mod key;
mod store;

pub use factory::{LockFactory, DEFAULT_LOCK_TTL};
pub use handle::Lock;
pub use key::Key;
pub use store::{DbLockStore, PersistingStore, DEFAULT_GC_PROBABILITY, DEFAULT_INITIAL_TTL};

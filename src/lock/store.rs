//! Database-backed lock store.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use sqlx::AnyConnection;
use tracing::{debug, info, instrument, trace, warn};

use super::key::Key;
use crate::clock::{Clock, SystemClock};
use crate::db::{Database, LOCK_TABLE};
use crate::error::{Result, ThrottleError};

/// Default chance of pruning expired rows after a save.
pub const DEFAULT_GC_PROBABILITY: f64 = 0.01;
/// Default lifetime, in seconds, granted by a save.
pub const DEFAULT_INITIAL_TTL: u64 = 300;

/// Trait for lock stores.
///
/// Every operation is keyed by a [`Key`]: its hashed resource names the row
/// and its token proves ownership.
#[async_trait]
pub trait PersistingStore: Send + Sync {
    /// Create the lock, or take over an expired one.
    ///
    /// ## Returns
    /// - `Err(ThrottleError::LockConflicted)`: someone else holds the lock
    /// - `Err(ThrottleError::LockExpired)`: the write succeeded but the key's
    ///   own lifetime ran out meanwhile
    async fn save(&self, key: &Key) -> Result<()>;

    /// Release the lock if `key` owns it; no-op otherwise.
    async fn delete(&self, key: &Key) -> Result<()>;

    /// Whether `key` currently owns an unexpired lock.
    async fn exists(&self, key: &Key) -> Result<bool>;

    /// Extend the lock owned by `key`, or claim it if it has expired.
    async fn put_off_expiration(&self, key: &Key, ttl: f64) -> Result<()>;

    /// The clock this store measures expiration with.
    fn clock(&self) -> Arc<dyn Clock>;
}

/// Lock store over the `lock_keys` table.
///
/// Callers racing on one key are serialized by the database row lock taken
/// in [`save`](PersistingStore::save); renewals use a single conditional
/// update. Expired rows are pruned after a save with probability
/// `gc_probability`.
#[derive(Clone)]
pub struct DbLockStore {
    db: Database,
    gc_probability: f64,
    initial_ttl: u64,
    clock: Arc<dyn Clock>,
}

impl DbLockStore {
    /// Create a new lock store.
    ///
    /// Fails with `InvalidArgument` when `gc_probability` is outside
    /// `[0, 1]` and with `InvalidTtl` when `initial_ttl` is zero or too
    /// large for an epoch-seconds expiration.
    pub fn new(db: Database, gc_probability: f64, initial_ttl: u64) -> Result<Self> {
        if !(0.0..=1.0).contains(&gc_probability) {
            return Err(ThrottleError::InvalidArgument(format!(
                "gc_probability must be between 0 and 1, {} given",
                gc_probability
            )));
        }

        if initial_ttl < 1 || initial_ttl > i64::MAX as u64 {
            return Err(ThrottleError::InvalidTtl(format!(
                "initial_ttl must be between 1 and {} seconds, {} given",
                i64::MAX,
                initial_ttl
            )));
        }

        Ok(Self {
            db,
            gc_probability,
            initial_ttl,
            clock: Arc::new(SystemClock),
        })
    }

    /// Create a lock store with the default GC probability and TTL.
    pub fn with_defaults(db: Database) -> Result<Self> {
        Self::new(db, DEFAULT_GC_PROBABILITY, DEFAULT_INITIAL_TTL)
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lifetime in seconds granted by a save.
    pub fn initial_ttl(&self) -> u64 {
        self.initial_ttl
    }

    /// Delete every expired row. Returns the number of rows removed.
    pub async fn prune(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM lock_keys WHERE expiration <= $1")
            .bind(self.clock.now_secs())
            .execute(self.db.pool())
            .await?;

        debug!(rows = result.rows_affected(), "Pruned expired locks");
        Ok(result.rows_affected())
    }

    fn should_prune(&self) -> bool {
        if self.gc_probability <= 0.0 {
            return false;
        }
        self.gc_probability >= 1.0 || rand::thread_rng().gen::<f64>() <= self.gc_probability
    }

    async fn randomly_prune(&self) -> Result<()> {
        if self.should_prune() {
            trace!(gc_probability = self.gc_probability, "Running lock GC");
            self.prune().await?;
        }
        Ok(())
    }

    /// Fail with `LockExpired` once the key's own lifetime is over, after a
    /// best-effort release.
    async fn check_not_expired(&self, key: &Key) -> Result<()> {
        if !key.is_expired(self.clock.now()) {
            return Ok(());
        }

        if let Err(e) = self.delete(key).await {
            warn!(resource = %key, error = %e, "Failed to release expired lock");
        }
        warn!(resource = %key, "Lock lifetime elapsed before the operation completed");
        Err(ThrottleError::LockExpired(key.resource().to_string()))
    }

    async fn exists_on(&self, conn: &mut AnyConnection, key: &Key) -> Result<bool> {
        let row = sqlx::query(
            "SELECT id FROM lock_keys WHERE id = $1 AND token = $2 AND expiration > $3",
        )
        .bind(key.hashed())
        .bind(key.token())
        .bind(self.clock.now_secs())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.is_some())
    }

    /// The compare-and-swap renewal, run on `conn`.
    ///
    /// Matches the row when the caller already owns it or when it has
    /// expired; in both cases the caller's token is written.
    async fn put_off_expiration_on(
        &self,
        conn: &mut AnyConnection,
        key: &Key,
        ttl: f64,
    ) -> Result<()> {
        if ttl.is_nan() || ttl < 1.0 {
            return Err(ThrottleError::InvalidTtl(format!(
                "TTL must be at least 1 second, {} given",
                ttl
            )));
        }

        let now = self.clock.now();
        let expiration = expiration_after(now, ttl)?;
        key.reduce_lifetime(ttl, now);

        let now_secs = self.clock.now_secs();
        let result = sqlx::query(
            r#"UPDATE lock_keys
               SET expiration = $1, token = $2
             WHERE id = $3 AND (token = $4 OR expiration <= $5)"#,
        )
        .bind(expiration)
        .bind(key.token())
        .bind(key.hashed())
        .bind(key.token())
        .bind(now_secs)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 && !self.exists_on(conn, key).await? {
            info!(resource = %key, "Lock is held by another owner");
            return Err(ThrottleError::LockConflicted(key.resource().to_string()));
        }

        debug!(resource = %key, ttl = ttl, "Lock expiration put off");
        Ok(())
    }
}

/// Row expiration for a lifetime of `ttl` seconds starting at `now`.
///
/// Rounded up, so the row never expires before the key's own lifetime.
fn expiration_after(now: f64, ttl: f64) -> Result<i64> {
    let expiration = (now + ttl).ceil();
    // `i64::MAX as f64` is 2^63, one past the largest representable value.
    if !expiration.is_finite() || expiration >= i64::MAX as f64 {
        return Err(ThrottleError::InvalidTtl(format!(
            "TTL of {} seconds overflows the expiration timestamp",
            ttl
        )));
    }
    Ok(expiration as i64)
}

#[async_trait]
impl PersistingStore for DbLockStore {
    #[instrument(skip(self, key), fields(resource = %key))]
    async fn save(&self, key: &Key) -> Result<()> {
        let now = self.clock.now();
        let expiration = expiration_after(now, self.initial_ttl as f64)?;
        key.reduce_lifetime(self.initial_ttl as f64, now);

        let hashed = key.hashed();
        let mut tx = self.db.begin().await?;

        let existing = self
            .db
            .select_for_update(&mut tx, LOCK_TABLE, "id", &hashed)
            .await?;

        match existing {
            None => {
                let inserted = sqlx::query(
                    "INSERT INTO lock_keys (id, token, expiration) VALUES ($1, $2, $3)",
                )
                .bind(&hashed)
                .bind(key.token())
                .bind(expiration)
                .execute(&mut *tx)
                .await;

                match inserted {
                    Ok(_) => debug!("Lock row created"),
                    // Another transaction inserted the same key first.
                    Err(e) if ThrottleError::is_unique_violation(&e) => {
                        info!("Lock created concurrently by another owner");
                        return Err(ThrottleError::LockConflicted(key.resource().to_string()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(_) => {
                self.put_off_expiration_on(&mut tx, key, self.initial_ttl as f64)
                    .await?;
            }
        }

        tx.commit().await?;

        self.randomly_prune().await?;
        self.check_not_expired(key).await
    }

    #[instrument(skip(self, key), fields(resource = %key))]
    async fn delete(&self, key: &Key) -> Result<()> {
        let result = sqlx::query("DELETE FROM lock_keys WHERE id = $1 AND token = $2")
            .bind(key.hashed())
            .bind(key.token())
            .execute(self.db.pool())
            .await?;

        debug!(rows = result.rows_affected(), "Lock released");
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        let mut conn = self.db.pool().acquire().await?;
        self.exists_on(&mut conn, key).await
    }

    #[instrument(skip(self, key), fields(resource = %key))]
    async fn put_off_expiration(&self, key: &Key, ttl: f64) -> Result<()> {
        {
            let mut conn = self.db.pool().acquire().await?;
            self.put_off_expiration_on(&mut conn, key, ttl).await?;
        }
        self.check_not_expired(key).await
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

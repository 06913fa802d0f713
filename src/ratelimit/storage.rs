//! Rate limiter state persistence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, instrument};

use super::limiter::secs;
use crate::clock::{Clock, SystemClock};
use crate::db::{Database, RATE_LIMIT_TABLE};
use crate::error::{Result, ThrottleError};

/// Opaque limiter state as persisted between invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterState {
    /// Limiter id, unique per stored row
    pub id: String,
    /// Type tag of the serialized state
    pub class: String,
    /// Serialized state; never interpreted by the storage
    pub body: Vec<u8>,
    /// How long the state stays valid; `None` or zero keeps the stored
    /// expiration untouched
    pub expires_in: Option<Duration>,
}

impl LimiterState {
    /// Create a state with no expiration.
    pub fn new(id: impl Into<String>, class: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            body,
            expires_in: None,
        }
    }

    /// Set how long the state stays valid.
    pub fn with_expiration(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }
}

/// Trait for rate limiter state storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace the state stored under `state.id`.
    async fn save(&self, state: &LimiterState) -> Result<()>;

    /// Load a state; `None` when absent or expired.
    async fn fetch(&self, id: &str) -> Result<Option<LimiterState>>;

    /// Remove a state; no-op when absent.
    async fn delete(&self, id: &str) -> Result<()>;

    /// The clock this storage measures expiration with.
    fn clock(&self) -> Arc<dyn Clock>;
}

/// JSON shape of the `payload` column.
#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    class: String,
    body: String,
}

/// Limiter storage over the `rate_limits` table.
///
/// Every save first removes all expired rows, then rewrites the target row
/// while holding its row lock.
#[derive(Clone)]
pub struct DbStorage {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl DbStorage {
    /// Create a new storage.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Delete every expired row. Returns the number of rows removed.
    pub async fn prune(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM rate_limits WHERE expired_at IS NOT NULL AND expired_at < $1",
        )
        .bind(self.clock.now())
        .execute(self.db.pool())
        .await?;

        debug!(rows = result.rows_affected(), "Pruned expired limiter states");
        Ok(result.rows_affected())
    }

    fn encode_payload(state: &LimiterState) -> Result<String> {
        let payload = Payload {
            class: state.class.clone(),
            body: STANDARD.encode(&state.body),
        };
        serde_json::to_string(&payload).map_err(|e| {
            ThrottleError::InvalidArgument(format!("cannot encode limiter state: {}", e))
        })
    }

    fn decode_payload(id: &str, raw: &str) -> Result<(String, Vec<u8>)> {
        let payload: Payload = serde_json::from_str(raw).map_err(|e| {
            ThrottleError::Deserialization(format!("invalid payload for {:?}: {}", id, e))
        })?;
        let body = STANDARD.decode(payload.body.as_bytes()).map_err(|e| {
            ThrottleError::Deserialization(format!("invalid body for {:?}: {}", id, e))
        })?;
        Ok((payload.class, body))
    }
}

#[async_trait]
impl Storage for DbStorage {
    #[instrument(skip(self, state), fields(id = %state.id))]
    async fn save(&self, state: &LimiterState) -> Result<()> {
        self.prune().await?;

        let payload = Self::encode_payload(state)?;
        let mut tx = self.db.begin().await?;

        let existing = self
            .db
            .select_for_update(&mut tx, RATE_LIMIT_TABLE, "expired_at", &state.id)
            .await?;

        let expired_at = match state.expires_in {
            Some(offset) if !offset.is_zero() => Some(self.clock.now() + offset.as_secs_f64()),
            _ => match &existing {
                Some(row) => row.try_get::<Option<f64>, _>("expired_at")?,
                None => None,
            },
        };

        if existing.is_some() {
            sqlx::query("UPDATE rate_limits SET payload = $1, expired_at = $2 WHERE id = $3")
                .bind(&payload)
                .bind(expired_at)
                .bind(&state.id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "INSERT INTO rate_limits (id, payload, expired_at, params) VALUES ($1, $2, $3, $4)",
            )
            .bind(&state.id)
            .bind(&payload)
            .bind(expired_at)
            .bind("{}")
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(class = %state.class, expired_at = ?expired_at, "Limiter state saved");
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Option<LimiterState>> {
        let row = sqlx::query("SELECT payload, expired_at FROM rate_limits WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let now = self.clock.now();
        let expired_at: Option<f64> = row.try_get("expired_at")?;
        if matches!(expired_at, Some(t) if t < now) {
            debug!(id = %id, "Limiter state expired");
            return Ok(None);
        }

        let raw: String = row.try_get("payload")?;
        let (class, body) = Self::decode_payload(id, &raw)?;

        Ok(Some(LimiterState {
            id: id.to_string(),
            class,
            body,
            expires_in: expired_at.map(|t| secs(t - now)),
        }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_limits WHERE id = $1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn setup() -> (DbStorage, Arc<ManualClock>, Database) {
        let db = Database::connect_url("sqlite::memory:").await.unwrap();
        db.ensure_schema().await.unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let storage = DbStorage::new(db.clone()).with_clock(clock.clone());
        (storage, clock, db)
    }

    async fn stored_expired_at(db: &Database, id: &str) -> Option<f64> {
        sqlx::query("SELECT expired_at FROM rate_limits WHERE id = $1")
            .bind(id)
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("expired_at")
    }

    #[tokio::test]
    async fn test_save_then_fetch() {
        let (storage, _clock, _db) = setup().await;
        let state = LimiterState::new("user:42", "FixedWindow", vec![0, 1, 2, 255])
            .with_expiration(Duration::from_secs(60));

        storage.save(&state).await.unwrap();
        let fetched = storage.fetch("user:42").await.unwrap().unwrap();

        assert_eq!(fetched.class, "FixedWindow");
        assert_eq!(fetched.body, vec![0, 1, 2, 255]);
        assert_eq!(fetched.expires_in, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_fetch_missing_is_none() {
        let (storage, _clock, _db) = setup().await;
        assert!(storage.fetch("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_expired_is_none() {
        let (storage, clock, _db) = setup().await;
        let state = LimiterState::new("user:42", "FixedWindow", b"body".to_vec())
            .with_expiration(Duration::from_millis(1_500));

        storage.save(&state).await.unwrap();
        clock.advance(Duration::from_secs(1));
        assert!(storage.fetch("user:42").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(storage.fetch("user:42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_updates_in_place() {
        let (storage, clock, db) = setup().await;
        let first = LimiterState::new("user:42", "FixedWindow", b"one".to_vec())
            .with_expiration(Duration::from_secs(60));
        storage.save(&first).await.unwrap();

        clock.advance(Duration::from_secs(10));
        let second = LimiterState::new("user:42", "FixedWindow", b"two".to_vec());
        storage.save(&second).await.unwrap();

        let fetched = storage.fetch("user:42").await.unwrap().unwrap();
        assert_eq!(fetched.body, b"two".to_vec());
        // No new offset given, so the earlier expiration stays.
        assert_eq!(stored_expired_at(&db, "user:42").await, Some(1_700_000_060.0));
    }

    #[tokio::test]
    async fn test_state_without_expiration_never_expires() {
        let (storage, clock, db) = setup().await;
        storage
            .save(&LimiterState::new("forever", "NoLimit", Vec::new()))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(86_400 * 365));
        let fetched = storage.fetch("forever").await.unwrap().unwrap();
        assert_eq!(fetched.expires_in, None);
        assert_eq!(stored_expired_at(&db, "forever").await, None);
    }

    #[tokio::test]
    async fn test_save_prunes_other_expired_rows() {
        let (storage, clock, _db) = setup().await;
        let stale = LimiterState::new("stale", "FixedWindow", b"old".to_vec())
            .with_expiration(Duration::from_secs(1));
        storage.save(&stale).await.unwrap();

        clock.advance(Duration::from_secs(5));
        storage
            .save(&LimiterState::new("fresh", "FixedWindow", b"new".to_vec()))
            .await
            .unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM rate_limits WHERE id = $1")
            .bind("stale")
            .fetch_one(storage.db.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let (storage, _clock, _db) = setup().await;
        storage
            .save(&LimiterState::new("user:42", "FixedWindow", b"x".to_vec()))
            .await
            .unwrap();

        storage.delete("user:42").await.unwrap();
        assert!(storage.fetch("user:42").await.unwrap().is_none());

        // Deleting again is fine.
        storage.delete("user:42").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_payload_fails_to_deserialize() {
        let (storage, _clock, db) = setup().await;
        sqlx::query("INSERT INTO rate_limits (id, payload, expired_at, params) VALUES ($1, $2, $3, $4)")
            .bind("broken")
            .bind("{not json")
            .bind(None::<f64>)
            .bind("{}")
            .execute(db.pool())
            .await
            .unwrap();

        let err = storage.fetch("broken").await.unwrap_err();
        assert!(matches!(err, ThrottleError::Deserialization(_)));

        sqlx::query("UPDATE rate_limits SET payload = $1 WHERE id = $2")
            .bind(r#"{"class":"FixedWindow","body":"***"}"#)
            .bind("broken")
            .execute(db.pool())
            .await
            .unwrap();

        let err = storage.fetch("broken").await.unwrap_err();
        assert!(matches!(err, ThrottleError::Deserialization(_)));
    }
}

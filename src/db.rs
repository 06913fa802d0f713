//! Transactional SQL access shared by the lock store and limiter storage.
//!
//! Both tables are reached through one `sqlx::AnyPool`, so the same code
//! runs against SQLite and PostgreSQL. The only engine-specific behavior is
//! how a row is locked for the rest of a transaction, see [`Dialect`].

use std::time::Duration;

use sqlx::any::{Any, AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool};
use sqlx::Transaction;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{Result, ThrottleError};

/// Table holding lock ownership rows.
pub const LOCK_TABLE: &str = "lock_keys";
/// Table holding rate limiter state rows.
pub const RATE_LIMIT_TABLE: &str = "rate_limits";

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS lock_keys (
        id VARCHAR(64) NOT NULL PRIMARY KEY,
        token VARCHAR(44) NOT NULL,
        expiration BIGINT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_lock_keys_expiration ON lock_keys (expiration)",
    r#"CREATE TABLE IF NOT EXISTS rate_limits (
        id VARCHAR(255) NOT NULL PRIMARY KEY,
        payload TEXT NOT NULL,
        expired_at DOUBLE PRECISION NULL,
        params TEXT NOT NULL DEFAULT '{}'
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_rate_limits_expired_at ON rate_limits (expired_at)",
];

/// SQL engine behind a connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite has no `FOR UPDATE`; a transaction that writes first holds
    /// the database write lock until it ends, which serializes callers.
    Sqlite,
    /// PostgreSQL locks the row with `SELECT ... FOR UPDATE`.
    Postgres,
}

impl Dialect {
    /// Detect the dialect from a sqlx connection URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "sqlite" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            other => Err(ThrottleError::Config(format!(
                "Unsupported database scheme: {:?}",
                other
            ))),
        }
    }
}

/// A pooled database handle.
#[derive(Debug, Clone)]
pub struct Database {
    pool: AnyPool,
    dialect: Dialect,
}

impl Database {
    /// Connect using the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let dialect = Dialect::from_url(&config.url)?;
        let mut options = AnyPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));

        // Every connection to an in-memory SQLite database is a new database.
        if config.url.contains(":memory:") {
            options = options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = options.connect(&config.url).await?;
        info!(dialect = ?dialect, "Connected to database");

        Ok(Self { pool, dialect })
    }

    /// Connect to a URL with default pool settings.
    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::connect(&DatabaseConfig {
            url: url.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Begin a transaction. Dropping it without commit rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Any>> {
        Ok(self.pool.begin().await?)
    }

    /// Create both tables and their indexes if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *conn).await?;
        }
        debug!("Schema is up to date");
        Ok(())
    }

    /// Read the row `id` of `table` and keep it locked until the
    /// surrounding transaction ends.
    ///
    /// `table` and `columns` are interpolated and must never carry caller
    /// input.
    pub(crate) async fn select_for_update(
        &self,
        conn: &mut AnyConnection,
        table: &str,
        columns: &str,
        id: &str,
    ) -> Result<Option<AnyRow>> {
        let row = match self.dialect {
            Dialect::Postgres => {
                let sql = format!("SELECT {} FROM {} WHERE id = $1 FOR UPDATE", columns, table);
                sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?
            }
            Dialect::Sqlite => {
                // Writing first takes the write lock before any read happens.
                let touch = format!("UPDATE {} SET id = id WHERE id = $1", table);
                sqlx::query(&touch).bind(id).execute(&mut *conn).await?;

                let sql = format!("SELECT {} FROM {} WHERE id = $1", columns, table);
                sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?
            }
        };
        Ok(row)
    }
}

//! SQLite-backed [`DurableStore`] using `sqlx`.
//!
//! # Feature Flag
//!
//! This module requires the `sqlite` feature:
//!
//! ```toml
//! [dependencies]
//! punteggi = { version = "0.1", features = ["sqlite"] }
//! ```
//!
//! # Schema
//!
//! A single table holds the durable counters:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS counters (
//!     key   TEXT PRIMARY KEY,
//!     total INTEGER NOT NULL DEFAULT 0
//! )
//! ```
//!
//! The accumulate-upsert is one statement, so it is atomic even with
//! multiple flush workers sharing the pool:
//!
//! ```sql
//! INSERT INTO counters (key, total) VALUES (?1, ?2)
//! ON CONFLICT (key) DO UPDATE SET total = total + excluded.total
//! RETURNING total
//! ```
//!
//! Note the `total + excluded.total`: the conflict clause *accumulates*.
//! `SET total = excluded.total` would silently discard every total already
//! on disk each time a delta lands.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use super::{DurableStore, StoreError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS counters (
    key   TEXT PRIMARY KEY,
    total INTEGER NOT NULL DEFAULT 0
)";

const UPSERT: &str = "INSERT INTO counters (key, total) VALUES (?1, ?2)
ON CONFLICT (key) DO UPDATE SET total = total + excluded.total
RETURNING total";

const SELECT: &str = "SELECT total FROM counters WHERE key = ?1";

/// [`DurableStore`] implementation backed by a SQLite database.
///
/// # Examples
///
/// ```rust,ignore
/// use punteggi::store::sqlite::SqliteStore;
/// use punteggi::store::DurableStore;
///
/// let store = SqliteStore::connect("sqlite:counters.db").await?;
/// let total = store.increment("u1", 3).await?;
/// ```
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects to the database at `url` and ensures the schema exists.
    ///
    /// The URL follows sqlx conventions, e.g. `sqlite:counters.db` or
    /// `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(map_sqlx)?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool and ensures the schema exists.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(map_sqlx)?;
        Ok(SqliteStore { pool })
    }

    /// Returns the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        sqlx::query_scalar(UPSERT)
            .bind(key)
            .bind(delta)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn fetch_total(&self, key: &str) -> Result<Option<i64>, StoreError> {
        sqlx::query_scalar(SELECT)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }
}

/// Maps sqlx errors onto the retryable [`StoreError`] taxonomy.
fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        sqlx::Error::Database(db) => StoreError::Constraint(db.to_string()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A single-connection in-memory database; with more than one
    /// connection each would see its own empty `:memory:` instance.
    async fn memory_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::from_pool(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_increment_creates_row() {
        let store = memory_store().await;
        assert_eq!(store.increment("u1", 5).await.unwrap(), 5);
        assert_eq!(store.fetch_total("u1").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_accumulate_on_conflict() {
        let store = memory_store().await;
        store.increment("u1", 10).await.unwrap();
        // The conflict clause must add, never overwrite.
        assert_eq!(store.increment("u1", 3).await.unwrap(), 13);
        assert_eq!(store.fetch_total("u1").await.unwrap(), Some(13));
    }

    #[tokio::test]
    async fn test_zero_delta_is_noop() {
        let store = memory_store().await;
        store.increment("u1", 7).await.unwrap();
        assert_eq!(store.increment("u1", 0).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_fetch_total_absent() {
        let store = memory_store().await;
        assert_eq!(store.fetch_total("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = memory_store().await;
        store.increment("u1", 2).await.unwrap();
        store.increment("u2", 9).await.unwrap();
        assert_eq!(store.fetch_total("u1").await.unwrap(), Some(2));
        assert_eq!(store.fetch_total("u2").await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::from_pool(pool.clone()).await.unwrap();
        store.increment("u1", 4).await.unwrap();

        // Re-running the bootstrap must not drop existing rows.
        let store = SqliteStore::from_pool(pool).await.unwrap();
        assert_eq!(store.fetch_total("u1").await.unwrap(), Some(4));
    }
}

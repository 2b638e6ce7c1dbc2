//! Durable store abstraction and implementations.
//!
//! This module defines [`DurableStore`], the single persistence seam of the
//! crate, together with its error type and an in-memory implementation.
//! The contract is one atomic *accumulate-upsert*: if no row exists for a
//! key, create it with `total = delta`; otherwise `total = total + delta`.
//! Overwriting the stored total with the delta (discarding prior history)
//! is the classic bug this contract exists to rule out, and the tests in
//! this module reject it.
//!
//! # Implementations
//!
//! | Type | Backing | Feature |
//! |------|---------|---------|
//! | [`MemoryStore`] | in-process `HashMap` | always available |
//! | [`sqlite::SqliteStore`] | SQLite via `sqlx` | `sqlite` |
//!
//! [`MemoryStore`] doubles as the test stand-in: it can be told to fail
//! per key or wholesale, which is how flush retry behaviour is exercised
//! without a real database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Error type for durable-store operations.
///
/// Every variant is retryable from the flush scheduler's point of view:
/// the captured delta is merged back into the cache and the flush is
/// attempted again on a later tick. None of them is fatal to the process.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, pool exhausted,
    /// broken pipe).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within its deadline.
    #[error("store operation timed out")]
    Timeout,

    /// The store rejected the row (constraint violation).
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// The persistence seam of the write-back cache.
///
/// Implementations must make [`increment`](Self::increment) an *atomic*
/// accumulate-upsert; two concurrent increments for the same key must both
/// be reflected in the stored total.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Atomically adds `delta` to the stored total for `key`, creating the
    /// row with `total = delta` if it does not exist.
    ///
    /// Returns the new total after the addition. `increment(key, 0)` must
    /// leave the total unchanged.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Returns the stored total for `key`, or `None` if no row exists.
    async fn fetch_total(&self, key: &str) -> Result<Option<i64>, StoreError>;
}

/// In-memory [`DurableStore`] with failure injection.
///
/// Useful as a stand-in store in tests and examples. Failures can be
/// injected per key ([`fail_key`](Self::fail_key)) or for every operation
/// ([`set_fail_all`](Self::set_fail_all)); injected failures report as
/// [`StoreError::Unavailable`], exactly what a flaky database looks like
/// to the flush scheduler.
///
/// # Examples
///
/// ```rust
/// use punteggi::store::{DurableStore, MemoryStore};
///
/// # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// # rt.block_on(async {
/// let store = MemoryStore::new();
/// assert_eq!(store.increment("u1", 3).await.unwrap(), 3);
/// assert_eq!(store.increment("u1", 2).await.unwrap(), 5);
///
/// store.fail_key("u1");
/// assert!(store.increment("u1", 1).await.is_err());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, i64>>,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store with no failures injected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `increment`/`fetch_total` for `key` fail until
    /// [`heal_key`](Self::heal_key) is called.
    pub fn fail_key(&self, key: &str) {
        self.failing
            .lock()
            .expect("failure set poisoned")
            .insert(key.to_owned());
    }

    /// Clears an injected per-key failure.
    pub fn heal_key(&self, key: &str) {
        self.failing
            .lock()
            .expect("failure set poisoned")
            .remove(key);
    }

    /// Makes every operation fail (`true`) or restores normal operation
    /// (`false`).
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::Relaxed);
    }

    /// Synchronous read of the stored total, for assertions in tests.
    pub fn stored_total(&self, key: &str) -> Option<i64> {
        self.rows.lock().expect("rows poisoned").get(key).copied()
    }

    /// Number of rows currently stored.
    pub fn row_count(&self) -> usize {
        self.rows.lock().expect("rows poisoned").len()
    }

    fn check_available(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_all.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        if self.failing.lock().expect("failure set poisoned").contains(key) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for key {key:?}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    /// Accumulates `delta` into the row, creating it if absent.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.check_available(key)?;
        let mut rows = self.rows.lock().expect("rows poisoned");
        let total = rows.entry(key.to_owned()).or_insert(0);
        *total += delta;
        Ok(*total)
    }

    async fn fetch_total(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check_available(key)?;
        Ok(self.rows.lock().expect("rows poisoned").get(key).copied())
    }
}

//! The counter service façade.
//!
//! [`CounterService`] ties the pieces together: it owns the pending-delta
//! cache, the warm durable totals, the store handle and (once started) the
//! flush scheduler. Event-ingestion code calls [`bump`](CounterService::bump)
//! once per interaction; readers call [`total`](CounterService::total).
//!
//! # Durability contract
//!
//! `bump` never surfaces a durability error: the increment is recorded in
//! memory immediately and reaches the store on a later flush tick, with
//! retry on failure. This is an at-least-once, eventually-durable
//! contract; callers that need the durable row up to date first call
//! [`flush_now`](CounterService::flush_now), or
//! [`flush_key`](CounterService::flush_key) for a single key.
//!
//! # Consistency
//!
//! `total` returns `durable total + pending delta`. It is not atomically
//! consistent with a concurrent flush: during the instant a delta is in
//! flight the value may transiently count it on either side, bounded by
//! one flush window.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::cache::{DurableTotals, PendingDeltas};
use crate::error::{CounterError, Result};
use crate::flush::{flush_key, flush_once, spawn_flusher, FlushConfig, FlushOutcome, FlusherHandle};
use crate::store::DurableStore;

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 128;

/// Checks that a key can be represented in storage.
///
/// Accepted keys are non-empty, at most [`MAX_KEY_LEN`] bytes, and consist
/// of ASCII alphanumerics, `_`, `-` and `.`, which covers numeric account
/// identifiers as well as usernames.
///
/// # Examples
///
/// ```rust
/// use punteggi::service::validate_key;
///
/// assert!(validate_key("123456789").is_ok());
/// assert!(validate_key("user_1.a-b").is_ok());
/// assert!(validate_key("").is_err());
/// assert!(validate_key("no spaces").is_err());
/// ```
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CounterError::MalformedKey {
            key: key.to_owned(),
            reason: "key is empty",
        });
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CounterError::MalformedKey {
            key: key.to_owned(),
            reason: "key exceeds maximum length",
        });
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(CounterError::MalformedKey {
            key: key.to_owned(),
            reason: "key contains characters outside [A-Za-z0-9_.-]",
        });
    }
    Ok(())
}

/// Public façade over the write-back counter cache.
///
/// # Lifecycle
///
/// Construct with [`new`](Self::new), optionally tune the scheduler with
/// [`with_flush`](Self::with_flush), call [`start`](Self::start) inside a
/// tokio runtime to begin background flushing, and
/// [`shutdown`](Self::shutdown) to drain before exit. A service that is
/// never started still works; deltas then only reach the store through
/// [`flush_now`](Self::flush_now) or [`shutdown`](Self::shutdown).
///
/// # Examples
///
/// ```rust,no_run
/// use punteggi::flush::FlushConfig;
/// use punteggi::service::CounterService;
/// use punteggi::store::MemoryStore;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> punteggi::Result<()> {
/// let service = CounterService::new(Arc::new(MemoryStore::new()))
///     .with_flush(FlushConfig::default().with_interval(Duration::from_secs(2)));
/// service.start();
///
/// service.bump("u1")?;
/// service.bump("u1")?;
/// assert_eq!(service.total("u1").await?, 2);
///
/// service.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct CounterService {
    cache: Arc<PendingDeltas>,
    totals: Arc<DurableTotals>,
    store: Arc<dyn DurableStore>,
    config: FlushConfig,
    flusher: Mutex<Option<FlusherHandle>>,
}

impl CounterService {
    /// Creates a service over `store` with the default flush configuration.
    ///
    /// No background task is spawned until [`start`](Self::start).
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        CounterService {
            cache: Arc::new(PendingDeltas::new()),
            totals: Arc::new(DurableTotals::new()),
            store,
            config: FlushConfig::default(),
            flusher: Mutex::new(None),
        }
    }

    /// Sets the flush configuration, returning `self` for method chaining.
    ///
    /// Takes effect on the next [`start`](Self::start).
    pub fn with_flush(mut self, config: FlushConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawns the flush scheduler on the current tokio runtime.
    ///
    /// Calling `start` on an already-started service is a no-op.
    pub fn start(&self) {
        let mut flusher = self.flusher.lock().expect("flusher slot poisoned");
        if flusher.is_none() {
            *flusher = Some(spawn_flusher(
                Arc::clone(&self.cache),
                Arc::clone(&self.totals),
                Arc::clone(&self.store),
                self.config,
            ));
            debug!(interval = ?self.config.interval, "flush scheduler started");
        }
    }

    /// Records one increment for `key`.
    ///
    /// O(1) and non-blocking; safe to call from many concurrent event
    /// sources. Fails only on a malformed key; durability problems never
    /// surface here.
    pub fn bump(&self, key: &str) -> Result<()> {
        self.bump_by(key, 1)
    }

    /// Records an increment of `amount` for `key`.
    pub fn bump_by(&self, key: &str, amount: i64) -> Result<()> {
        validate_key(key)?;
        self.cache.bump(key, amount);
        Ok(())
    }

    /// Returns the effective total for `key`: the durable total plus any
    /// still-pending delta.
    ///
    /// The durable part comes from the warm cache when available and falls
    /// back to a read-through fetch (a missing row counts as zero). The
    /// value is not atomically consistent with a concurrent flush; call
    /// [`flush_now`](Self::flush_now) first when that matters.
    pub async fn total(&self, key: &str) -> Result<i64> {
        validate_key(key)?;
        let durable = match self.totals.get(key) {
            Some(total) => total,
            None => {
                // The fetched value may be stale by the time it arrives: a
                // flush for this key can complete during the round trip and
                // record a fresher total. Fill the slot only if it is still
                // empty and trust whatever is there now.
                let fetched = self.store.fetch_total(key).await?.unwrap_or(0);
                self.totals.record_if_absent(key, fetched)
            }
        };
        Ok(durable + self.cache.peek(key))
    }

    /// Returns the pending (not yet durable) delta for `key`.
    pub fn pending(&self, key: &str) -> i64 {
        self.cache.peek(key)
    }

    /// Primes the warm totals cache from the store for the given keys, so
    /// later [`total`](Self::total) calls skip the round trip.
    ///
    /// Cache warming only; skipping it costs one fetch per cold key.
    pub async fn load_from_store<I, S>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            let key = key.as_ref();
            validate_key(key)?;
            let total = self.store.fetch_total(key).await?.unwrap_or(0);
            // Keys the flusher has already recorded keep their fresher value.
            self.totals.record_if_absent(key, total);
        }
        Ok(())
    }

    /// Forces an immediate flush of every pending delta, ignoring the
    /// quiescence window.
    ///
    /// Deltas that fail to land stay in the cache, exactly as on a
    /// scheduled tick.
    pub async fn flush_now(&self) -> FlushOutcome {
        flush_once(
            &self.cache,
            &self.totals,
            self.store.as_ref(),
            std::time::Duration::ZERO,
            self.config.op_timeout,
        )
        .await
    }

    /// Forces an immediate flush of the pending delta for a single key.
    ///
    /// Unlike the scheduler path, a failure here is surfaced to the caller;
    /// the delta still stays in the cache for retry on a later tick.
    pub async fn flush_key(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        flush_key(
            &self.cache,
            &self.totals,
            self.store.as_ref(),
            key,
            self.config.op_timeout,
        )
        .await?;
        Ok(())
    }

    /// Gracefully stops the service: cancels the flush scheduler (which
    /// runs its final drain) and, if the scheduler was never started,
    /// drains directly.
    ///
    /// Idempotent; a second call only re-runs the direct drain.
    pub async fn shutdown(&self) {
        let handle = self.flusher.lock().expect("flusher slot poisoned").take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => {
                let _ = self.flush_now().await;
            }
        }
    }
}

impl std::fmt::Debug for CounterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterService")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//! Periodic flush scheduler.
//!
//! The scheduler is a single tokio task that wakes on a fixed interval,
//! selects the cache entries eligible for flushing, and drains each one
//! through [`DurableStore::increment`]. It is the only component that
//! performs blocking I/O, and it does so outside any lock that guards the
//! cache, so a slow or failing database call never stalls `bump` or reads.
//!
//! # Failure semantics
//!
//! A captured delta is never discarded. If the store call fails or exceeds
//! its per-operation timeout, the delta is merged back into the cache
//! (added, not stored, so increments that arrived mid-flush survive) and
//! retried on a later tick.
//!
//! # Non-overlap
//!
//! The scheduler drains keys sequentially within a tick and a tick runs to
//! completion before the next one starts ([`MissedTickBehavior::Delay`]),
//! so two flushes of the same key can never be in flight at once. Counters
//! for different keys are independent; no ordering between them is needed.
//!
//! # Shutdown
//!
//! [`FlusherHandle::shutdown`] cancels the loop through a watch channel.
//! The task performs one final drain of every key, ignoring the
//! quiescence window, before exiting, so no pending delta is stranded in
//! memory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::cache::{DurableTotals, PendingDeltas};
use crate::store::{DurableStore, StoreError};

/// Configuration for the flush scheduler.
///
/// # Examples
///
/// ```rust
/// use punteggi::flush::FlushConfig;
/// use std::time::Duration;
///
/// let config = FlushConfig::default()
///     .with_interval(Duration::from_secs(2))
///     .with_quiescence(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FlushConfig {
    /// Time between flush ticks.
    pub interval: Duration,
    /// Minimum idle time before a key becomes eligible for flushing.
    /// Zero means every non-empty entry is flushed each tick.
    pub quiescence: Duration,
    /// Deadline for a single store call; a timed-out flush is retried on a
    /// later tick, so one stalled key cannot stall the whole tick forever.
    pub op_timeout: Duration,
}

impl Default for FlushConfig {
    /// Five-second ticks, no quiescence window, three-second store deadline.
    fn default() -> Self {
        FlushConfig {
            interval: Duration::from_secs(5),
            quiescence: Duration::ZERO,
            op_timeout: Duration::from_secs(3),
        }
    }
}

impl FlushConfig {
    /// Sets the tick interval, returning `self` for method chaining.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the quiescence window, returning `self` for method chaining.
    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    /// Sets the per-operation store deadline, returning `self` for method
    /// chaining.
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }
}

/// What a single flush pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    /// Keys whose delta reached the store.
    pub keys_flushed: usize,
    /// Keys whose delta was merged back after a failure or timeout.
    pub keys_retained: usize,
}

/// Handle to a running flush scheduler.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) closes
/// the watch channel, which also stops the task after its final drain. The
/// difference is that `shutdown` waits for that drain to finish; a plain
/// drop lets it race the rest of the program.
#[derive(Debug)]
pub struct FlusherHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FlusherHandle {
    /// Stops the scheduler: cancels the loop, runs a final drain of every
    /// key, and waits for the task to finish.
    pub async fn shutdown(self) {
        // The receiver only disappears once the task has already exited,
        // in which case there is nothing left to cancel.
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            warn!(%err, "flusher task did not shut down cleanly");
        }
    }
}

/// Spawns the flush scheduler on the current tokio runtime.
///
/// Each tick drains every eligible key (per `config.quiescence`) into
/// `store`, recording the returned totals into `totals`. Must be called
/// from within a runtime.
pub fn spawn_flusher(
    cache: Arc<PendingDeltas>,
    totals: Arc<DurableTotals>,
    store: Arc<dyn DurableStore>,
    config: FlushConfig,
) -> FlusherHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a fresh interval completes immediately;
        // consume it so the first drain happens one full interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = flush_once(
                        &cache,
                        &totals,
                        store.as_ref(),
                        config.quiescence,
                        config.op_timeout,
                    )
                    .await;
                    if outcome.keys_flushed > 0 || outcome.keys_retained > 0 {
                        debug!(
                            flushed = outcome.keys_flushed,
                            retained = outcome.keys_retained,
                            "flush tick complete"
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    // Final drain: the quiescence window no longer applies.
                    let outcome = flush_once(
                        &cache,
                        &totals,
                        store.as_ref(),
                        Duration::ZERO,
                        config.op_timeout,
                    )
                    .await;
                    debug!(
                        flushed = outcome.keys_flushed,
                        retained = outcome.keys_retained,
                        "flusher stopped after final drain"
                    );
                    break;
                }
            }
        }
    });

    FlusherHandle { shutdown_tx, task }
}

/// Runs one flush pass over every eligible key.
///
/// For each key whose last bump is at least `quiescence` in the past, the
/// pending delta is captured and cleared atomically and, if non-zero,
/// forwarded to the store under `op_timeout`. A failed or timed-out call
/// merges the delta back for retry.
pub async fn flush_once(
    cache: &PendingDeltas,
    totals: &DurableTotals,
    store: &dyn DurableStore,
    quiescence: Duration,
    op_timeout: Duration,
) -> FlushOutcome {
    let mut outcome = FlushOutcome::default();

    for key in cache.touched_before(quiescence) {
        match flush_key(cache, totals, store, &key, op_timeout).await {
            Ok(Some(_)) => outcome.keys_flushed += 1,
            Ok(None) => {}
            Err(_) => outcome.keys_retained += 1,
        }
    }

    outcome
}

/// Flushes the pending delta of a single key.
///
/// The delta is captured and cleared atomically and, if non-zero, applied
/// to the store under `op_timeout`. Returns the new durable total, or
/// `None` when there was nothing to flush. A failed or timed-out call
/// merges the delta back and returns the store error.
pub async fn flush_key(
    cache: &PendingDeltas,
    totals: &DurableTotals,
    store: &dyn DurableStore,
    key: &str,
    op_timeout: Duration,
) -> Result<Option<i64>, StoreError> {
    let Some(delta) = cache.snapshot_and_clear(key) else {
        return Ok(None);
    };
    if delta == 0 {
        return Ok(None);
    }

    match timeout(op_timeout, store.increment(key, delta)).await {
        Ok(Ok(total)) => {
            totals.record(key, total);
            debug!(key = %key, delta, total, "flushed delta to durable store");
            Ok(Some(total))
        }
        Ok(Err(err)) => {
            cache.merge_back(key, delta);
            warn!(key = %key, delta, %err, "flush failed; delta retained for retry");
            Err(err)
        }
        Err(_) => {
            cache.merge_back(key, delta);
            warn!(key = %key, delta, "flush timed out; delta retained for retry");
            Err(StoreError::Timeout)
        }
    }
}

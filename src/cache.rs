//! In-memory state for the write-back cache.
//!
//! This module provides the two in-memory structures the crate is built
//! around:
//!
//! - [`PendingDeltas`] - the write-back side: per-key accumulated increments
//!   that have not yet reached durable storage.
//! - [`DurableTotals`] - the read-through side: a warm cache of the last
//!   durable total observed per key, refreshed by the flusher.
//!
//! # Design
//!
//! Each key owns a [`DeltaCell`]: an `AtomicI64` holding the pending delta
//! plus an atomic timestamp of the most recent increment. Cells are
//! cache-line padded so two hot keys never share a cache line, and the map
//! itself is only write-locked on first touch of a key. The steady-state
//! increment path is a read-locked lookup followed by a single `fetch_add`.
//!
//! ```text
//!   bump("u1") ──read lock──► cells["u1"].pending.fetch_add(1)
//!                             cells["u1"].last_touched = now
//!
//!   flusher    ──────────────► cells["u1"].pending.swap(0)   (snapshot)
//!                              │
//!                              ▼ on store failure
//!                              cells["u1"].pending.fetch_add(delta)  (merge back)
//! ```
//!
//! # Atomicity
//!
//! `snapshot_and_clear` is a single `swap(0)` on the per-key atomic, so any
//! increment racing the snapshot is either fully captured by it or fully
//! left for the next one, so an increment can never be lost. Cells are never
//! removed, so a merge-back after a failed flush always finds its cell.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use atomic_time::AtomicOptionInstant;
use crossbeam_utils::CachePadded;

/// Per-key accumulator: the pending delta and the time of the last bump.
///
/// The timestamp is `None` only for a cell that has never been bumped.
struct DeltaCell {
    pending: AtomicI64,
    last_touched: AtomicOptionInstant,
}

impl std::fmt::Debug for DeltaCell {
    /// Shows the pending delta; the raw timestamp is not meaningful output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaCell")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl DeltaCell {
    fn new() -> Self {
        DeltaCell {
            pending: AtomicI64::new(0),
            last_touched: AtomicOptionInstant::none(),
        }
    }
}

/// A keyed map of pending (not yet durable) increment deltas.
///
/// `PendingDeltas` absorbs high-frequency increments without any I/O and
/// hands them to the flush scheduler in atomic per-key snapshots. It is the
/// only shared mutable structure in the crate's hot path.
///
/// # Examples
///
/// Basic usage:
///
/// ```rust
/// use punteggi::cache::PendingDeltas;
///
/// let cache = PendingDeltas::new();
/// cache.bump("u1", 1);
/// cache.bump("u1", 2);
/// assert_eq!(cache.peek("u1"), 3);
///
/// // The flusher captures and clears the delta atomically.
/// assert_eq!(cache.snapshot_and_clear("u1"), Some(3));
/// assert_eq!(cache.peek("u1"), 0);
/// ```
///
/// Multi-threaded usage:
///
/// ```rust
/// use punteggi::cache::PendingDeltas;
/// use std::sync::Arc;
/// use std::thread;
///
/// let cache = Arc::new(PendingDeltas::new());
/// let mut handles = vec![];
///
/// for _ in 0..4 {
///     let c = Arc::clone(&cache);
///     handles.push(thread::spawn(move || {
///         for _ in 0..1000 {
///             c.bump("shared", 1);
///         }
///     }));
/// }
///
/// for h in handles {
///     h.join().unwrap();
/// }
///
/// assert_eq!(cache.peek("shared"), 4000);
/// ```
#[derive(Debug, Default)]
pub struct PendingDeltas {
    cells: RwLock<HashMap<String, Arc<CachePadded<DeltaCell>>>>,
}

impl PendingDeltas {
    /// Creates an empty cache.
    pub fn new() -> Self {
        PendingDeltas {
            cells: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cell for `key`, creating it on first touch.
    ///
    /// The write lock is only taken when the key has never been seen;
    /// afterwards every operation on the key goes through the read lock.
    fn cell(&self, key: &str) -> Arc<CachePadded<DeltaCell>> {
        if let Some(cell) = self.cells.read().expect("cache lock poisoned").get(key) {
            return Arc::clone(cell);
        }
        let mut cells = self.cells.write().expect("cache lock poisoned");
        Arc::clone(
            cells
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(CachePadded::new(DeltaCell::new()))),
        )
    }

    /// Adds `amount` to the pending delta for `key` and stamps the cell.
    ///
    /// Creates the cell (with a pending delta of zero) if the key has never
    /// been seen. Never fails and never blocks beyond lock acquisition.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use punteggi::cache::PendingDeltas;
    ///
    /// let cache = PendingDeltas::new();
    /// cache.bump("u1", 1);
    /// cache.bump("u1", 1);
    /// assert_eq!(cache.peek("u1"), 2);
    /// ```
    pub fn bump(&self, key: &str, amount: i64) {
        let cell = self.cell(key);
        cell.pending.fetch_add(amount, Ordering::Relaxed);
        cell.last_touched.store(Some(Instant::now()), Ordering::Relaxed);
    }

    /// Returns the current pending delta for `key` without clearing it.
    ///
    /// Returns `0` for a key that has never been bumped.
    pub fn peek(&self, key: &str) -> i64 {
        self.cells
            .read()
            .expect("cache lock poisoned")
            .get(key)
            .map(|cell| cell.pending.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Atomically captures and clears the pending delta for `key`.
    ///
    /// Returns `None` if the key has never been seen. The swap is atomic
    /// with respect to concurrent [`bump`](Self::bump) calls on the same
    /// key: a racing increment is either included in the returned delta or
    /// stays pending for the next snapshot, never both and never neither.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use punteggi::cache::PendingDeltas;
    ///
    /// let cache = PendingDeltas::new();
    /// assert_eq!(cache.snapshot_and_clear("ghost"), None);
    ///
    /// cache.bump("u1", 5);
    /// assert_eq!(cache.snapshot_and_clear("u1"), Some(5));
    /// assert_eq!(cache.snapshot_and_clear("u1"), Some(0));
    /// ```
    pub fn snapshot_and_clear(&self, key: &str) -> Option<i64> {
        let cell = {
            let cells = self.cells.read().expect("cache lock poisoned");
            Arc::clone(cells.get(key)?)
        };
        Some(cell.pending.swap(0, Ordering::Relaxed))
    }

    /// Adds a previously captured delta back into the pending count.
    ///
    /// Called after a failed or timed-out flush so the delta is retried on
    /// a later tick. The delta is *added*, not stored, so increments that
    /// arrived during the failed attempt are preserved. The last-touched
    /// timestamp is left alone; a quiescence window must not postpone the
    /// retry of an already-captured delta.
    pub fn merge_back(&self, key: &str, delta: i64) {
        self.cell(key).pending.fetch_add(delta, Ordering::Relaxed);
    }

    /// Returns the keys whose pending delta is non-zero and whose last
    /// bump is at least `quiescence` in the past.
    ///
    /// A zero window selects every key with a non-zero delta. A cell whose
    /// delta was merged back keeps its old timestamp and therefore stays
    /// eligible.
    pub fn touched_before(&self, quiescence: Duration) -> Vec<String> {
        let now = Instant::now();
        self.cells
            .read()
            .expect("cache lock poisoned")
            .iter()
            .filter(|(_, cell)| cell.pending.load(Ordering::Relaxed) != 0)
            .filter(|(_, cell)| match cell.last_touched.load(Ordering::Relaxed) {
                Some(touched) => now.duration_since(touched) >= quiescence,
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns `(key, pending, idle)` for every key with a non-zero delta,
    /// where `idle` is the time since the last bump.
    pub fn pending_entries(&self) -> Vec<(String, i64, Duration)> {
        let now = Instant::now();
        self.cells
            .read()
            .expect("cache lock poisoned")
            .iter()
            .filter_map(|(key, cell)| {
                let pending = cell.pending.load(Ordering::Relaxed);
                if pending == 0 {
                    return None;
                }
                let idle = cell
                    .last_touched
                    .load(Ordering::Relaxed)
                    .map(|touched| now.duration_since(touched))
                    .unwrap_or(Duration::ZERO);
                Some((key.clone(), pending, idle))
            })
            .collect()
    }

    /// Number of keys ever seen (cells are never removed).
    pub fn len(&self) -> usize {
        self.cells.read().expect("cache lock poisoned").len()
    }

    /// Returns `true` if no key has ever been bumped.
    pub fn is_empty(&self) -> bool {
        self.cells.read().expect("cache lock poisoned").is_empty()
    }
}

/// Warm cache of the last durable total observed per key.
///
/// `DurableTotals` keeps `total()` cheap: the flusher records the new total
/// the store returns after every successful flush, and the service fills in
/// misses with a read-through fetch. Values here are advisory (durable
/// truth lives in the store) but they only go stale by one in-flight flush
/// window.
#[derive(Debug, Default)]
pub struct DurableTotals {
    totals: RwLock<HashMap<String, i64>>,
}

impl DurableTotals {
    /// Creates an empty warm cache.
    pub fn new() -> Self {
        DurableTotals {
            totals: RwLock::new(HashMap::new()),
        }
    }

    /// Records the durable total for `key`.
    ///
    /// For the flusher, which holds the fresh total the store just
    /// returned. Read-through fills use
    /// [`record_if_absent`](Self::record_if_absent) instead.
    pub fn record(&self, key: &str, total: i64) {
        self.totals
            .write()
            .expect("totals lock poisoned")
            .insert(key.to_owned(), total);
    }

    /// Records `total` only if no total is recorded for `key` yet, and
    /// returns the value now in the cache.
    ///
    /// A read-through fetch can be stale by the time it lands: a flush for
    /// the same key may have completed (and recorded its fresh total)
    /// between the fetch and this call. Inserting under the write lock
    /// only when the slot is still empty keeps the fresher value.
    pub fn record_if_absent(&self, key: &str, total: i64) -> i64 {
        *self
            .totals
            .write()
            .expect("totals lock poisoned")
            .entry(key.to_owned())
            .or_insert(total)
    }

    /// Returns the last recorded durable total for `key`, if any.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.totals
            .read()
            .expect("totals lock poisoned")
            .get(key)
            .copied()
    }

    /// Number of keys with a recorded total.
    pub fn len(&self) -> usize {
        self.totals.read().expect("totals lock poisoned").len()
    }

    /// Returns `true` if no total has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.totals.read().expect("totals lock poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_is_empty() {
        let cache = PendingDeltas::new();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.peek("u1"), 0);
    }

    #[test]
    fn test_bump_accumulates() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 1);
        cache.bump("u1", 1);
        cache.bump("u1", 3);
        assert_eq!(cache.peek("u1"), 5);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_bump_keys_are_independent() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 2);
        cache.bump("u2", 7);
        assert_eq!(cache.peek("u1"), 2);
        assert_eq!(cache.peek("u2"), 7);
    }

    #[test]
    fn test_snapshot_resets_to_zero() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 4);
        assert_eq!(cache.snapshot_and_clear("u1"), Some(4));
        // Reset goes to zero, not to the captured value or an increment.
        assert_eq!(cache.peek("u1"), 0);
        assert_eq!(cache.snapshot_and_clear("u1"), Some(0));
    }

    #[test]
    fn test_snapshot_absent_key() {
        let cache = PendingDeltas::new();
        assert_eq!(cache.snapshot_and_clear("ghost"), None);
        // A failed snapshot must not create the cell.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_merge_back_preserves_new_bumps() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 3);
        let captured = cache.snapshot_and_clear("u1").unwrap();
        assert_eq!(captured, 3);

        // Increments arrive while the (failing) flush is in flight.
        cache.bump("u1", 2);
        cache.merge_back("u1", captured);
        assert_eq!(cache.peek("u1"), 5);
    }

    #[test]
    fn test_concurrent_bumps_not_lost() {
        let cache = Arc::new(PendingDeltas::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let c = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    c.bump("hot", 1);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cache.peek("hot"), 80_000);
    }

    #[test]
    fn test_concurrent_snapshot_and_bump_no_lost_updates() {
        let cache = Arc::new(PendingDeltas::new());
        let collector = Arc::clone(&cache);

        let snapshotter = thread::spawn(move || {
            let mut collected = 0i64;
            for _ in 0..1000 {
                if let Some(delta) = collector.snapshot_and_clear("hot") {
                    collected += delta;
                }
            }
            collected
        });

        let mut bumpers = vec![];
        for _ in 0..4 {
            let c = Arc::clone(&cache);
            bumpers.push(thread::spawn(move || {
                for _ in 0..5_000 {
                    c.bump("hot", 1);
                }
            }));
        }

        for h in bumpers {
            h.join().unwrap();
        }
        let collected = snapshotter.join().unwrap();

        // Every bump ends up exactly once: either in a snapshot or still pending.
        assert_eq!(collected + cache.peek("hot"), 20_000);
    }

    #[test]
    fn test_touched_before_zero_window() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 1);
        cache.bump("u2", 1);
        let mut keys = cache.touched_before(Duration::ZERO);
        keys.sort();
        assert_eq!(keys, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[test]
    fn test_touched_before_skips_zero_deltas() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 1);
        cache.snapshot_and_clear("u1");
        assert!(cache.touched_before(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_touched_before_respects_quiescence() {
        let cache = PendingDeltas::new();
        cache.bump("busy", 1);
        // A key bumped a moment ago is not eligible under a long window.
        assert!(cache.touched_before(Duration::from_secs(3600)).is_empty());
        assert_eq!(cache.touched_before(Duration::ZERO).len(), 1);
    }

    #[test]
    fn test_merge_back_keeps_key_eligible() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 2);
        let delta = cache.snapshot_and_clear("u1").unwrap();
        thread::sleep(Duration::from_millis(5));
        cache.merge_back("u1", delta);
        // The old timestamp survives the merge-back, so a window shorter
        // than the elapsed time still selects the key for retry.
        assert_eq!(cache.touched_before(Duration::from_millis(5)).len(), 1);
    }

    #[test]
    fn test_pending_entries() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 3);
        cache.bump("u2", 1);
        cache.snapshot_and_clear("u2");

        let entries = cache.pending_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "u1");
        assert_eq!(entries[0].1, 3);
    }

    #[test]
    fn test_durable_totals_record_and_get() {
        let totals = DurableTotals::new();
        assert!(totals.is_empty());
        assert_eq!(totals.get("u1"), None);

        totals.record("u1", 42);
        assert_eq!(totals.get("u1"), Some(42));

        totals.record("u1", 45);
        assert_eq!(totals.get("u1"), Some(45));
        assert_eq!(totals.len(), 1);
    }

    #[test]
    fn test_durable_totals_record_if_absent() {
        let totals = DurableTotals::new();
        assert_eq!(totals.record_if_absent("u1", 5), 5);
        assert_eq!(totals.get("u1"), Some(5));

        // A total recorded by a flush wins over a later, staler fill.
        assert_eq!(totals.record_if_absent("u1", 0), 5);
        assert_eq!(totals.get("u1"), Some(5));
    }
}

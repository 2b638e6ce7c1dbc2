//! Snapshot types for serializing cache state.
//!
//! This module provides a serializable view of the write-back cache for
//! diagnostics: which keys hold un-flushed deltas, how large they are and
//! how long they have been idle. Useful for dumping state on shutdown, in
//! a debug endpoint, or in logs when investigating a store outage.
//!
//! A snapshot is an observation, not a drain: taking one does not clear
//! any pending delta.
//!
//! # Feature Flag
//!
//! This module requires the `serde` feature:
//!
//! ```toml
//! [dependencies]
//! punteggi = { version = "0.1", features = ["serde"] }
//! ```
//!
//! # Examples
//!
//! ```rust,ignore
//! use punteggi::cache::PendingDeltas;
//! use punteggi::snapshot::CacheSnapshot;
//!
//! let cache = PendingDeltas::new();
//! cache.bump("u1", 3);
//!
//! let snapshot = CacheSnapshot::of(&cache);
//! let json = serde_json::to_string_pretty(&snapshot)?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::PendingDeltas;

/// A snapshot of one key's pending state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    /// The counter key.
    pub key: String,
    /// The delta accumulated since the last successful flush.
    pub pending: i64,
    /// Time since the most recent bump of this key.
    pub idle: Duration,
}

/// A snapshot of every key with a non-zero pending delta.
///
/// Entries are sorted by key so repeated snapshots diff cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheSnapshot {
    /// Per-key pending state.
    pub entries: Vec<PendingSnapshot>,
}

impl CacheSnapshot {
    /// Captures the current pending state of `cache`.
    pub fn of(cache: &PendingDeltas) -> Self {
        let mut entries: Vec<PendingSnapshot> = cache
            .pending_entries()
            .into_iter()
            .map(|(key, pending, idle)| PendingSnapshot { key, pending, idle })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        CacheSnapshot { entries }
    }

    /// Sum of all pending deltas in the snapshot.
    pub fn total_pending(&self) -> i64 {
        self.entries.iter().map(|entry| entry.pending).sum()
    }

    /// Returns `true` if nothing is waiting to be flushed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_of_empty_cache() {
        let cache = PendingDeltas::new();
        let snapshot = CacheSnapshot::of(&cache);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.total_pending(), 0);
    }

    #[test]
    fn test_snapshot_sorted_by_key() {
        let cache = PendingDeltas::new();
        cache.bump("zz", 1);
        cache.bump("aa", 2);
        cache.bump("mm", 3);

        let snapshot = CacheSnapshot::of(&cache);
        let keys: Vec<&str> = snapshot.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["aa", "mm", "zz"]);
        assert_eq!(snapshot.total_pending(), 6);
    }

    #[test]
    fn test_snapshot_skips_flushed_keys() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 1);
        cache.bump("u2", 2);
        cache.snapshot_and_clear("u1");

        let snapshot = CacheSnapshot::of(&cache);
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].key, "u2");
    }

    #[test]
    fn test_snapshot_does_not_drain() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 5);
        let _ = CacheSnapshot::of(&cache);
        assert_eq!(cache.peek("u1"), 5);
    }

    #[test]
    fn test_json_round_trip() {
        let cache = PendingDeltas::new();
        cache.bump("u1", 3);

        let snapshot = CacheSnapshot::of(&cache);
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: CacheSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}

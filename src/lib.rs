//! # Punteggi - Write-Back Counter Cache with Durable Reconciliation
//!
//! A Rust library for crediting points to keys (users, accounts) at high
//! event rates while keeping the totals in a relational store. It
//! implements a **write-back counter cache**: increments are absorbed in
//! memory with no I/O on the hot path and periodically reconciled into
//! durable storage, trading write amplification for latency with an
//! explicit eventual-durability contract.
//!
//! ## The Problem
//!
//! The obvious way to credit a user with points is one database round trip
//! per event: read the row, add one, write it back. Under a burst of
//! interaction events this amplifies every button press into a durable
//! write, the database becomes the bottleneck, and the read-modify-write
//! cycle invites lost updates the moment two events race.
//!
//! ## The Solution: Write-Back Caching
//!
//! This library keeps a per-key **pending delta** in memory. An event is a
//! single atomic `fetch_add`, with no I/O and no contention across keys. A
//! background scheduler periodically captures each delta with an atomic
//! snapshot-and-clear and applies it to the store through one atomic
//! accumulate-upsert (`total = total + delta`). A failed or timed-out
//! flush merges the captured delta back for retry on a later tick.
//!
//! ```text
//!   event ──► CounterService::bump ──► PendingDeltas      (fast path, no I/O)
//!                                          │
//!                          [every tick]    ▼
//!                            flusher  snapshot_and_clear
//!                                          │
//!                                          ▼          on failure
//!                            DurableStore::increment ──────────► merge_back
//!                                          │
//!                                          ▼
//!                                    durable total
//!
//!   CounterService::total = durable total + pending delta
//! ```
//!
//! ### Design Principles
//!
//! 1. **No lost updates**: the snapshot is an atomic `swap(0)` on the
//!    per-key accumulator, so an increment racing a flush is either fully
//!    captured or fully left pending, never dropped and never doubled.
//!
//! 2. **Accumulate, never overwrite**: the store upsert adds the delta to
//!    the existing total on conflict. Overwriting the stored total with
//!    the delta discards history and is rejected by this crate's tests.
//!
//! 3. **Failures retain data**: a flush that errors or exceeds its
//!    deadline merges its delta back into the cache (added, not stored, so
//!    mid-flight increments survive) and retries on a later tick.
//!
//! 4. **I/O never blocks the hot path**: only the flush scheduler talks to
//!    the store, outside any lock that guards the cache. `bump` is a
//!    read-locked lookup plus one `fetch_add` on a cache-line-padded cell.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use punteggi::flush::FlushConfig;
//! use punteggi::service::CounterService;
//! use punteggi::store::MemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> punteggi::Result<()> {
//!     let service = CounterService::new(Arc::new(MemoryStore::new()))
//!         .with_flush(FlushConfig::default().with_interval(Duration::from_secs(5)));
//!     service.start();
//!
//!     // One call per interaction event. Never blocks on the database.
//!     service.bump("u1")?;
//!     service.bump("u1")?;
//!
//!     // Durable total + pending delta.
//!     assert_eq!(service.total("u1").await?, 2);
//!
//!     // Drain everything before exit.
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Pending-delta cache and warm durable totals |
//! | [`flush`] | Periodic flush scheduler with retry and graceful drain |
//! | [`store`] | Durable store trait, in-memory store, SQLite adapter |
//! | [`service`] | The `CounterService` façade |
//! | [`error`] | Unified error type |
//! | `snapshot` | Serializable cache snapshots (feature `serde`) |
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `serde` | Serializable snapshot module |
//! | `sqlite` | SQLite store adapter via `sqlx` |
//! | `full` | All of the above |
//!
//! ## Consistency Model
//!
//! Increments always succeed immediately from the caller's point of view
//! and become durable eventually (at-least-once into the cache, exactly
//! once into the store). `total` is not atomically consistent with a
//! concurrent flush: it can be off by at most one in-flight delta window.
//! Callers that need the durable row current first force a flush with
//! [`service::CounterService::flush_now`].
//!
//! ## When to Use
//!
//! Use this crate when:
//! - Increment events vastly outnumber reads of the durable total
//! - Losing a counter increment is unacceptable, but durability may lag
//!   by a few seconds
//! - One durable write per event is more load than the store should take
//!
//! For low event rates, or when every increment must be durable before the
//! caller proceeds, write straight to the store instead.

pub mod cache;
pub mod error;
pub mod flush;
pub mod service;
pub mod store;

#[cfg(feature = "serde")]
pub mod snapshot;

pub use error::{CounterError, Result};

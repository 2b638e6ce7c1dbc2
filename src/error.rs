//! Unified error type for the counter service.
//!
//! The increment path is deliberately almost infallible:
//! [`CounterService::bump`] can only fail on a malformed key, never on a
//! durability problem, because durability errors stay inside the flush
//! scheduler, which retries them. Reads can additionally surface a store
//! error when a read-through fetch fails.
//!
//! [`CounterService::bump`]: crate::service::CounterService::bump

use thiserror::Error;

use crate::store::StoreError;

/// Unified error type for counter-service operations.
#[derive(Debug, Error)]
pub enum CounterError {
    /// A key that cannot be represented in storage (empty, too long, or
    /// containing characters outside the allowed set).
    ///
    /// Surfaced immediately to the caller of `bump`/`total`; the counter
    /// is never silently discarded.
    #[error("malformed key {key:?}: {reason}")]
    MalformedKey {
        /// The offending key, as supplied by the caller.
        key: String,
        /// Why the key was rejected.
        reason: &'static str,
    },

    /// Error from the durable store, surfaced on the read path.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for counter-service operations.
pub type Result<T> = std::result::Result<T, CounterError>;

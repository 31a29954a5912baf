//! Shared counter store abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Default prefix for every key written to a shared store.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:";

/// Errors returned by a counter store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key does not exist or has expired
    #[error("key not found: {0}")]
    NotFound(String),

    /// The backend could not be reached or rejected the command
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// An expiring key-value store shared by every server process.
///
/// Both primitives must be atomic per key. Counts are never deleted
/// explicitly; they disappear when their expiry passes.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Insert `key -> initial` with the given time to live, only if the key
    /// is absent. Returns whether the insert happened.
    async fn try_insert(&self, key: &str, initial: u64, ttl: Duration) -> Result<bool, StoreError>;

    /// Increment an existing key and return the new value.
    ///
    /// Fails with [`StoreError::NotFound`] when the key is absent or expired.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Read the current value of a key.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn try_insert(&self, key: &str, initial: u64, ttl: Duration) -> Result<bool, StoreError> {
        (**self).try_insert(key, initial, ttl).await
    }

    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        (**self).increment(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        (**self).get(key).await
    }
}

//! Call counting against the shared store.

use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::backend::{CounterStore, StoreError};

/// Extra lifetime given to every record beyond its window, in seconds.
///
/// Covers stores that evict slightly early and small clock skew between
/// server instances.
pub const DEFAULT_EXPIRY_SLACK_SECS: u64 = 3;

/// Records calls for cache keys in a shared [`CounterStore`].
///
/// Nothing is cached locally; every call reads and writes the store.
#[derive(Clone)]
pub struct CallCounter {
    store: Arc<dyn CounterStore>,
    slack: Duration,
}

impl CallCounter {
    /// Create a counter with the default expiry slack.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_slack(store, Duration::from_secs(DEFAULT_EXPIRY_SLACK_SECS))
    }

    /// Create a counter with a custom expiry slack.
    pub fn with_slack(store: Arc<dyn CounterStore>, slack: Duration) -> Self {
        Self { store, slack }
    }

    /// The store this counter writes to.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// How long a record outlives its window.
    pub fn slack(&self) -> Duration {
        self.slack
    }

    /// Record one call for `key` and return the number of calls so far.
    ///
    /// The first call of a window creates the record. If the record vanishes
    /// between the insert attempt and the increment, or the store fails,
    /// the call counts as the first one. Counts can therefore run low at a
    /// window edge or during a store outage, never high.
    pub async fn record(&self, key: &str, time_period: NonZeroU64) -> u64 {
        let ttl = Duration::from_secs(time_period.get()) + self.slack;

        match self.store.try_insert(key, 1, ttl).await {
            Ok(true) => {
                trace!(key = %key, "First call in window");
                return 1;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to record call, treating as first call");
                return 1;
            }
        }

        match self.store.increment(key).await {
            Ok(count) => {
                trace!(key = %key, count, "Recorded call");
                count
            }
            Err(StoreError::NotFound(_)) => {
                debug!(key = %key, "Record expired before increment, treating as first call");
                1
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Failed to increment call count, treating as first call"
                );
                1
            }
        }
    }
}

//! Process-local counter store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::{CounterStore, StoreError};
use super::window::{Clock, SystemClock};

/// A stored count and the Unix second at which it expires.
#[derive(Debug, Clone, Copy)]
struct Record {
    count: u64,
    expires_at: u64,
}

impl Record {
    fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// In-memory counter store.
///
/// Counts are shared by every task of one process only. Expiry follows the
/// injected clock. Expired entries are dropped on access, and inserts sweep
/// the whole map at most once per clock second, so keys from past windows
/// do not accumulate.
pub struct MemoryStore {
    records: DashMap<String, Record>,
    clock: Arc<dyn Clock>,
    /// Clock second of the last sweep
    last_sweep: AtomicU64,
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every expired key and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.records.len())
    }

    /// Sweep expired keys unless a sweep already ran this second.
    fn sweep(&self, now: u64) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now <= last
            || self
                .last_sweep
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            return;
        }

        let removed = self.purge_expired();
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Swept expired counters");
        }
    }

    /// Remove all keys.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.records.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn try_insert(&self, key: &str, initial: u64, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        // Must run before taking the entry lock below.
        self.sweep(now);

        let record = Record {
            count: initial,
            expires_at: now.saturating_add(ttl.as_secs()),
        };

        let inserted = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(record);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                true
            }
        };

        trace!(key = %key, inserted, "Memory store insert");
        Ok(inserted)
    }

    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();

        match self.records.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                occupied.remove();
                Err(StoreError::NotFound(key.to_string()))
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.count = record.count.saturating_add(1);
                Ok(record.count)
            }
            Entry::Vacant(_) => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::window::ManualClock;

    fn store_at(now: u64) -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(now);
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_insert_only_if_absent() {
        let (store, _clock) = store_at(100);

        assert!(store.try_insert("key", 1, Duration::from_secs(10)).await.unwrap());
        assert!(!store.try_insert("key", 1, Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("key").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_increment_existing() {
        let (store, _clock) = store_at(100);

        store.try_insert("key", 1, Duration::from_secs(10)).await.unwrap();

        assert_eq!(store.increment("key").await.unwrap(), 2);
        assert_eq!(store.increment("key").await.unwrap(), 3);
        assert_eq!(store.get("key").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_increment_missing_key() {
        let (store, _clock) = store_at(100);

        let err = store.increment("missing").await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn test_expired_key_behaves_as_absent() {
        let (store, clock) = store_at(100);
        store.try_insert("key", 1, Duration::from_secs(10)).await.unwrap();

        clock.set(110);

        assert_eq!(store.get("key").await.unwrap(), None);
        assert!(matches!(store.increment("key").await, Err(StoreError::NotFound(_))));
        assert!(store.try_insert("key", 1, Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("key").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_at(100);
        store.try_insert("short", 1, Duration::from_secs(5)).await.unwrap();
        store.try_insert("long", 1, Duration::from_secs(50)).await.unwrap();

        clock.advance(10);

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_past_windows_are_swept_on_insert() {
        let (store, clock) = store_at(1_000);

        // One key per one-second window, living window + 3s slack.
        for window in 0..1_000u64 {
            let key = format!("window-{}", window);
            store.try_insert(&key, 1, Duration::from_secs(4)).await.unwrap();
            clock.advance(1);
        }

        assert!(store.len() <= 5, "expired records retained: {}", store.len());
    }

    #[tokio::test]
    async fn test_sweep_runs_once_per_second() {
        let (store, clock) = store_at(100);
        store.try_insert("a", 1, Duration::from_secs(1)).await.unwrap();
        clock.advance(1);

        // The first insert of this second sweeps "a"; later ones do not rescan.
        store.try_insert("b", 1, Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.len(), 1);
        store.try_insert("c", 1, Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_exact() {
        let (store, _clock) = store_at(100);
        let store = Arc::new(store);
        store.try_insert("key", 1, Duration::from_secs(60)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.increment("key").await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("key").await.unwrap(), Some(801));
    }
}

//! Redis-backed counter store.
//!
//! Lets every server instance share one set of counters. Records are plain
//! Redis integers with a native expiry, so Redis evicts them on its own.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, info};

use super::backend::{CounterStore, StoreError, DEFAULT_KEY_PREFIX};

/// Increment a key only if it still exists; returns nil otherwise.
const INCREMENT_EXISTING_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 1 then
        return redis.call('INCR', KEYS[1])
    end
    return false
"#;

/// Counter store on a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
    increment: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with the default key prefix.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_prefix(url, DEFAULT_KEY_PREFIX).await
    }

    /// Connect with a custom key prefix.
    pub async fn connect_with_prefix(url: &str, key_prefix: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!(key_prefix = %key_prefix, "Connected to Redis counter store");
        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            increment: Script::new(INCREMENT_EXISTING_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn try_insert(&self, key: &str, initial: u64, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        // EX must be at least one second.
        let ttl_secs = ttl.as_secs().max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(initial)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(reply.is_some())
    }

    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();

        let count: Option<u64> = self
            .increment
            .key(self.key(key))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        count.ok_or_else(|| {
            debug!(key = %key, "Redis key expired before increment");
            StoreError::NotFound(key.to_string())
        })
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection.clone();

        redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }
}

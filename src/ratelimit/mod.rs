//! Fixed-window rate limiting over a shared counter store.

mod backend;
mod counter;
mod fingerprint;
mod limiter;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod rules;
mod window;

pub use backend::{CounterStore, StoreError, DEFAULT_KEY_PREFIX};
pub use counter::{CallCounter, DEFAULT_EXPIRY_SLACK_SECS};
pub use fingerprint::{cache_key, resolve_values, KeyExtractor, KeySpec};
pub use limiter::{Evaluation, RateLimited, RateLimiter};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use rules::{RateLimitConfig, RateLimitRule, RuleConfig};
pub use window::{current_window_end, Clock, ManualClock, SystemClock};

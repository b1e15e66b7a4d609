//! Aggregate cache contract.
//!
//! The cache maps a counter's cache key to its last computed total. It is
//! never authoritative: entries expire, may be evicted at any time, and a
//! failing cache is treated exactly like an empty one.
//!
//! Two operations matter to the engine:
//!
//! - [`set`](AggregateCache::set) after a full scan, with a TTL;
//! - [`increment_if_present`](AggregateCache::increment_if_present) after a
//!   committed increment. It must not create an entry: a lone delta stored as
//!   a total would hide the real accumulated value until the entry expires.

mod memory;

pub use memory::{MemoryCache, NoCache};

use std::time::Duration;

use crate::error::CacheError;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// A fast, time-expiring `key → total` cache.
pub trait AggregateCache: Send + Sync {
    /// Returns the cached total, or `None` on a miss.
    fn get(&self, key: &str) -> CacheResult<Option<i64>>;

    /// Stores `value` under `key` for `ttl`.
    fn set(&self, key: &str, value: i64, ttl: Duration) -> CacheResult<()>;

    /// Adds `delta` to an existing entry and returns the new total.
    ///
    /// Returns `Ok(None)` and changes nothing when the key is absent.
    fn increment_if_present(&self, key: &str, delta: i64) -> CacheResult<Option<i64>>;
}

/// Builds the cache key of `counter`.
///
/// ```rust
/// use shardtally::cache::cache_key;
///
/// assert_eq!(cache_key("GeneralCounterShard", "hits"), "GeneralCounterShard:hits");
/// ```
pub fn cache_key(prefix: &str, counter: &str) -> String {
    let mut key = String::with_capacity(prefix.len() + counter.len() + 1);
    key.push_str(prefix);
    key.push(':');
    key.push_str(counter);
    key
}

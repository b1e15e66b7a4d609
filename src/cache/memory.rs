//! In-process cache backends.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::cache::{AggregateCache, CacheResult};
use crate::error::CacheError;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Instant,
}

impl Entry {
    #[inline]
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// TTL-expiring in-memory [`AggregateCache`].
///
/// Expired entries read as misses and are dropped lazily on access.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use shardtally::cache::{AggregateCache, MemoryCache};
///
/// let cache = MemoryCache::new();
/// assert_eq!(cache.increment_if_present("k", 5).unwrap(), None);
///
/// cache.set("k", 10, Duration::from_secs(60)).unwrap();
/// assert_eq!(cache.increment_if_present("k", 5).unwrap(), Some(15));
/// assert_eq!(cache.get("k").unwrap(), Some(15));
/// ```
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    available: AtomicBool,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an unreachable cache: while `false` every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Drops the entry for `key`.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory cache disabled".into()))
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.len())
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl AggregateCache for MemoryCache {
    fn get(&self, key: &str) -> CacheResult<Option<i64>> {
        self.ensure_available()?;
        let now = Instant::now();
        let hit = self.entries.get(key).map(|e| *e);
        match hit {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value)),
            Some(_) => {
                self.entries.remove_if(key, |_, e| !e.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: i64, ttl: Duration) -> CacheResult<()> {
        self.ensure_available()?;
        let expires_at = Instant::now() + ttl;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn increment_if_present(&self, key: &str, delta: i64) -> CacheResult<Option<i64>> {
        self.ensure_available()?;
        let now = Instant::now();
        let bumped = match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => match entry.value.checked_add(delta) {
                Some(total) => {
                    entry.value = total;
                    Some(total)
                }
                None => None,
            },
            _ => None,
        };
        if bumped.is_none() {
            // Expired, or a total the cache can no longer represent.
            self.entries
                .remove_if(key, |_, e| !e.is_live(now) || e.value.checked_add(delta).is_none());
        }
        Ok(bumped)
    }
}

/// A disabled cache: every lookup misses and writes are discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl AggregateCache for NoCache {
    fn get(&self, _key: &str) -> CacheResult<Option<i64>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: i64, _ttl: Duration) -> CacheResult<()> {
        Ok(())
    }

    fn increment_if_present(&self, _key: &str, _delta: i64) -> CacheResult<Option<i64>> {
        Ok(None)
    }
}

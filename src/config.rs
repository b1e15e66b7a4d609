//! Engine and retry configuration.
//!
//! Both types follow the builder style used throughout the crate: start from
//! [`Default`] and chain `with_*` calls. With the `serde` feature they can
//! also be loaded from any serde format; missing fields take their defaults.

use std::time::Duration;

use rand::Rng;

use crate::context::Context;
use crate::error::{Error, Result};

/// Fanout used for a counter that has never been widened.
pub const DEFAULT_SHARDS: u32 = 20;

/// Upper bound accepted by `increase_shards` unless configured otherwise.
pub const DEFAULT_MAX_SHARDS: u32 = 10_000;

/// Lifetime of a cached aggregate.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Prefix of aggregate cache keys.
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "GeneralCounterShard";

/// Configuration for a [`CounterEngine`](crate::engine::CounterEngine).
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use shardtally::config::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_default_shards(32)
///     .with_cache_ttl(Duration::from_secs(10));
///
/// assert_eq!(config.default_shards, 32);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct EngineConfig {
    /// Fanout of counters without a stored config record.
    pub default_shards: u32,
    /// Largest fanout `increase_shards` accepts.
    pub max_shards: u32,
    /// TTL of aggregates written to the cache after a scan.
    pub cache_ttl: Duration,
    /// Cache keys are `"<prefix>:<counter>"`.
    pub cache_key_prefix: String,
    /// Expiry of memoized config records; `None` relies on explicit forget.
    pub memo_ttl: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_shards: DEFAULT_SHARDS,
            max_shards: DEFAULT_MAX_SHARDS,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
            memo_ttl: Some(Duration::from_secs(60)),
        }
    }
}

impl EngineConfig {
    /// Sets the default fanout.
    pub fn with_default_shards(mut self, shards: u32) -> Self {
        self.default_shards = shards;
        self
    }

    /// Sets the largest accepted fanout.
    pub fn with_max_shards(mut self, shards: u32) -> Self {
        self.max_shards = shards;
        self
    }

    /// Sets the aggregate cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the cache key prefix.
    pub fn with_cache_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_key_prefix = prefix.into();
        self
    }

    /// Sets the config memo TTL.
    pub fn with_memo_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.memo_ttl = ttl;
        self
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.default_shards == 0 {
            return Err(Error::InvalidArgument(
                "default_shards must be at least 1".into(),
            ));
        }
        if self.max_shards < self.default_shards {
            return Err(Error::InvalidArgument(format!(
                "max_shards ({}) is below default_shards ({})",
                self.max_shards, self.default_shards
            )));
        }
        if self.cache_key_prefix.is_empty() {
            return Err(Error::InvalidArgument(
                "cache_key_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Retry budget for optimistic transactions.
///
/// Backoff grows exponentially from `initial_backoff` up to `max_backoff`,
/// each sleep drawn uniformly from `[delay / 2, delay]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first conflict.
    pub initial_backoff: Duration,
    /// Cap on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the attempt budget; values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Upper bound of the delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Sleeps a jittered delay for `attempt`, bounded by the context deadline.
    pub(crate) fn backoff(&self, ctx: &Context, attempt: u32) -> Result<()> {
        let ceiling = self.delay_for(attempt);
        if ceiling.is_zero() {
            return ctx.check();
        }
        let floor = ceiling / 2;
        let nap = rand::thread_rng().gen_range(floor..=ceiling);
        ctx.sleep(nap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_shards, 20);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.cache_key_prefix, "GeneralCounterShard");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_default() {
        let config = EngineConfig::default().with_default_shards(0);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_rejects_max_below_default() {
        let config = EngineConfig::default()
            .with_default_shards(50)
            .with_max_shards(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_prefix() {
        let config = EngineConfig::default().with_cache_key_prefix("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(2), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8));
        assert_eq!(policy.delay_for(4), Duration::from_millis(10));
        assert_eq!(policy.delay_for(40), Duration::from_millis(10));
    }

    #[test]
    fn test_max_attempts_floor() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_deserialize_partial_config() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"default_shards": 8}"#).unwrap();
        assert_eq!(config.default_shards, 8);
        assert_eq!(config.max_shards, DEFAULT_MAX_SHARDS);
    }
}

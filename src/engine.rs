//! The counter engine: routing, aggregation and cache maintenance.
//!
//! [`CounterEngine`] turns a named counter into many shard records plus a
//! cached sum:
//!
//! ```text
//!   increment_by(name, d)                      count(name)
//!        │                                         │
//!        ▼                                         ▼
//!   ConfigMemo ──► fanout N                AggregateCache ──hit──► total
//!        │                                         │ miss
//!        ▼                                         ▼
//!   ShardRouter ──► shard k < N            ShardStore.scan(name)
//!        │                                         │ Σ every shard
//!        ▼                                         ▼
//!   ShardStore txn: shard k += d           AggregateCache.set(total, ttl)
//!        │ committed
//!        ▼
//!   AggregateCache.increment_if_present(d)
//! ```
//!
//! # Consistency
//!
//! - Writes to different shards never conflict. Only increments racing on
//!   the same shard retry, inside the store's transaction.
//! - `count` is not a snapshot across shards; each shard contributes some
//!   prefix of its own increments.
//! - Cached totals may lag by up to the cache TTL. An increment that commits
//!   between a scan and the cache write it feeds is missing from the cached
//!   total until the entry expires; a forced scan is always exact.
//! - A stale fanout in the memo only narrows where writes go. The scan sums
//!   every shard ever written, so totals stay correct.

use std::fmt::{self, Debug};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::cache::{cache_key, AggregateCache, MemoryCache};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::memo::ConfigMemo;
use crate::router::{ShardRouter, UniformRouter};
use crate::snapshot::{current_timestamp_ms, CounterSnapshot, MetricsSnapshot};
use crate::store::memory::{MemoryConfigStore, MemoryShardStore};
use crate::store::{ConfigStore, ConfigTxn, CounterConfig, Lookup, ShardKey, ShardStore, ShardTxn};

/// Forgets a memo entry when dropped, on every exit path.
struct ForgetOnDrop<'a> {
    memo: &'a ConfigMemo,
    name: &'a str,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.memo.forget(self.name);
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("counter name must not be empty".into()));
    }
    Ok(())
}

/// Sharded counters over a transactional store with a cached aggregate.
///
/// The engine is `Send + Sync`; share it with `Arc` and call it from any
/// number of threads.
///
/// # Examples
///
/// ```rust
/// use shardtally::context::Context;
/// use shardtally::engine::CounterEngine;
///
/// let engine = CounterEngine::in_memory();
/// let ctx = Context::background();
///
/// engine.increase_shards(&ctx, "hits", 50).unwrap();
/// for _ in 0..3 {
///     engine.increment_by(&ctx, "hits", 5).unwrap();
/// }
/// assert_eq!(engine.count(&ctx, "hits").unwrap(), 15);
/// assert_eq!(engine.shard_count(&ctx, "hits").unwrap(), 50);
///
/// // Never decreases.
/// engine.increase_shards(&ctx, "hits", 10).unwrap();
/// assert_eq!(engine.shard_count(&ctx, "hits").unwrap(), 50);
/// ```
pub struct CounterEngine {
    shards: Arc<dyn ShardStore>,
    configs: Arc<dyn ConfigStore>,
    cache: Arc<dyn AggregateCache>,
    router: Arc<dyn ShardRouter>,
    memo: Arc<ConfigMemo>,
    config: EngineConfig,
}

impl CounterEngine {
    /// Starts building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// An engine over in-memory stores and cache with default settings.
    pub fn in_memory() -> Self {
        EngineBuilder::new().assemble()
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The config memo shared with this engine.
    pub fn memo(&self) -> &Arc<ConfigMemo> {
        &self.memo
    }

    /// Returns the total of `name`.
    ///
    /// Serves the cached aggregate when present, which may be stale by up to
    /// the cache TTL. On a miss, sums every shard in the store and caches the
    /// result. A counter that was never incremented counts as 0.
    ///
    /// # Errors
    ///
    /// Any storage error during the scan aborts the call; a partial sum is
    /// never returned. Cache failures are logged and treated as misses.
    pub fn count(&self, ctx: &Context, name: &str) -> Result<i64> {
        validate_name(name)?;
        ctx.check()?;

        let key = self.cache_key(name);
        match self.cache.get(&key) {
            Ok(Some(total)) => {
                trace!(counter = name, total, "aggregate cache hit");
                return Ok(total);
            }
            Ok(None) => debug!(counter = name, "aggregate cache miss"),
            Err(err) => {
                warn!(counter = name, error = %err, "aggregate cache read failed, scanning shards")
            }
        }

        let total = self.scan_total(ctx, name)?;
        self.populate_cache(&key, name, total);
        Ok(total)
    }

    /// Like [`count`](Self::count) but always scans the shards.
    ///
    /// The fresh total replaces the cached one.
    pub fn count_uncached(&self, ctx: &Context, name: &str) -> Result<i64> {
        validate_name(name)?;
        ctx.check()?;

        let total = self.scan_total(ctx, name)?;
        self.populate_cache(&self.cache_key(name), name, total);
        Ok(total)
    }

    /// Adds 1 to `name`.
    pub fn increment(&self, ctx: &Context, name: &str) -> Result<()> {
        self.increment_by(ctx, name, 1)
    }

    /// Adds `delta` (possibly negative) to `name`.
    ///
    /// The delta lands on one shard chosen by the router, inside a store
    /// transaction. After the commit, an existing cached total is bumped by
    /// `delta`; a missing one is left missing.
    ///
    /// # Errors
    ///
    /// Storage errors and exhausted conflicts are returned after the store's
    /// retry budget. The delta is then lost and no shard changed; retrying is
    /// up to the caller.
    pub fn increment_by(&self, ctx: &Context, name: &str, delta: i64) -> Result<()> {
        validate_name(name)?;
        ctx.check()?;
        if delta == 0 {
            return Ok(());
        }

        let CounterConfig { shards } = self.memo.get_or_create(
            ctx,
            self.configs.as_ref(),
            name,
            self.config.default_shards,
        )?;

        self.shards.run_transaction(ctx, &mut |txn: &mut dyn ShardTxn| {
            // Re-routing on every attempt moves a retry off a contended shard.
            let key = ShardKey::new(name, self.router.pick(shards));
            trace!(shard = %key, delta, "routing increment");
            let current = txn.get(&key)?.value_or(0);
            let next = current
                .checked_add(delta)
                .ok_or_else(|| Error::Overflow(format!("{key} cannot absorb {delta}")))?;
            txn.put(&key, next)
        })?;

        if let Err(err) = self
            .cache
            .increment_if_present(&self.cache_key(name), delta)
        {
            warn!(counter = name, error = %err, "aggregate cache bump failed");
        }
        Ok(())
    }

    /// Raises the fanout of `name` to at least `n`. Never lowers it.
    ///
    /// Runs as one config transaction: a missing record is created with
    /// `max(default_shards, n)`, a smaller one is raised to `n`, anything
    /// else is left untouched. The memoized config of `name` is forgotten
    /// on every exit path so later increments see the new fanout promptly.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `n` is 0 or above `max_shards`; storage errors
    /// from the config store.
    pub fn increase_shards(&self, ctx: &Context, name: &str, n: u32) -> Result<()> {
        validate_name(name)?;
        let _forget = ForgetOnDrop {
            memo: &self.memo,
            name,
        };

        if n == 0 {
            return Err(Error::InvalidArgument("shard count must be at least 1".into()));
        }
        if n > self.config.max_shards {
            return Err(Error::InvalidArgument(format!(
                "shard count {n} exceeds the maximum of {}",
                self.config.max_shards
            )));
        }
        ctx.check()?;

        let default_shards = self.config.default_shards;
        let mut raised_to = None;
        self.configs.run_transaction(ctx, &mut |txn: &mut dyn ConfigTxn| {
            raised_to = None;
            let (mut config, mut modified) = match txn.get(name)? {
                Lookup::Found(config) => (config, false),
                Lookup::NotFound => (CounterConfig::new(default_shards), true),
            };
            if config.shards < n {
                config.shards = n;
                modified = true;
            }
            if modified {
                txn.put(name, config)?;
                raised_to = Some(config.shards);
            }
            Ok(())
        })?;

        match raised_to {
            Some(shards) => info!(counter = name, shards, "counter fanout raised"),
            None => debug!(counter = name, requested = n, "fanout already sufficient"),
        }
        Ok(())
    }

    /// The fanout increments of `name` currently use.
    pub fn shard_count(&self, ctx: &Context, name: &str) -> Result<u32> {
        validate_name(name)?;
        ctx.check()?;
        let config = self.memo.get_or_create(
            ctx,
            self.configs.as_ref(),
            name,
            self.config.default_shards,
        )?;
        Ok(config.shards)
    }

    /// Counts each of `names` and collects the results with a timestamp.
    pub fn snapshot<'a>(
        &self,
        ctx: &Context,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<MetricsSnapshot> {
        let mut counters = Vec::new();
        for name in names {
            let value = self.count(ctx, name)?;
            let shards = self.shard_count(ctx, name)?;
            counters.push(CounterSnapshot::new(name, value, shards));
        }
        Ok(MetricsSnapshot::with_timestamp(counters, current_timestamp_ms()))
    }

    fn cache_key(&self, name: &str) -> String {
        cache_key(&self.config.cache_key_prefix, name)
    }

    fn scan_total(&self, ctx: &Context, name: &str) -> Result<i64> {
        let shards = self.shards.scan_counter(ctx, name)?;
        ctx.check()?;
        let total = shards
            .iter()
            .try_fold(0i64, |acc, (_, count)| acc.checked_add(*count))
            .ok_or_else(|| Error::Overflow(format!("total of {name} exceeds the i64 range")))?;
        debug!(counter = name, shards = shards.len(), total, "summed shards");
        Ok(total)
    }

    fn populate_cache(&self, key: &str, name: &str, total: i64) {
        if let Err(err) = self.cache.set(key, total, self.config.cache_ttl) {
            warn!(counter = name, error = %err, "aggregate cache write failed");
        }
    }
}

impl Debug for CounterEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterEngine")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("memo", &self.memo)
            .finish()
    }
}

/// Builder for [`CounterEngine`].
///
/// Collaborators that are not supplied default to the in-memory backends,
/// the [`UniformRouter`] and a memo using the configured `memo_ttl`.
///
/// ```rust
/// use std::sync::Arc;
/// use shardtally::cache::NoCache;
/// use shardtally::config::EngineConfig;
/// use shardtally::engine::CounterEngine;
/// use shardtally::router::RoundRobinRouter;
///
/// let engine = CounterEngine::builder()
///     .with_config(EngineConfig::default().with_default_shards(8))
///     .with_cache(Arc::new(NoCache))
///     .with_router(Arc::new(RoundRobinRouter::new()))
///     .build()
///     .unwrap();
/// assert_eq!(engine.config().default_shards, 8);
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    shard_store: Option<Arc<dyn ShardStore>>,
    config_store: Option<Arc<dyn ConfigStore>>,
    cache: Option<Arc<dyn AggregateCache>>,
    router: Option<Arc<dyn ShardRouter>>,
    memo: Option<Arc<ConfigMemo>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// A builder with default configuration and no collaborators set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `store` for shard records.
    pub fn with_shard_store(mut self, store: Arc<dyn ShardStore>) -> Self {
        self.shard_store = Some(store);
        self
    }

    /// Uses `store` for counter configs.
    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Uses `cache` for aggregates.
    pub fn with_cache(mut self, cache: Arc<dyn AggregateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Uses `router` to pick shards.
    pub fn with_router(mut self, router: Arc<dyn ShardRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Shares `memo` instead of creating one.
    pub fn with_memo(mut self, memo: Arc<ConfigMemo>) -> Self {
        self.memo = Some(memo);
        self
    }

    /// Replaces the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> Result<CounterEngine> {
        self.config.validate()?;
        Ok(self.assemble())
    }

    fn assemble(self) -> CounterEngine {
        let memo_ttl = self.config.memo_ttl;
        CounterEngine {
            shards: self
                .shard_store
                .unwrap_or_else(|| Arc::new(MemoryShardStore::new())),
            configs: self
                .config_store
                .unwrap_or_else(|| Arc::new(MemoryConfigStore::new())),
            cache: self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new())),
            router: self.router.unwrap_or_else(|| Arc::new(UniformRouter)),
            memo: self
                .memo
                .unwrap_or_else(|| Arc::new(ConfigMemo::with_ttl(memo_ttl))),
            config: self.config,
        }
    }
}

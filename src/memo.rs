//! In-process memo of counter configs.
//!
//! Every increment needs the counter's fanout. Reading it from the
//! [`ConfigStore`] each time would add a storage round trip to the write
//! path, so the engine keeps a [`ConfigMemo`]. It is an injected object, not
//! process-global state, which makes the invalidation contract testable:
//! `increase_shards` always calls [`ConfigMemo::forget`] after its
//! transaction.
//!
//! Staleness is bounded two ways. Entries may carry a TTL, and every name
//! has a forget generation. A load records the generation before reading the
//! store and only publishes its value if the generation is unchanged, checked
//! under the same map lock `forget` takes, so a value read before a
//! concurrent `forget` is never inserted. Forgetting one counter leaves
//! concurrent loads of other counters alone. A stale fanout never affects
//! correctness: `count` scans every shard regardless of the active fanout.

use std::fmt::{self, Debug};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::store::{ConfigStore, CounterConfig};

#[derive(Debug, Clone, Copy)]
struct MemoEntry {
    config: CounterConfig,
    loaded_at: Instant,
}

/// Per-name state. A forgotten name keeps its slot with `entry` cleared so
/// the bumped generation outlives the value.
#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    entry: Option<MemoEntry>,
}

/// Memoized [`CounterConfig`] records keyed by counter name.
///
/// # Examples
///
/// ```rust
/// use shardtally::context::Context;
/// use shardtally::memo::ConfigMemo;
/// use shardtally::store::memory::MemoryConfigStore;
///
/// let memo = ConfigMemo::new();
/// let store = MemoryConfigStore::new();
/// let ctx = Context::background();
///
/// // Unknown counters resolve to the default without persisting anything.
/// let config = memo.get_or_create(&ctx, &store, "hits", 20).unwrap();
/// assert_eq!(config.shards, 20);
/// assert!(store.is_empty());
/// assert_eq!(memo.len(), 1);
///
/// memo.forget("hits");
/// assert!(memo.is_empty());
/// ```
pub struct ConfigMemo {
    slots: DashMap<String, Slot>,
    ttl: Option<Duration>,
}

impl ConfigMemo {
    /// A memo whose entries live until forgotten.
    pub fn new() -> Self {
        Self::with_ttl(None)
    }

    /// A memo whose entries expire after `ttl`.
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    /// Entry lifetime, if bounded.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Returns the config of `name`, loading it from `store` on a miss.
    ///
    /// A counter without a stored record resolves to `default_shards`; the
    /// default is memoized but never persisted.
    pub fn get_or_create(
        &self,
        ctx: &Context,
        store: &dyn ConfigStore,
        name: &str,
        default_shards: u32,
    ) -> Result<CounterConfig> {
        let generation = match self.lookup(name) {
            Ok(config) => return Ok(config),
            Err(generation) => generation,
        };

        let config = store
            .get(ctx, name)?
            .value_or(CounterConfig::new(default_shards));
        debug!(counter = name, shards = config.shards, "loaded counter config");

        let mut slot = self.slots.entry(name.to_string()).or_default();
        if slot.generation == generation {
            slot.entry = Some(MemoEntry {
                config,
                loaded_at: Instant::now(),
            });
        }
        Ok(config)
    }

    /// Drops the memoized config of `name`.
    ///
    /// Loads of `name` already in flight will not publish their result.
    pub fn forget(&self, name: &str) {
        let mut slot = self.slots.entry(name.to_string()).or_default();
        slot.generation = slot.generation.wrapping_add(1);
        slot.entry = None;
    }

    /// Drops every memoized config.
    pub fn clear(&self) {
        for mut slot in self.slots.iter_mut() {
            slot.generation = slot.generation.wrapping_add(1);
            slot.entry = None;
        }
    }

    /// Number of memoized configs, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Returns `true` when nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A live config, or the generation a fresh load must match.
    fn lookup(&self, name: &str) -> std::result::Result<CounterConfig, u64> {
        let Some(mut slot) = self.slots.get_mut(name) else {
            return Err(0);
        };
        match (slot.entry, self.ttl) {
            (Some(entry), Some(ttl)) if entry.loaded_at.elapsed() >= ttl => {
                slot.entry = None;
                Err(slot.generation)
            }
            (Some(entry), _) => Ok(entry.config),
            (None, _) => Err(slot.generation),
        }
    }
}

impl Default for ConfigMemo {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ConfigMemo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigMemo")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryConfigStore;
    use crate::store::{ConfigTxn, Lookup};
    use std::thread;

    /// Raises the fanout and forgets `forget` while a load is in flight, the
    /// way a concurrent `increase_shards` would.
    struct RacingStore<'a> {
        memo: &'a ConfigMemo,
        forget: &'a str,
        shards: u32,
    }

    impl ConfigStore for RacingStore<'_> {
        fn get(&self, _ctx: &Context, _counter: &str) -> Result<Lookup<CounterConfig>> {
            let loaded = Lookup::Found(CounterConfig::new(self.shards));
            self.memo.forget(self.forget);
            Ok(loaded)
        }

        fn run_transaction(
            &self,
            _ctx: &Context,
            _body: &mut dyn FnMut(&mut dyn ConfigTxn) -> Result<()>,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn store_with(name: &str, shards: u32) -> MemoryConfigStore {
        let store = MemoryConfigStore::new();
        store
            .run_transaction(&Context::background(), &mut |txn: &mut dyn ConfigTxn| {
                txn.put(name, CounterConfig::new(shards))
            })
            .unwrap();
        store
    }

    #[test]
    fn test_default_when_missing() {
        let memo = ConfigMemo::new();
        let store = MemoryConfigStore::new();
        let ctx = Context::background();
        let config = memo.get_or_create(&ctx, &store, "hits", 20).unwrap();
        assert_eq!(config, CounterConfig::new(20));
        assert!(store.is_empty());
    }

    #[test]
    fn test_memoized_value_skips_store() {
        let memo = ConfigMemo::new();
        let store = store_with("hits", 50);
        let ctx = Context::background();

        assert_eq!(memo.get_or_create(&ctx, &store, "hits", 20).unwrap().shards, 50);

        // A dead store proves the second read never reaches it.
        store.faults().set_unavailable(true);
        assert_eq!(memo.get_or_create(&ctx, &store, "hits", 20).unwrap().shards, 50);
    }

    #[test]
    fn test_forget_forces_reload() {
        let memo = ConfigMemo::new();
        let store = MemoryConfigStore::new();
        let ctx = Context::background();
        assert_eq!(memo.get_or_create(&ctx, &store, "hits", 20).unwrap().shards, 20);

        store
            .run_transaction(&ctx, &mut |txn: &mut dyn ConfigTxn| {
                txn.put("hits", CounterConfig::new(64))
            })
            .unwrap();
        assert_eq!(memo.get_or_create(&ctx, &store, "hits", 20).unwrap().shards, 20);

        memo.forget("hits");
        assert_eq!(memo.get_or_create(&ctx, &store, "hits", 20).unwrap().shards, 64);
    }

    #[test]
    fn test_ttl_expiry() {
        let memo = ConfigMemo::with_ttl(Some(Duration::from_millis(1)));
        let store = MemoryConfigStore::new();
        let ctx = Context::background();
        memo.get_or_create(&ctx, &store, "hits", 20).unwrap();

        thread::sleep(Duration::from_millis(5));
        store.faults().set_unavailable(true);
        assert!(memo.get_or_create(&ctx, &store, "hits", 20).is_err());
    }

    #[test]
    fn test_store_error_is_not_memoized() {
        let memo = ConfigMemo::new();
        let store = MemoryConfigStore::new();
        let ctx = Context::background();
        store.faults().fail_next(1);
        assert!(memo.get_or_create(&ctx, &store, "hits", 20).is_err());
        assert!(memo.is_empty());
    }

    #[test]
    fn test_clear() {
        let memo = ConfigMemo::new();
        let store = MemoryConfigStore::new();
        let ctx = Context::background();
        memo.get_or_create(&ctx, &store, "a", 20).unwrap();
        memo.get_or_create(&ctx, &store, "b", 20).unwrap();
        assert_eq!(memo.len(), 2);
        memo.clear();
        assert!(memo.is_empty());
    }

    #[test]
    fn test_load_racing_forget_is_not_memoized() {
        let memo = ConfigMemo::new();
        let ctx = Context::background();
        let store = RacingStore {
            memo: &memo,
            forget: "hits",
            shards: 20,
        };

        assert_eq!(memo.get_or_create(&ctx, &store, "hits", 20).unwrap().shards, 20);
        assert!(memo.is_empty());

        // The next load sees the raised fanout instead of the stale 20.
        let raised = store_with("hits", 50);
        assert_eq!(memo.get_or_create(&ctx, &raised, "hits", 20).unwrap().shards, 50);
        assert_eq!(memo.len(), 1);
    }

    #[test]
    fn test_load_racing_forget_of_existing_entry() {
        let memo = ConfigMemo::with_ttl(Some(Duration::from_millis(1)));
        let ctx = Context::background();
        memo.get_or_create(&ctx, &MemoryConfigStore::new(), "hits", 20)
            .unwrap();
        thread::sleep(Duration::from_millis(5));

        let store = RacingStore {
            memo: &memo,
            forget: "hits",
            shards: 20,
        };
        memo.get_or_create(&ctx, &store, "hits", 20).unwrap();
        assert!(memo.is_empty());
    }

    #[test]
    fn test_forget_is_scoped_to_one_counter() {
        let memo = ConfigMemo::new();
        let ctx = Context::background();
        let store = RacingStore {
            memo: &memo,
            forget: "other",
            shards: 32,
        };

        assert_eq!(memo.get_or_create(&ctx, &store, "hits", 20).unwrap().shards, 32);
        assert_eq!(memo.len(), 1);

        // Memoized: the racing store would forget "other" again but is not consulted.
        let dead = MemoryConfigStore::new();
        dead.faults().set_unavailable(true);
        assert_eq!(memo.get_or_create(&ctx, &dead, "hits", 20).unwrap().shards, 32);
    }

    #[test]
    fn test_reload_after_forget_and_clear() {
        let memo = ConfigMemo::new();
        let ctx = Context::background();
        memo.get_or_create(&ctx, &MemoryConfigStore::new(), "hits", 20)
            .unwrap();
        memo.forget("hits");
        memo.clear();

        let store = store_with("hits", 64);
        assert_eq!(memo.get_or_create(&ctx, &store, "hits", 20).unwrap().shards, 64);
        assert_eq!(memo.len(), 1);
    }
}

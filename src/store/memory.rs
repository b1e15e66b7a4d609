//! In-memory transactional backends.
//!
//! [`MemoryShardStore`] and [`MemoryConfigStore`] implement the storage
//! contracts with optimistic concurrency control:
//!
//! ```text
//!   run_transaction(body)
//!     ├─ attempt: body reads   → record (key, version) in the read set
//!     │           body writes  → buffer in the write set
//!     ├─ commit:  lock stripes covering read ∪ write keys (index order)
//!     │           validate every read version is still current
//!     │           apply writes, bump each written key's version
//!     └─ conflict → jittered backoff, re-run body (RetryPolicy)
//! ```
//!
//! Locks are striped across cache-padded mutexes, so commits touching
//! different shards of the same counter almost never wait on each other.
//! Only transactions that actually race on one record retry.
//!
//! Both stores carry a [`FaultInjector`] so callers can simulate an
//! unreachable backend or exhausted retries.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHasher;
use tracing::{trace, warn};

use crate::config::RetryPolicy;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::store::{
    ConfigStore, ConfigTxn, CounterConfig, Lookup, ShardKey, ShardStore, ShardTxn,
};

/// Number of commit lock stripes per store.
const NUM_STRIPES: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Versioned<V> {
    value: V,
    /// Starts at 1 on first write; 0 stands for "absent".
    version: u64,
}

/// Key-value map with per-key versions and striped commit locks.
struct VersionedMap<K, V> {
    entries: DashMap<K, Versioned<V>>,
    stripes: Box<[CachePadded<Mutex<()>>]>,
}

impl<K, V> VersionedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn new() -> Self {
        let stripes = (0..NUM_STRIPES)
            .map(|_| CachePadded::new(Mutex::new(())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            entries: DashMap::new(),
            stripes,
        }
    }

    #[inline]
    fn stripe_of(&self, key: &K) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    #[inline]
    fn version_of(&self, key: &K) -> u64 {
        self.entries.get(key).map(|e| e.version).unwrap_or(0)
    }

    fn read(&self, key: &K) -> (Option<V>, u64) {
        match self.entries.get(key) {
            Some(entry) => (Some(entry.value.clone()), entry.version),
            None => (None, 0),
        }
    }

    fn write(&self, key: K, value: V) {
        let _guard = self.stripes[self.stripe_of(&key)].lock();
        let version = self.version_of(&key) + 1;
        self.entries.insert(key, Versioned { value, version });
    }

    /// Validates and applies a transaction. On conflict returns the first key
    /// whose version moved.
    fn commit(
        &self,
        reads: HashMap<K, (Option<V>, u64)>,
        writes: HashMap<K, V>,
    ) -> std::result::Result<(), K> {
        let mut stripes: Vec<usize> = reads
            .keys()
            .chain(writes.keys())
            .map(|k| self.stripe_of(k))
            .collect();
        stripes.sort_unstable();
        stripes.dedup();

        // Ascending order keeps concurrent committers deadlock-free.
        let _guards: Vec<MutexGuard<'_, ()>> =
            stripes.iter().map(|&i| self.stripes[i].lock()).collect();

        for (key, (_, seen)) in &reads {
            if self.version_of(key) != *seen {
                return Err(key.clone());
            }
        }
        for (key, value) in writes {
            let version = self.version_of(&key) + 1;
            self.entries.insert(key, Versioned { value, version });
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One optimistic attempt: a read set with observed versions and a
/// buffered write set.
struct MemoryTxn<'a, K, V> {
    map: &'a VersionedMap<K, V>,
    reads: HashMap<K, (Option<V>, u64)>,
    writes: HashMap<K, V>,
}

impl<'a, K, V> MemoryTxn<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn new(map: &'a VersionedMap<K, V>) -> Self {
        Self {
            map,
            reads: HashMap::new(),
            writes: HashMap::new(),
        }
    }

    fn read(&mut self, key: &K) -> Option<V> {
        if let Some(value) = self.writes.get(key) {
            return Some(value.clone());
        }
        // Repeated reads return the first observation so the body sees one
        // consistent value; validation catches any later movement.
        if let Some((value, _)) = self.reads.get(key) {
            return value.clone();
        }
        let observed = self.map.read(key);
        let value = observed.0.clone();
        self.reads.insert(key.clone(), observed);
        value
    }

    fn write(&mut self, key: K, value: V) {
        self.writes.insert(key, value);
    }

    fn label(&self) -> Option<&K> {
        self.writes.keys().next().or_else(|| self.reads.keys().next())
    }
}

impl ShardTxn for MemoryTxn<'_, ShardKey, i64> {
    fn get(&mut self, key: &ShardKey) -> Result<Lookup<i64>> {
        Ok(self.read(key).into())
    }

    fn put(&mut self, key: &ShardKey, count: i64) -> Result<()> {
        self.write(key.clone(), count);
        Ok(())
    }
}

impl ConfigTxn for MemoryTxn<'_, String, CounterConfig> {
    fn get(&mut self, counter: &str) -> Result<Lookup<CounterConfig>> {
        Ok(self.read(&counter.to_string()).into())
    }

    fn put(&mut self, counter: &str, config: CounterConfig) -> Result<()> {
        self.write(counter.to_string(), config);
        Ok(())
    }
}

/// Runs `body` under optimistic concurrency until it commits, fails, or the
/// retry budget is exhausted.
fn run_optimistic<K, V, F>(
    map: &VersionedMap<K, V>,
    faults: &FaultInjector,
    policy: &RetryPolicy,
    ctx: &Context,
    mut body: F,
) -> Result<()>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
    F: FnMut(&mut MemoryTxn<'_, K, V>) -> Result<()>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        ctx.check()?;
        faults.check("transaction")?;

        let mut txn = MemoryTxn::new(map);
        body(&mut txn)?;
        ctx.check()?;

        let outcome = if faults.take_conflict() {
            Err(txn
                .label()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "transaction".to_string()))
        } else {
            map.commit(txn.reads, txn.writes)
                .map_err(|key| key.to_string())
        };

        match outcome {
            Ok(()) => return Ok(()),
            Err(key) if attempt >= policy.max_attempts => {
                warn!(%key, attempts = attempt, "optimistic transaction gave up");
                return Err(Error::TransactionConflict {
                    key,
                    attempts: attempt,
                });
            }
            Err(key) => {
                trace!(%key, attempt, "commit conflict, retrying");
                policy.backoff(ctx, attempt)?;
            }
        }
    }
}

/// Decrements `counter` if positive. Returns whether a token was taken.
fn take_token(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// Simulated backend failures.
///
/// # Examples
///
/// ```rust
/// use shardtally::context::Context;
/// use shardtally::store::memory::MemoryShardStore;
/// use shardtally::store::{ShardKey, ShardStore};
///
/// let store = MemoryShardStore::new();
/// store.faults().fail_next(1);
///
/// let ctx = Context::background();
/// let key = ShardKey::new("hits", 0);
/// assert!(store.get(&ctx, &key).is_err());
/// assert!(store.get(&ctx, &key).is_ok());
/// ```
#[derive(Debug, Default)]
pub struct FaultInjector {
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    conflict_next: AtomicU32,
    scan_delay_us: AtomicU64,
}

impl FaultInjector {
    /// Makes every operation fail with `StorageUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Fails the next `n` operations with `StorageUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// Forces the next `n` commits to report a conflict.
    pub fn conflict_next(&self, n: u32) {
        self.conflict_next.store(n, Ordering::Release);
    }

    /// Slows scans down by `per_record` for every matching record, as a
    /// backend paging through a large counter would.
    pub fn delay_scan(&self, per_record: Duration) {
        let micros = u64::try_from(per_record.as_micros()).unwrap_or(u64::MAX);
        self.scan_delay_us.store(micros, Ordering::Release);
    }

    fn pause_scan(&self) {
        let micros = self.scan_delay_us.load(Ordering::Acquire);
        if micros > 0 {
            std::thread::sleep(Duration::from_micros(micros));
        }
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::StorageUnavailable(format!(
                "{op}: backend marked unavailable"
            )));
        }
        if take_token(&self.fail_next) {
            return Err(Error::StorageUnavailable(format!("{op}: injected failure")));
        }
        Ok(())
    }

    fn take_conflict(&self) -> bool {
        take_token(&self.conflict_next)
    }
}

/// In-memory [`ShardStore`].
///
/// Scans are linear in the number of stored shards across all counters.
pub struct MemoryShardStore {
    map: VersionedMap<ShardKey, i64>,
    retry: RetryPolicy,
    faults: FaultInjector,
}

impl MemoryShardStore {
    /// Creates an empty store with the default [`RetryPolicy`].
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    /// Creates an empty store with a custom retry budget.
    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            map: VersionedMap::new(),
            retry,
            faults: FaultInjector::default(),
        }
    }

    /// Failure injection handle.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// The retry budget used by `run_transaction`.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Number of shard records across all counters.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` when no shard has ever been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryShardStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryShardStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryShardStore")
            .field("shards", &self.map.len())
            .field("retry", &self.retry)
            .finish()
    }
}

impl ShardStore for MemoryShardStore {
    fn get(&self, ctx: &Context, key: &ShardKey) -> Result<Lookup<i64>> {
        ctx.check()?;
        self.faults.check("get")?;
        Ok(self.map.read(key).0.into())
    }

    fn put(&self, ctx: &Context, key: &ShardKey, count: i64) -> Result<()> {
        ctx.check()?;
        self.faults.check("put")?;
        self.map.write(key.clone(), count);
        Ok(())
    }

    fn scan_counter(&self, ctx: &Context, counter: &str) -> Result<Vec<(ShardKey, i64)>> {
        ctx.check()?;
        self.faults.check("scan")?;

        let mut shards = Vec::new();
        for entry in self.map.entries.iter() {
            if entry.key().counter == counter {
                self.faults.pause_scan();
                ctx.check()?;
                shards.push((entry.key().clone(), entry.value().value));
            }
        }
        shards.sort_unstable_by_key(|(key, _)| key.index);
        Ok(shards)
    }

    fn run_transaction(
        &self,
        ctx: &Context,
        body: &mut dyn FnMut(&mut dyn ShardTxn) -> Result<()>,
    ) -> Result<()> {
        run_optimistic(&self.map, &self.faults, &self.retry, ctx, |txn| body(txn))
    }
}

/// In-memory [`ConfigStore`].
pub struct MemoryConfigStore {
    map: VersionedMap<String, CounterConfig>,
    retry: RetryPolicy,
    faults: FaultInjector,
}

impl MemoryConfigStore {
    /// Creates an empty store with the default [`RetryPolicy`].
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    /// Creates an empty store with a custom retry budget.
    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            map: VersionedMap::new(),
            retry,
            faults: FaultInjector::default(),
        }
    }

    /// Failure injection handle.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Number of stored config records.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` when no config has been persisted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConfigStore")
            .field("configs", &self.map.len())
            .field("retry", &self.retry)
            .finish()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, ctx: &Context, counter: &str) -> Result<Lookup<CounterConfig>> {
        ctx.check()?;
        self.faults.check("get config")?;
        Ok(self.map.read(&counter.to_string()).0.into())
    }

    fn run_transaction(
        &self,
        ctx: &Context,
        body: &mut dyn FnMut(&mut dyn ConfigTxn) -> Result<()>,
    ) -> Result<()> {
        run_optimistic(&self.map, &self.faults, &self.retry, ctx, |txn| body(txn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn add_one(store: &MemoryShardStore, ctx: &Context, key: &ShardKey) -> Result<()> {
        store.run_transaction(ctx, &mut |txn| {
            let current = txn.get(key)?.value_or(0);
            txn.put(key, current + 1)
        })
    }

    #[test]
    fn test_get_absent_is_not_found() {
        let store = MemoryShardStore::new();
        let ctx = Context::background();
        assert_eq!(
            store.get(&ctx, &ShardKey::new("hits", 0)).unwrap(),
            Lookup::NotFound
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_then_get() {
        let store = MemoryShardStore::new();
        let ctx = Context::background();
        let key = ShardKey::new("hits", 4);
        store.put(&ctx, &key, -12).unwrap();
        assert_eq!(store.get(&ctx, &key).unwrap(), Lookup::Found(-12));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_transaction_reads_own_writes() {
        let store = MemoryShardStore::new();
        let ctx = Context::background();
        let key = ShardKey::new("hits", 0);
        store
            .run_transaction(&ctx, &mut |txn| {
                txn.put(&key, 5)?;
                assert_eq!(txn.get(&key)?, Lookup::Found(5));
                txn.put(&key, 6)
            })
            .unwrap();
        assert_eq!(store.get(&ctx, &key).unwrap(), Lookup::Found(6));
    }

    #[test]
    fn test_body_error_writes_nothing() {
        let store = MemoryShardStore::new();
        let ctx = Context::background();
        let key = ShardKey::new("hits", 0);
        let result = store.run_transaction(&ctx, &mut |txn| {
            txn.put(&key, 99)?;
            Err(Error::InvalidArgument("abort".into()))
        });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(store.get(&ctx, &key).unwrap(), Lookup::NotFound);
    }

    #[test]
    fn test_conflict_is_retried() {
        let store = MemoryShardStore::with_retry_policy(
            RetryPolicy::default().with_backoff(Duration::ZERO, Duration::ZERO),
        );
        let ctx = Context::background();
        let key = ShardKey::new("hits", 0);

        // A concurrent writer moves the version under the first attempt only.
        let mut attempts = 0;
        store
            .run_transaction(&ctx, &mut |txn| {
                attempts += 1;
                let current = txn.get(&key)?.value_or(0);
                if attempts == 1 {
                    store.put(&Context::background(), &key, 100)?;
                }
                txn.put(&key, current + 1)
            })
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(store.get(&ctx, &key).unwrap(), Lookup::Found(101));
    }

    #[test]
    fn test_conflict_exhaustion_writes_nothing() {
        let store = MemoryShardStore::with_retry_policy(
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff(Duration::ZERO, Duration::ZERO),
        );
        let ctx = Context::background();
        let key = ShardKey::new("hits", 2);
        store.put(&ctx, &key, 7).unwrap();
        store.faults().conflict_next(3);

        let err = add_one(&store, &ctx, &key).unwrap_err();
        match err {
            Error::TransactionConflict { key: label, attempts } => {
                assert_eq!(label, "hits/shard2");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.get(&ctx, &key).unwrap(), Lookup::Found(7));

        add_one(&store, &ctx, &key).unwrap();
        assert_eq!(store.get(&ctx, &key).unwrap(), Lookup::Found(8));
    }

    #[test]
    fn test_unavailable_backend() {
        let store = MemoryShardStore::new();
        let ctx = Context::background();
        store.faults().set_unavailable(true);
        assert!(matches!(
            store.scan_counter(&ctx, "hits"),
            Err(Error::StorageUnavailable(_))
        ));
        assert!(matches!(
            add_one(&store, &ctx, &ShardKey::new("hits", 0)),
            Err(Error::StorageUnavailable(_))
        ));
        store.faults().set_unavailable(false);
        assert!(store.scan_counter(&ctx, "hits").unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_context_aborts_transaction() {
        let store = MemoryShardStore::new();
        let ctx = Context::background();
        ctx.cancel();
        let key = ShardKey::new("hits", 0);
        assert!(add_one(&store, &ctx, &key).unwrap_err().is_cancelled());
        assert_eq!(
            store.get(&Context::background(), &key).unwrap(),
            Lookup::NotFound
        );
    }

    #[test]
    fn test_scan_filters_by_counter() {
        let store = MemoryShardStore::new();
        let ctx = Context::background();
        store.put(&ctx, &ShardKey::new("hits", 3), 3).unwrap();
        store.put(&ctx, &ShardKey::new("hits", 0), 1).unwrap();
        store.put(&ctx, &ShardKey::new("misses", 0), 50).unwrap();
        store.put(&ctx, &ShardKey::new("hits-2", 0), 9).unwrap();

        let shards = store.scan_counter(&ctx, "hits").unwrap();
        assert_eq!(
            shards,
            vec![(ShardKey::new("hits", 0), 1), (ShardKey::new("hits", 3), 3)]
        );
    }

    #[test]
    fn test_scan_stops_when_deadline_passes_midway() {
        let store = MemoryShardStore::new();
        let bg = Context::background();
        for index in 0..20 {
            store.put(&bg, &ShardKey::new("hits", index), 1).unwrap();
        }
        store.faults().delay_scan(Duration::from_millis(10));

        let started = std::time::Instant::now();
        let ctx = Context::with_timeout(Duration::from_millis(25));
        let err = store.scan_counter(&ctx, "hits").unwrap_err();

        assert!(matches!(
            err,
            Error::Cancelled(crate::error::CancelReason::DeadlineExceeded)
        ));
        // Twenty records at 10ms each would take 200ms without the per-record check.
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn test_scan_stops_when_cancelled_midway() {
        let store = Arc::new(MemoryShardStore::new());
        let bg = Context::background();
        for index in 0..50 {
            store.put(&bg, &ShardKey::new("hits", index), 1).unwrap();
        }
        store.faults().delay_scan(Duration::from_millis(5));

        let ctx = Context::background();
        let canceller = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ctx.cancel();
            })
        };
        let result = store.scan_counter(&ctx, "hits");
        canceller.join().unwrap();

        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_concurrent_transactions_on_one_key() {
        let store = Arc::new(MemoryShardStore::with_retry_policy(
            RetryPolicy::default().with_max_attempts(1_000),
        ));
        let key = ShardKey::new("hot", 0);
        let mut handles = vec![];

        for _ in 0..8 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(thread::spawn(move || {
                let ctx = Context::background();
                for _ in 0..100 {
                    add_one(&store, &ctx, &key).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let ctx = Context::background();
        assert_eq!(store.get(&ctx, &key).unwrap(), Lookup::Found(800));
    }

    #[test]
    fn test_config_store_transaction() {
        let store = MemoryConfigStore::new();
        let ctx = Context::background();
        assert_eq!(store.get(&ctx, "hits").unwrap(), Lookup::NotFound);

        store
            .run_transaction(&ctx, &mut |txn| {
                assert_eq!(txn.get("hits")?, Lookup::NotFound);
                txn.put("hits", CounterConfig::new(50))
            })
            .unwrap();

        assert_eq!(
            store.get(&ctx, "hits").unwrap(),
            Lookup::Found(CounterConfig::new(50))
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_fail_next_is_consumed() {
        let store = MemoryConfigStore::new();
        let ctx = Context::background();
        store.faults().fail_next(2);
        assert!(store.get(&ctx, "a").is_err());
        assert!(store.get(&ctx, "a").is_err());
        assert!(store.get(&ctx, "a").is_ok());
    }
}

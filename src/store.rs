//! Storage contracts for shard records and counter configuration.
//!
//! The engine never touches a database directly. It talks to two
//! collaborators:
//!
//! - [`ShardStore`] holds one signed count per `(counter, shard)` pair and
//!   can scan every shard of a counter.
//! - [`ConfigStore`] holds one [`CounterConfig`] per counter.
//!
//! Both expose `run_transaction`, which executes a closure against a
//! transactional view ([`ShardTxn`] / [`ConfigTxn`]). The backend decides
//! how atomicity is achieved and how conflicts are retried. The closure may
//! therefore run more than once, and only the writes of the attempt that
//! commits become visible. After the retry budget is spent the backend
//! returns [`Error::TransactionConflict`](crate::error::Error) having written
//! nothing.
//!
//! Absent records are modelled with [`Lookup::NotFound`], never with an
//! error. "Never written" and "written" are both valid starting states.
//!
//! An in-memory implementation lives in [`memory`].

pub mod memory;

use std::fmt;

use crate::context::Context;
use crate::error::Result;

/// Outcome of reading a record that may not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<T> {
    /// The record exists.
    Found(T),
    /// No record has been written.
    NotFound,
}

impl<T> Lookup<T> {
    /// Returns `true` for [`Lookup::Found`].
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    /// The stored value, or `default` when absent.
    pub fn value_or(self, default: T) -> T {
        match self {
            Lookup::Found(value) => value,
            Lookup::NotFound => default,
        }
    }

    /// Maps the found value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
        }
    }

    /// Converts into an `Option`.
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotFound,
        }
    }
}

/// Identity of one shard record.
///
/// ```rust
/// use shardtally::store::ShardKey;
///
/// let key = ShardKey::new("hits", 3);
/// assert_eq!(key.name(), "shard3");
/// assert_eq!(key.to_string(), "hits/shard3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey {
    /// Name of the owning counter.
    pub counter: String,
    /// Index in `[0, shards)` at the time the shard was first written.
    pub index: u32,
}

impl ShardKey {
    /// Creates a key for shard `index` of `counter`.
    pub fn new(counter: impl Into<String>, index: u32) -> Self {
        Self {
            counter: counter.into(),
            index,
        }
    }

    /// The shard name, `shard<k>`.
    pub fn name(&self) -> String {
        format!("shard{}", self.index)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/shard{}", self.counter, self.index)
    }
}

/// Durable per-counter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterConfig {
    /// Number of shards writes fan out across. Never decreases.
    pub shards: u32,
}

impl CounterConfig {
    /// Creates a config with the given fanout.
    pub const fn new(shards: u32) -> Self {
        Self { shards }
    }
}

/// Transactional view of a [`ShardStore`].
pub trait ShardTxn {
    /// Reads a shard as of this transaction.
    fn get(&mut self, key: &ShardKey) -> Result<Lookup<i64>>;

    /// Buffers a write, visible to later reads in the same transaction.
    fn put(&mut self, key: &ShardKey, count: i64) -> Result<()>;
}

/// Durable shard records keyed by `(counter, shard)`.
pub trait ShardStore: Send + Sync {
    /// Reads one shard outside any transaction.
    fn get(&self, ctx: &Context, key: &ShardKey) -> Result<Lookup<i64>>;

    /// Overwrites one shard outside any transaction.
    fn put(&self, ctx: &Context, key: &ShardKey, count: i64) -> Result<()>;

    /// Every shard of `counter`, regardless of the current fanout.
    ///
    /// The scan is not a snapshot: each shard reflects some prefix of the
    /// writes applied to it.
    fn scan_counter(&self, ctx: &Context, counter: &str) -> Result<Vec<(ShardKey, i64)>>;

    /// Runs `body` atomically, retrying on conflict per the backend policy.
    fn run_transaction(
        &self,
        ctx: &Context,
        body: &mut dyn FnMut(&mut dyn ShardTxn) -> Result<()>,
    ) -> Result<()>;
}

/// Transactional view of a [`ConfigStore`].
pub trait ConfigTxn {
    /// Reads the config of `counter` as of this transaction.
    fn get(&mut self, counter: &str) -> Result<Lookup<CounterConfig>>;

    /// Buffers a write, visible to later reads in the same transaction.
    fn put(&mut self, counter: &str, config: CounterConfig) -> Result<()>;
}

/// Durable [`CounterConfig`] records keyed by counter name.
pub trait ConfigStore: Send + Sync {
    /// Reads the config of `counter` outside any transaction.
    fn get(&self, ctx: &Context, counter: &str) -> Result<Lookup<CounterConfig>>;

    /// Runs `body` atomically, retrying on conflict per the backend policy.
    fn run_transaction(
        &self,
        ctx: &Context,
        body: &mut dyn FnMut(&mut dyn ConfigTxn) -> Result<()>,
    ) -> Result<()>;
}

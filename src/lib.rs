//! # Shardtally - Write-Scalable Sharded Counters
//!
//! A Rust library for named integer counters that sustain high concurrent
//! write rates on top of a transactional store, using the **sharded counter
//! pattern** together with a **cached aggregate** for cheap reads.
//!
//! ## The Problem
//!
//! A counter kept in a single storage record serializes every writer. Each
//! increment is a read-modify-write transaction on the same key, so under
//! concurrency most transactions conflict and retry, and throughput
//! collapses to what one record can absorb.
//!
//! ## The Solution: Sharded Counters
//!
//! Each counter is split across `N` independent shard records. An increment
//! picks one shard and updates only that record, so writers spread across
//! `N` keys and rarely collide. The total is the sum of every shard, which
//! makes reads more expensive. A cache holds the sum for a bounded time so
//! repeated reads stay cheap.
//!
//! ```text
//!                      counter "hits" (fanout 4)
//!   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐
//!   │  shard0  │  │  shard1  │  │  shard2  │  │  shard3  │
//!   │    12    │  │     9    │  │    14    │  │    10    │
//!   └────▲─────┘  └────▲─────┘  └────▲─────┘  └────▲─────┘
//!        │             │             │             │
//!     writer        writer        writer        writer      (random shard)
//!
//!   count("hits") = cache hit ? cached : Σ shards = 45  ──► cached for 60s
//! ```
//!
//! ### Design Principles
//!
//! 1. **Independent Shards**: every shard is its own record. Increments on
//!    different shards never conflict; increments on the same shard are
//!    serialized by the store's transactions and retried on conflict.
//!
//! 2. **Monotone Fanout**: [`CounterEngine::increase_shards`] only ever
//!    raises a counter's shard count. Records written under a wider fanout
//!    are never orphaned because reads scan every shard of the counter.
//!
//! 3. **Best-Effort Cache**: the cached aggregate is an optimization. Cache
//!    failures are logged and ignored; the store is the source of truth.
//!    Increments adjust an existing cached total but never create one.
//!
//! 4. **Injected State**: stores, cache, router and the config memo are all
//!    handed to the engine, so every collaborator can be replaced in tests.
//!
//! ## Quick Start
//!
//! ```rust
//! use shardtally::context::Context;
//! use shardtally::engine::CounterEngine;
//!
//! let engine = CounterEngine::in_memory();
//! let ctx = Context::background();
//!
//! engine.increment(&ctx, "page_views").unwrap();
//! engine.increment_by(&ctx, "page_views", 9).unwrap();
//! assert_eq!(engine.count(&ctx, "page_views").unwrap(), 10);
//! ```
//!
//! ## Cancellation
//!
//! Every operation takes a [`Context`](context::Context) carrying an optional
//! deadline and a cancellation flag. Backends check it before each storage
//! access and between retries.
//!
//! ```rust
//! use std::time::Duration;
//! use shardtally::context::Context;
//! use shardtally::engine::CounterEngine;
//!
//! let engine = CounterEngine::in_memory();
//! let ctx = Context::with_timeout(Duration::from_millis(250));
//! engine.increment(&ctx, "jobs").unwrap();
//!
//! ctx.cancel();
//! assert!(engine.increment(&ctx, "jobs").unwrap_err().is_cancelled());
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - [`CounterEngine`] and its builder
//! - [`store`] - Storage traits and the in-memory transactional backend
//! - [`cache`] - Aggregate cache trait and in-memory backends
//! - [`memo`] - In-process memo of counter configs
//! - [`router`] - Shard routing strategies
//! - [`config`] - Engine configuration and retry policy
//! - [`context`] - Deadlines and cancellation
//! - [`snapshot`] - Point-in-time counter views
//! - [`observers`] - JSON and Prometheus exporters
//! - [`error`] - Error types
//!
//! ## Feature Flags
//!
//! - `serde` - `Serialize`/`Deserialize` for configs and snapshots
//! - `json` - JSON observer
//! - `prometheus` - Prometheus observer
//! - `full` - all observers

pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod memo;
pub mod observers;
pub mod router;
pub mod snapshot;
pub mod store;

pub use config::{EngineConfig, RetryPolicy};
pub use context::Context;
pub use engine::{CounterEngine, EngineBuilder};
pub use error::{CancelReason, Error, Result};
pub use snapshot::{CounterSnapshot, MetricsSnapshot};
pub use store::{CounterConfig, Lookup, ShardKey};

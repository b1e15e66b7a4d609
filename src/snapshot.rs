//! Point-in-time views of counters for export.
//!
//! A [`CounterSnapshot`] is what observers render: a counter's name, its
//! total as returned by `count`, and its current fanout. Snapshots are plain
//! data; with the `serde` feature they serialize with any serde format.
//!
//! # Examples
//!
//! ```rust
//! use shardtally::context::Context;
//! use shardtally::engine::CounterEngine;
//!
//! let engine = CounterEngine::in_memory();
//! let ctx = Context::background();
//! engine.increment_by(&ctx, "requests", 42).unwrap();
//!
//! let snapshot = engine.snapshot(&ctx, ["requests", "errors"]).unwrap();
//! assert_eq!(snapshot.get("requests").unwrap().value, 42);
//! assert_eq!(snapshot.get("errors").unwrap().value, 0);
//! ```

/// A snapshot of a single counter.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterSnapshot {
    /// The name of the counter.
    pub name: String,
    /// The aggregated total.
    pub value: i64,
    /// The fanout in effect when the snapshot was taken.
    pub shards: u32,
}

impl CounterSnapshot {
    /// Creates a new counter snapshot.
    pub fn new(name: impl Into<String>, value: i64, shards: u32) -> Self {
        Self {
            name: name.into(),
            value,
            shards,
        }
    }
}

/// A collection of counter snapshots taken together.
///
/// The totals are not an atomic cut across counters; each one is as fresh as
/// the individual `count` that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    /// Optional timestamp in milliseconds since Unix epoch.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub timestamp_ms: Option<u64>,
    /// The counter snapshots.
    pub counters: Vec<CounterSnapshot>,
}

impl MetricsSnapshot {
    /// Creates a new metrics snapshot with the given counters.
    pub fn new(counters: Vec<CounterSnapshot>) -> Self {
        Self {
            timestamp_ms: None,
            counters,
        }
    }

    /// Creates a new metrics snapshot with counters and a timestamp.
    pub fn with_timestamp(counters: Vec<CounterSnapshot>, timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms: Some(timestamp_ms),
            counters,
        }
    }

    /// Finds a counter by name.
    pub fn get(&self, name: &str) -> Option<&CounterSnapshot> {
        self.counters.iter().find(|c| c.name == name)
    }

    /// Sum of every counter in the snapshot, saturating at the `i64` bounds.
    pub fn total(&self) -> i64 {
        self.counters
            .iter()
            .fold(0i64, |acc, c| acc.saturating_add(c.value))
    }
}

/// Returns the current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! Exporters that render counter snapshots.
//!
//! Observers take [`CounterSnapshot`](crate::snapshot::CounterSnapshot)
//! values, usually from [`CounterEngine::snapshot`], and turn them into an
//! external format:
//!
//! - [`json`] - Serialize snapshots to JSON
//! - [`prometheus`] - Render snapshots in Prometheus exposition format
//!
//! Both share the [`ObserverError`] type, so exporters can be swapped
//! without touching error handling.
//!
//! # Feature Flags
//!
//! - `json` - Enables the [`json`] module
//! - `prometheus` - Enables the [`prometheus`] module
//! - `full` - Enables both
//!
//! # Example
//!
//! ```rust,ignore
//! use shardtally::context::Context;
//! use shardtally::engine::CounterEngine;
//! use shardtally::observers::Result;
//! use shardtally::observers::prometheus::PrometheusObserver;
//!
//! fn export(engine: &CounterEngine) -> Result<String> {
//!     let snapshot = engine
//!         .snapshot(&Context::background(), ["requests", "errors"])
//!         .map_err(shardtally::observers::ObserverError::from)?;
//!     PrometheusObserver::new()
//!         .with_namespace("myapp")
//!         .render(&snapshot.counters)
//! }
//! ```
//!
//! [`CounterEngine::snapshot`]: crate::engine::CounterEngine::snapshot

mod error;

pub use error::{ObserverError, Result};

#[cfg(feature = "prometheus")]
pub use error::PrometheusError;

#[cfg(feature = "json")]
pub mod json;

#[cfg(feature = "prometheus")]
pub mod prometheus;

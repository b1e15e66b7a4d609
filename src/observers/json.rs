//! JSON observer for counter snapshots.
//!
//! # Feature Flag
//!
//! This module requires the `json` feature:
//!
//! ```toml
//! [dependencies]
//! shardtally = { version = "0.1", features = ["json"] }
//! ```
//!
//! # Examples
//!
//! ```rust
//! use shardtally::observers::json::JsonObserver;
//! use shardtally::snapshot::CounterSnapshot;
//!
//! let counters = vec![
//!     CounterSnapshot::new("http_requests", 1000, 20),
//!     CounterSnapshot::new("http_errors", 5, 20),
//! ];
//!
//! let json = JsonObserver::new().to_json(&counters).unwrap();
//! assert_eq!(
//!     json,
//!     r#"[{"name":"http_requests","value":1000,"shards":20},{"name":"http_errors","value":5,"shards":20}]"#
//! );
//! ```

use serde::Serialize;

use super::Result;
use crate::snapshot::{current_timestamp_ms, CounterSnapshot, MetricsSnapshot};

/// Configuration for the JSON observer.
#[derive(Debug, Clone, Default)]
pub struct JsonConfig {
    /// Whether to pretty-print the JSON output.
    pub pretty: bool,
    /// Whether to include a timestamp in the output.
    pub include_timestamp: bool,
    /// Whether to wrap counters in a [`MetricsSnapshot`] object.
    pub wrap_in_snapshot: bool,
}

/// An observer that serializes counter snapshots to JSON.
///
/// By default the output is a bare array. With `wrap_in_snapshot` it is an
/// object with a `counters` field and, if requested, a `timestamp_ms`.
///
/// ```rust
/// use shardtally::observers::json::JsonObserver;
/// use shardtally::snapshot::CounterSnapshot;
///
/// let observer = JsonObserver::new()
///     .wrap_in_snapshot(true)
///     .include_timestamp(true);
/// let json = observer.to_json(&[CounterSnapshot::new("hits", 3, 20)]).unwrap();
/// assert!(json.contains("timestamp_ms"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct JsonObserver {
    config: JsonConfig,
}

impl JsonObserver {
    /// Creates a new JSON observer with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new JSON observer with the specified configuration.
    pub fn with_config(config: JsonConfig) -> Self {
        Self { config }
    }

    /// Enables or disables pretty-printing.
    pub fn pretty(mut self, enabled: bool) -> Self {
        self.config.pretty = enabled;
        self
    }

    /// Enables or disables timestamp inclusion.
    ///
    /// Only has effect when `wrap_in_snapshot` is also enabled.
    pub fn include_timestamp(mut self, enabled: bool) -> Self {
        self.config.include_timestamp = enabled;
        self
    }

    /// Enables or disables wrapping the output in a [`MetricsSnapshot`].
    pub fn wrap_in_snapshot(mut self, enabled: bool) -> Self {
        self.config.wrap_in_snapshot = enabled;
        self
    }

    /// Serializes `counters` to a JSON string.
    pub fn to_json(&self, counters: &[CounterSnapshot]) -> Result<String> {
        if self.config.wrap_in_snapshot {
            self.encode(&self.wrap(counters))
        } else {
            self.encode(&counters)
        }
    }

    /// Serializes an engine snapshot as an object, keeping its timestamp.
    pub fn render(&self, snapshot: &MetricsSnapshot) -> Result<String> {
        self.encode(snapshot)
    }

    /// Serializes `counters` to a JSON byte vector. Never pretty-printed.
    pub fn to_json_bytes(&self, counters: &[CounterSnapshot]) -> Result<Vec<u8>> {
        let bytes = if self.config.wrap_in_snapshot {
            serde_json::to_vec(&self.wrap(counters))?
        } else {
            serde_json::to_vec(counters)?
        };
        Ok(bytes)
    }

    fn wrap(&self, counters: &[CounterSnapshot]) -> MetricsSnapshot {
        if self.config.include_timestamp {
            MetricsSnapshot::with_timestamp(counters.to_vec(), current_timestamp_ms())
        } else {
            MetricsSnapshot::new(counters.to_vec())
        }
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let json = if self.config.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<CounterSnapshot> {
        vec![
            CounterSnapshot::new("requests", 1000, 20),
            CounterSnapshot::new("balance", -100, 50),
        ]
    }

    #[test]
    fn test_to_json_empty() {
        let json = JsonObserver::new().to_json(&[]).unwrap();
        assert_eq!(json, "[]");
    }

    #[test]
    fn test_to_json_counters() {
        let json = JsonObserver::new().to_json(&sample()).unwrap();
        assert!(json.contains(r#""name":"requests","value":1000,"shards":20"#));
        assert!(json.contains(r#""value":-100"#));
    }

    #[test]
    fn test_to_json_pretty() {
        let json = JsonObserver::new().pretty(true).to_json(&sample()).unwrap();
        assert!(json.contains('\n'));
    }

    #[test]
    fn test_to_json_with_snapshot() {
        let json = JsonObserver::new()
            .wrap_in_snapshot(true)
            .to_json(&sample())
            .unwrap();
        assert!(json.starts_with(r#"{"counters":["#));
        assert!(!json.contains("timestamp_ms"));
    }

    #[test]
    fn test_to_json_with_timestamp() {
        let json = JsonObserver::new()
            .wrap_in_snapshot(true)
            .include_timestamp(true)
            .to_json(&sample())
            .unwrap();
        let parsed: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert!(parsed.timestamp_ms.is_some());
        assert_eq!(parsed.counters, sample());
    }

    #[test]
    fn test_timestamp_ignored_without_wrapping() {
        let json = JsonObserver::new()
            .include_timestamp(true)
            .to_json(&sample())
            .unwrap();
        assert!(json.starts_with('['));
    }

    #[test]
    fn test_render_keeps_engine_timestamp() {
        let snapshot = MetricsSnapshot::with_timestamp(sample(), 1234567890);
        let json = JsonObserver::new().render(&snapshot).unwrap();
        assert!(json.starts_with(r#"{"timestamp_ms":1234567890,"#));
    }

    #[test]
    fn test_to_json_bytes() {
        let bytes = JsonObserver::with_config(JsonConfig {
            pretty: true,
            ..JsonConfig::default()
        })
        .to_json_bytes(&sample())
        .unwrap();
        let json = String::from_utf8(bytes).unwrap();
        assert!(!json.contains('\n'));
        assert!(json.contains("requests"));
    }
}

//! Prometheus observer for counter snapshots, built on the `prometheus` crate.
//!
//! # Feature Flag
//!
//! This module requires the `prometheus` feature:
//!
//! ```toml
//! [dependencies]
//! shardtally = { version = "0.1", features = ["prometheus"] }
//! ```
//!
//! # Metric Types
//!
//! Sharded counters accept negative deltas, so totals are exported as
//! gauges unless configured otherwise. A metric configured as a
//! [`MetricType::Counter`] clamps negative totals to 0.
//!
//! # Examples
//!
//! ```rust
//! use shardtally::observers::prometheus::{MetricType, PrometheusObserver};
//! use shardtally::snapshot::CounterSnapshot;
//!
//! let counters = vec![
//!     CounterSnapshot::new("http_requests_total", 100, 20),
//!     CounterSnapshot::new("queue_depth", -3, 20),
//! ];
//!
//! let output = PrometheusObserver::new()
//!     .with_namespace("myapp")
//!     .with_type("http_requests_total", MetricType::Counter)
//!     .render(&counters)
//!     .unwrap();
//!
//! assert!(output.contains("# TYPE myapp_http_requests_total counter"));
//! assert!(output.contains("myapp_queue_depth -3"));
//! ```

use std::collections::HashMap;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use super::{PrometheusError, Result};
use crate::snapshot::CounterSnapshot;

/// Prometheus metric type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetricType {
    /// A cumulative metric that only ever goes up. Negative totals export as 0.
    Counter,
    /// A metric that can go up and down.
    #[default]
    Gauge,
}

/// Configuration for a specific metric.
#[derive(Debug, Clone, Default)]
pub struct MetricConfig {
    /// The type of metric (Counter or Gauge).
    pub metric_type: MetricType,
    /// Help text describing the metric.
    pub help: Option<String>,
    /// Additional labels specific to this metric.
    pub labels: HashMap<String, String>,
}

/// Observer that renders counter snapshots in Prometheus text format.
///
/// Each render builds a fresh [`Registry`], so repeated renders never clash
/// with metrics registered earlier.
pub struct PrometheusObserver {
    /// Namespace (prefix) for all metrics.
    namespace: Option<String>,
    /// Subsystem for all metrics.
    subsystem: Option<String>,
    /// Constant labels applied to all metrics.
    const_labels: HashMap<String, String>,
    /// Per-metric configuration.
    metric_configs: HashMap<String, MetricConfig>,
    /// Default metric type when not specified.
    default_type: MetricType,
    /// Whether to emit a `<name>_shards` gauge per counter.
    shard_gauges: bool,
}

impl Default for PrometheusObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusObserver {
    /// Creates an observer with no namespace, exporting gauges.
    pub fn new() -> Self {
        Self {
            namespace: None,
            subsystem: None,
            const_labels: HashMap::new(),
            metric_configs: HashMap::new(),
            default_type: MetricType::Gauge,
            shard_gauges: false,
        }
    }

    /// Sets the namespace (prefix) for all metrics.
    ///
    /// Namespace "myapp" + metric "requests" = "myapp_requests".
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Sets the subsystem for all metrics.
    ///
    /// Namespace "myapp" + subsystem "http" + metric "requests" =
    /// "myapp_http_requests".
    pub fn with_subsystem(mut self, subsystem: &str) -> Self {
        self.subsystem = Some(subsystem.to_string());
        self
    }

    /// Adds a constant label to all metrics.
    pub fn with_const_label(mut self, name: &str, value: &str) -> Self {
        self.const_labels
            .insert(name.to_string(), value.to_string());
        self
    }

    /// Sets the default metric type for metrics without explicit configuration.
    pub fn with_default_type(mut self, metric_type: MetricType) -> Self {
        self.default_type = metric_type;
        self
    }

    /// Configures a specific metric.
    pub fn with_metric_config(mut self, name: &str, config: MetricConfig) -> Self {
        self.metric_configs.insert(name.to_string(), config);
        self
    }

    /// Sets the metric type for a specific metric.
    pub fn with_type(mut self, name: &str, metric_type: MetricType) -> Self {
        self.metric_configs
            .entry(name.to_string())
            .or_default()
            .metric_type = metric_type;
        self
    }

    /// Sets the help text for a specific metric.
    pub fn with_help(mut self, name: &str, help: &str) -> Self {
        self.metric_configs
            .entry(name.to_string())
            .or_default()
            .help = Some(help.to_string());
        self
    }

    /// Also exports each counter's fanout as a `<name>_shards` gauge.
    pub fn with_shard_gauges(mut self, enabled: bool) -> Self {
        self.shard_gauges = enabled;
        self
    }

    /// Sanitizes a metric name to be Prometheus-compatible.
    ///
    /// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
    fn sanitize_name(name: &str) -> String {
        let mut result = String::with_capacity(name.len());
        for c in name.chars() {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                result.push(c);
            } else {
                result.push('_');
            }
        }
        if result.is_empty() {
            result.push_str("unnamed");
        }
        if result.starts_with(|c: char| c.is_ascii_digit()) {
            result.insert(0, '_');
        }
        result
    }

    /// Builds the full metric name with namespace and subsystem.
    fn build_full_name(&self, name: &str) -> String {
        let sanitized = Self::sanitize_name(name);
        match (&self.namespace, &self.subsystem) {
            (Some(ns), Some(ss)) => format!("{ns}_{ss}_{sanitized}"),
            (Some(ns), None) => format!("{ns}_{sanitized}"),
            (None, Some(ss)) => format!("{ss}_{sanitized}"),
            (None, None) => sanitized,
        }
    }

    /// Renders `counters` to Prometheus exposition format.
    ///
    /// # Errors
    ///
    /// Fails if two counters map to the same metric name after sanitizing,
    /// or if a metric cannot be created or encoded.
    pub fn render(&self, counters: &[CounterSnapshot]) -> Result<String> {
        let registry = Registry::new();

        for counter in counters {
            let full_name = self.build_full_name(&counter.name);
            let config = self.metric_configs.get(&counter.name);
            let metric_type = config.map(|c| c.metric_type).unwrap_or(self.default_type);
            let help = config
                .and_then(|c| c.help.clone())
                .unwrap_or_else(|| format!("{} total", counter.name));

            let mut labels = self.const_labels.clone();
            if let Some(cfg) = config {
                labels.extend(cfg.labels.clone());
            }

            match metric_type {
                MetricType::Counter => {
                    let value = counter.value.max(0) as u64;
                    Self::register_counter(&registry, &full_name, &help, &labels, value)?;
                }
                MetricType::Gauge => {
                    Self::register_gauge(&registry, &full_name, &help, &labels, counter.value)?;
                }
            }

            if self.shard_gauges {
                Self::register_gauge(
                    &registry,
                    &format!("{full_name}_shards"),
                    &format!("shard fanout of {}", counter.name),
                    &labels,
                    i64::from(counter.shards),
                )?;
            }
        }

        Self::encode_registry(&registry)
    }

    /// Renders `counters` to bytes, ready for an HTTP response body.
    pub fn render_bytes(&self, counters: &[CounterSnapshot]) -> Result<Vec<u8>> {
        Ok(self.render(counters)?.into_bytes())
    }

    fn encode_registry(registry: &Registry) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PrometheusError::EncodeError(e.to_string()))?;
        Ok(String::from_utf8(buffer)?)
    }

    fn register_counter(
        registry: &Registry,
        name: &str,
        help: &str,
        labels: &HashMap<String, String>,
        value: u64,
    ) -> Result<()> {
        if labels.is_empty() {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        } else {
            let label_names: Vec<&str> = labels.keys().map(|s| s.as_str()).collect();
            let counter =
                prometheus::IntCounterVec::new(prometheus::Opts::new(name, help), &label_names)?;
            let label_values: Vec<&str> = labels.values().map(|s| s.as_str()).collect();
            counter.with_label_values(&label_values).inc_by(value);
            registry.register(Box::new(counter))?;
        }
        Ok(())
    }

    fn register_gauge(
        registry: &Registry,
        name: &str,
        help: &str,
        labels: &HashMap<String, String>,
        value: i64,
    ) -> Result<()> {
        if labels.is_empty() {
            let gauge = IntGauge::new(name, help)?;
            gauge.set(value);
            registry.register(Box::new(gauge))?;
        } else {
            let label_names: Vec<&str> = labels.keys().map(|s| s.as_str()).collect();
            let gauge =
                prometheus::IntGaugeVec::new(prometheus::Opts::new(name, help), &label_names)?;
            let label_values: Vec<&str> = labels.values().map(|s| s.as_str()).collect();
            gauge.with_label_values(&label_values).set(value);
            registry.register(Box::new(gauge))?;
        }
        Ok(())
    }
}

//! Bounded in-memory metric collection.
//!
//! Samples are kept in per-name ring buffers capped at `max_per_name`;
//! when a buffer is full the oldest sample is evicted and counted in
//! `dropped_count`. Identity is the metric *name* alone: samples of
//! different kinds or label sets recorded under one name share a buffer,
//! and the exporters use the kind of the most recent sample.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::error::Result;

/// Smoothing factor for the collection-latency moving average.
const LATENCY_EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Summary statistics over one metric's buffered values.
///
/// An empty buffer yields the all-zero struct rather than NaNs, so the
/// result is always safe to serialize and compare.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Time-range and label filters for [`MetricCollector::query`].
#[derive(Debug, Clone, Default)]
pub struct MetricQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub labels: Option<HashMap<String, String>>,
}

/// Rank-based percentile over an ascending-sorted slice.
///
/// `p <= 0` selects the minimum, `p >= 1` the maximum, anything between
/// the element at `floor(len * p)` clamped into range. An empty slice
/// yields NaN as the "no data" sentinel.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[sorted.len() - 1];
    }
    let index = ((sorted.len() as f64 * p).floor() as usize).min(sorted.len() - 1);
    sorted[index]
}

#[derive(Debug)]
struct CollectorInner {
    series: HashMap<String, VecDeque<MetricSample>>,
    help: HashMap<String, String>,
    max_per_name: usize,
    dropped: u64,
    total_recorded: u64,
    collection_latency_ms: f64,
    metrics_per_second: f64,
    last_tick_total: u64,
    last_tick: Instant,
}

/// Bounded metric store with statistical queries and deterministic
/// Prometheus/JSON export.
#[derive(Debug, Clone)]
pub struct MetricCollector {
    inner: Arc<RwLock<CollectorInner>>,
}

impl MetricCollector {
    pub fn new(config: &MetricsConfig) -> Self {
        Self::with_capacity(config.max_per_name)
    }

    pub fn with_capacity(max_per_name: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CollectorInner {
                series: HashMap::new(),
                help: HashMap::new(),
                max_per_name: max_per_name.max(1),
                dropped: 0,
                total_recorded: 0,
                collection_latency_ms: 0.0,
                metrics_per_second: 0.0,
                last_tick_total: 0,
                last_tick: Instant::now(),
            })),
        }
    }

    /// Append a sample without labels.
    pub fn record(&self, name: &str, kind: MetricKind, value: f64) {
        self.record_sample(MetricSample {
            name: name.to_string(),
            kind,
            value,
            timestamp: Utc::now(),
            labels: HashMap::new(),
            unit: None,
        });
    }

    /// Append a sample with labels.
    pub fn record_with_labels(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        labels: HashMap<String, String>,
    ) {
        self.record_sample(MetricSample {
            name: name.to_string(),
            kind,
            value,
            timestamp: Utc::now(),
            labels,
            unit: None,
        });
    }

    /// Append a fully-specified sample, evicting the oldest entry of the
    /// same name when the buffer is at capacity.
    pub fn record_sample(&self, sample: MetricSample) {
        let started = Instant::now();
        let Ok(mut inner) = self.inner.write() else {
            warn!("metric store lock poisoned, dropping sample {}", sample.name);
            return;
        };

        let max = inner.max_per_name;
        let at_capacity = inner
            .series
            .get(&sample.name)
            .is_some_and(|b| b.len() >= max);
        if at_capacity {
            if let Some(buffer) = inner.series.get_mut(&sample.name) {
                buffer.pop_front();
            }
            inner.dropped += 1;
            debug!("evicted oldest sample of {}", sample.name);
        }

        inner
            .series
            .entry(sample.name.clone())
            .or_default()
            .push_back(sample);
        inner.total_recorded += 1;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        inner.collection_latency_ms = (1.0 - LATENCY_EMA_ALPHA) * inner.collection_latency_ms
            + LATENCY_EMA_ALPHA * elapsed_ms;
    }

    /// Return the buffered samples for `name` matching the filter.
    ///
    /// Label filters require an exact match on every supplied key; an
    /// unknown name yields an empty vec, never an error.
    pub fn query(&self, name: &str, query: &MetricQuery) -> Vec<MetricSample> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let Some(buffer) = inner.series.get(name) else {
            return Vec::new();
        };

        buffer
            .iter()
            .filter(|sample| {
                if let Some(start) = query.start {
                    if sample.timestamp < start {
                        return false;
                    }
                }
                if let Some(end) = query.end {
                    if sample.timestamp > end {
                        return false;
                    }
                }
                if let Some(labels) = &query.labels {
                    for (key, value) in labels {
                        if sample.labels.get(key) != Some(value) {
                            return false;
                        }
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Summary statistics for one metric. Empty input returns the
    /// all-zero struct.
    pub fn stats(&self, name: &str) -> MetricStats {
        let values: Vec<f64> = {
            let Ok(inner) = self.inner.read() else {
                return MetricStats::default();
            };
            match inner.series.get(name) {
                Some(buffer) => buffer.iter().map(|s| s.value).collect(),
                None => return MetricStats::default(),
            }
        };

        if values.is_empty() {
            return MetricStats::default();
        }

        let mut sorted = values;
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();

        MetricStats {
            count,
            sum,
            avg: sum / count as f64,
            min: sorted[0],
            max: sorted[count - 1],
            p50: percentile(&sorted, 0.5),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        }
    }

    /// Recompute the recording rate since the previous tick. Driven by
    /// the sampler's periodic loop, but callable directly.
    pub fn tick(&self) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        let elapsed = inner.last_tick.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let recorded = inner.total_recorded - inner.last_tick_total;
            inner.metrics_per_second = recorded as f64 / elapsed;
        }
        inner.last_tick_total = inner.total_recorded;
        inner.last_tick = Instant::now();
        debug!(
            rate = inner.metrics_per_second,
            total = inner.total_recorded,
            "metric tick"
        );
    }

    /// Attach a `# HELP` description emitted by the Prometheus exporter.
    pub fn register_help(&self, name: &str, text: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.help.insert(name.to_string(), text.to_string());
        }
    }

    /// Prometheus text exposition: per name, an optional `# HELP` line, a
    /// `# TYPE` line using the most recent sample's kind, then one line
    /// per sample with sorted labels and a millisecond timestamp.
    pub fn export_prometheus(&self) -> String {
        let Ok(inner) = self.inner.read() else {
            return String::new();
        };

        let mut names: Vec<&String> = inner.series.keys().collect();
        names.sort();

        let mut out = String::new();
        for name in names {
            let buffer = &inner.series[name];
            let Some(latest) = buffer.back() else {
                continue;
            };

            if let Some(help) = inner.help.get(name) {
                out.push_str(&format!("# HELP {name} {help}\n"));
            }
            out.push_str(&format!("# TYPE {name} {}\n", latest.kind.as_str()));

            for sample in buffer {
                let labels = format_labels(&sample.labels);
                out.push_str(&format!(
                    "{name}{labels} {} {}\n",
                    sample.value,
                    sample.timestamp.timestamp_millis()
                ));
            }
        }
        out
    }

    /// JSON export: `{"<metric>": [{type, value, timestamp, labels}]}`,
    /// names in sorted order.
    pub fn export_json(&self) -> Result<String> {
        let Ok(inner) = self.inner.read() else {
            return Ok("{}".to_string());
        };

        let mut export: BTreeMap<&str, Vec<serde_json::Value>> = BTreeMap::new();
        for (name, buffer) in &inner.series {
            let samples = buffer
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "type": s.kind.as_str(),
                        "value": s.value,
                        "timestamp": s.timestamp.timestamp_millis(),
                        "labels": s.labels,
                    })
                })
                .collect();
            export.insert(name.as_str(), samples);
        }

        Ok(serde_json::to_string(&export)?)
    }

    /// All metric names with at least one buffered sample, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let mut names: Vec<String> = inner.series.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.read().map(|i| i.dropped).unwrap_or(0)
    }

    pub fn total_recorded(&self) -> u64 {
        self.inner.read().map(|i| i.total_recorded).unwrap_or(0)
    }

    pub fn metrics_per_second(&self) -> f64 {
        self.inner.read().map(|i| i.metrics_per_second).unwrap_or(0.0)
    }

    pub fn collection_latency_ms(&self) -> f64 {
        self.inner
            .read()
            .map(|i| i.collection_latency_ms)
            .unwrap_or(0.0)
    }

    /// Drop all buffered samples and reset every counter.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.series.clear();
            inner.dropped = 0;
            inner.total_recorded = 0;
            inner.collection_latency_ms = 0.0;
            inner.metrics_per_second = 0.0;
            inner.last_tick_total = 0;
            inner.last_tick = Instant::now();
        }
    }
}

fn format_labels(labels: &HashMap<String, String>) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let sorted: BTreeMap<&String, &String> = labels.iter().collect();
    let parts: Vec<String> = sorted
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{{{}}}", parts.join(","))
}

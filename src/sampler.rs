//! Process-level performance sampling and threshold evaluation.
//!
//! The sampler reads CPU time, memory, and scheduler lag from a
//! [`RuntimeProbe`], stores each reading in the shared
//! [`MetricCollector`], and classifies readings against registered
//! [`PerformanceThreshold`]s. The host runtime supplies the raw signals;
//! everything here is just delta math and bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::events::{EventBus, MonitorEvent};
use crate::metrics::{MetricCollector, MetricKind, MetricQuery};

pub const CPU_METRIC: &str = "cpu_usage_percent";
pub const HEAP_USED_METRIC: &str = "memory_heap_used_bytes";
pub const HEAP_TOTAL_METRIC: &str = "memory_heap_total_bytes";
pub const RSS_METRIC: &str = "memory_rss_bytes";
pub const HEAP_PERCENT_METRIC: &str = "heap_usage_percent";
pub const EVENT_LOOP_LAG_METRIC: &str = "event_loop_lag_ms";

/// Cumulative process CPU time in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user_us: u64,
    pub system_us: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user_us + self.system_us
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryReading {
    /// Bytes resident for this process (heap-used analogue).
    pub used_bytes: u64,
    /// Total memory available to the process (heap-total analogue).
    pub total_bytes: u64,
    pub rss_bytes: u64,
}

/// Runtime signal source. The hosting runtime supplies cumulative CPU
/// counters, memory readings, and uptime; tests inject a scripted fake.
pub trait RuntimeProbe: Send + Sync {
    fn cpu_times(&self) -> CpuTimes;
    fn memory(&self) -> MemoryReading;
    fn uptime(&self) -> Duration;
}

/// Default probe backed by `getrusage` (unix) and sysinfo.
pub struct SystemProbe {
    started: Instant,
    system: Mutex<sysinfo::System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeProbe for SystemProbe {
    #[cfg(unix)]
    fn cpu_times(&self) -> CpuTimes {
        use nix::sys::resource::{getrusage, UsageWho};
        match getrusage(UsageWho::RUSAGE_SELF) {
            Ok(usage) => {
                let user = usage.user_time();
                let system = usage.system_time();
                CpuTimes {
                    user_us: user.tv_sec().max(0) as u64 * 1_000_000 + user.tv_usec().max(0) as u64,
                    system_us: system.tv_sec().max(0) as u64 * 1_000_000
                        + system.tv_usec().max(0) as u64,
                }
            }
            Err(e) => {
                warn!("getrusage failed: {e}");
                CpuTimes::default()
            }
        }
    }

    #[cfg(not(unix))]
    fn cpu_times(&self) -> CpuTimes {
        CpuTimes::default()
    }

    fn memory(&self) -> MemoryReading {
        let Ok(mut system) = self.system.lock() else {
            return MemoryReading::default();
        };
        system.refresh_memory();

        let rss = match sysinfo::get_current_pid() {
            Ok(pid) => {
                system.refresh_process(pid);
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            Err(_) => 0,
        };

        MemoryReading {
            used_bytes: rss,
            total_bytes: system.total_memory(),
            rss_bytes: rss,
        }
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOp {
    Gt,
    Lt,
    Eq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceThreshold {
    pub metric: String,
    pub warning: f64,
    pub critical: f64,
    pub operator: ThresholdOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdViolation {
    pub metric: String,
    pub value: f64,
    pub level: ViolationLevel,
    pub threshold: PerformanceThreshold,
    pub timestamp: DateTime<Utc>,
}

/// Classify `value` against a threshold. The critical bound is checked
/// first, so a value past both bounds reports the tighter violation.
pub fn evaluate_threshold(value: f64, threshold: &PerformanceThreshold) -> Option<ViolationLevel> {
    let exceeds = |bound: f64| match threshold.operator {
        ThresholdOp::Gt => value > bound,
        ThresholdOp::Lt => value < bound,
        ThresholdOp::Eq => (value - bound).abs() < f64::EPSILON,
    };

    if exceeds(threshold.critical) {
        Some(ViolationLevel::Critical)
    } else if exceeds(threshold.warning) {
        Some(ViolationLevel::Warning)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricState {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub state: MetricState,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReportSummary {
    pub total: usize,
    pub normal: usize,
    pub warning: usize,
    pub critical: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub metrics: Vec<ReportEntry>,
    pub violations: Vec<ThresholdViolation>,
    pub summary: ReportSummary,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerfSnapshot {
    pub cpu_percent: f64,
    pub memory: MemoryReading,
    pub heap_percent: f64,
    pub event_loop_lag_ms: f64,
    pub uptime_secs: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct CpuBaseline {
    times: CpuTimes,
    at: Instant,
}

#[derive(Debug, Default)]
struct SamplerState {
    /// Baseline for the periodic/explicit `sample_cpu` path.
    cpu_baseline: Option<CpuBaseline>,
    /// Independent baseline so `snapshot` never perturbs periodic deltas.
    snapshot_baseline: Option<CpuBaseline>,
    last_lag_ms: f64,
    thresholds: HashMap<String, PerformanceThreshold>,
}

#[derive(Clone)]
pub struct PerformanceSampler {
    metrics: MetricCollector,
    probe: Arc<dyn RuntimeProbe>,
    events: EventBus,
    state: Arc<RwLock<SamplerState>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PerformanceSampler {
    pub fn new(metrics: MetricCollector, events: EventBus) -> Self {
        Self::with_probe(metrics, events, Arc::new(SystemProbe::new()))
    }

    pub fn with_probe(
        metrics: MetricCollector,
        events: EventBus,
        probe: Arc<dyn RuntimeProbe>,
    ) -> Self {
        Self {
            metrics,
            probe,
            events,
            state: Arc::new(RwLock::new(SamplerState::default())),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Register (or replace) the threshold for a metric name.
    pub fn set_threshold(&self, threshold: PerformanceThreshold) {
        if let Ok(mut state) = self.state.write() {
            state.thresholds.insert(threshold.metric.clone(), threshold);
        }
    }

    pub fn remove_threshold(&self, metric: &str) {
        if let Ok(mut state) = self.state.write() {
            state.thresholds.remove(metric);
        }
    }

    /// CPU usage since the previous call as a percentage of wall time.
    ///
    /// The first call has no baseline and reports 0 while storing one.
    /// A zero wall-clock delta also reports 0 rather than dividing.
    pub fn sample_cpu(&self) -> f64 {
        let times = self.probe.cpu_times();
        let now = Instant::now();

        let percent = {
            let Ok(mut state) = self.state.write() else {
                return 0.0;
            };
            let percent = match state.cpu_baseline {
                None => 0.0,
                Some(baseline) => {
                    let wall_us = now.duration_since(baseline.at).as_micros() as f64;
                    if wall_us == 0.0 {
                        0.0
                    } else {
                        let used_us = times.total().saturating_sub(baseline.times.total());
                        used_us as f64 / wall_us * 100.0
                    }
                }
            };
            state.cpu_baseline = Some(CpuBaseline { times, at: now });
            percent
        };

        self.metrics.record(CPU_METRIC, MetricKind::Gauge, percent);
        self.check_threshold(CPU_METRIC, percent);
        percent
    }

    /// Record heap-used/heap-total/RSS gauges and evaluate the heap
    /// percentage against its threshold.
    pub fn sample_memory(&self) -> MemoryReading {
        let reading = self.probe.memory();

        self.metrics
            .record(HEAP_USED_METRIC, MetricKind::Gauge, reading.used_bytes as f64);
        self.metrics.record(
            HEAP_TOTAL_METRIC,
            MetricKind::Gauge,
            reading.total_bytes as f64,
        );
        self.metrics
            .record(RSS_METRIC, MetricKind::Gauge, reading.rss_bytes as f64);

        let heap_percent = heap_percent(&reading);
        self.metrics
            .record(HEAP_PERCENT_METRIC, MetricKind::Gauge, heap_percent);
        self.check_threshold(HEAP_PERCENT_METRIC, heap_percent);

        reading
    }

    /// Measure scheduler lag with a single deferred resumption: note the
    /// time, yield once past the current scheduler turn, and record how
    /// long the round trip took.
    pub async fn sample_event_loop_lag(&self) -> f64 {
        let scheduled = Instant::now();
        tokio::task::yield_now().await;
        let lag_ms = scheduled.elapsed().as_secs_f64() * 1000.0;

        self.metrics
            .record(EVENT_LOOP_LAG_METRIC, MetricKind::Histogram, lag_ms);
        self.check_threshold(EVENT_LOOP_LAG_METRIC, lag_ms);

        if let Ok(mut state) = self.state.write() {
            state.last_lag_ms = lag_ms;
        }
        lag_ms
    }

    /// Record an operation latency and evaluate it against the
    /// `<op>_latency_ms` threshold, if registered.
    pub fn record_latency(&self, op: &str, ms: f64) {
        let metric = format!("{op}_latency_ms");
        self.metrics.record(&metric, MetricKind::Histogram, ms);
        self.check_threshold(&metric, ms);
    }

    pub fn record_throughput(&self, op: &str, count: f64) {
        let metric = format!("{op}_throughput");
        self.metrics.record(&metric, MetricKind::Counter, count);
        self.check_threshold(&metric, count);
    }

    /// Error rate as a percentage; zero when no operations were seen.
    pub fn record_error_rate(&self, op: &str, errors: u64, total: u64) {
        let rate = if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64 * 100.0
        };
        let metric = format!("{op}_error_rate_percent");
        self.metrics.record(&metric, MetricKind::Gauge, rate);
        self.check_threshold(&metric, rate);
    }

    /// Classify the latest sample of every metric active in the window.
    pub fn report(&self, window: Duration) -> PerformanceReport {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(window.as_millis() as i64);
        let thresholds: HashMap<String, PerformanceThreshold> = self
            .state
            .read()
            .map(|s| s.thresholds.clone())
            .unwrap_or_default();

        let mut entries = Vec::new();
        let mut violations = Vec::new();
        let mut summary = ReportSummary::default();

        for name in self.metrics.metric_names() {
            let samples = self.metrics.query(
                &name,
                &MetricQuery {
                    start: Some(cutoff),
                    ..Default::default()
                },
            );
            let Some(latest) = samples.last() else {
                continue;
            };

            let state = match thresholds.get(&name).and_then(|t| {
                evaluate_threshold(latest.value, t).map(|level| {
                    violations.push(ThresholdViolation {
                        metric: name.clone(),
                        value: latest.value,
                        level,
                        threshold: t.clone(),
                        timestamp: latest.timestamp,
                    });
                    level
                })
            }) {
                Some(ViolationLevel::Critical) => MetricState::Critical,
                Some(ViolationLevel::Warning) => MetricState::Warning,
                None => MetricState::Normal,
            };

            summary.total += 1;
            match state {
                MetricState::Normal => summary.normal += 1,
                MetricState::Warning => summary.warning += 1,
                MetricState::Critical => summary.critical += 1,
            }

            entries.push(ReportEntry {
                metric: name,
                value: latest.value,
                timestamp: latest.timestamp,
                state,
            });
        }

        PerformanceReport {
            metrics: entries,
            violations,
            summary,
            generated_at: Utc::now(),
        }
    }

    /// Read-only view of current cpu/memory/lag/uptime.
    ///
    /// Uses its own CPU baseline, independent of `sample_cpu`, so ad hoc
    /// snapshots never perturb the periodic deltas; like `sample_cpu`,
    /// the first call reports 0 CPU while establishing that baseline.
    pub fn snapshot(&self) -> PerfSnapshot {
        let times = self.probe.cpu_times();
        let now = Instant::now();
        let memory = self.probe.memory();

        let (cpu_percent, last_lag_ms) = {
            let Ok(mut state) = self.state.write() else {
                return PerfSnapshot {
                    cpu_percent: 0.0,
                    memory,
                    heap_percent: heap_percent(&memory),
                    event_loop_lag_ms: 0.0,
                    uptime_secs: self.probe.uptime().as_secs_f64(),
                    timestamp: Utc::now(),
                };
            };
            let percent = match state.snapshot_baseline {
                None => 0.0,
                Some(baseline) => {
                    let wall_us = now.duration_since(baseline.at).as_micros() as f64;
                    if wall_us == 0.0 {
                        0.0
                    } else {
                        let used_us = times.total().saturating_sub(baseline.times.total());
                        used_us as f64 / wall_us * 100.0
                    }
                }
            };
            state.snapshot_baseline = Some(CpuBaseline { times, at: now });
            (percent, state.last_lag_ms)
        };

        PerfSnapshot {
            cpu_percent,
            memory,
            heap_percent: heap_percent(&memory),
            event_loop_lag_ms: last_lag_ms,
            uptime_secs: self.probe.uptime().as_secs_f64(),
            timestamp: Utc::now(),
        }
    }

    /// Spawn the periodic sampling loop: CPU, memory, and scheduler lag
    /// each tick, plus the metric-rate tick. Replaces any running loop.
    pub fn start(&self, every: Duration) {
        let sampler = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sampler.sample_cpu();
                sampler.sample_memory();
                sampler.sample_event_loop_lag().await;
                sampler.metrics.tick();
            }
        });

        if let Ok(mut task) = self.task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }
        info!("performance sampler started, interval {every:?}");
    }

    /// Stop the periodic loop. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
                info!("performance sampler shut down");
            }
        }
    }

    fn check_threshold(&self, metric: &str, value: f64) -> Option<ThresholdViolation> {
        let threshold = self
            .state
            .read()
            .ok()
            .and_then(|s| s.thresholds.get(metric).cloned())?;
        let level = evaluate_threshold(value, &threshold)?;

        match level {
            ViolationLevel::Warning => {
                warn!("{metric} = {value:.2} exceeded warning bound {}", threshold.warning)
            }
            ViolationLevel::Critical => {
                error!(
                    "{metric} = {value:.2} exceeded critical bound {}",
                    threshold.critical
                )
            }
        }

        let violation = ThresholdViolation {
            metric: metric.to_string(),
            value,
            level,
            threshold,
            timestamp: Utc::now(),
        };
        self.events
            .emit(MonitorEvent::ThresholdViolated(violation.clone()));
        Some(violation)
    }
}

fn heap_percent(reading: &MemoryReading) -> f64 {
    if reading.total_bytes == 0 {
        0.0
    } else {
        reading.used_bytes as f64 / reading.total_bytes as f64 * 100.0
    }
}

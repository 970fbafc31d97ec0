//! Vigil: in-process observability for long-running services.
//!
//! Four cooperating components, each usable on its own:
//!
//! - [`MetricCollector`]: bounded time-series storage with percentile
//!   stats and Prometheus/JSON export
//! - [`HealthOrchestrator`]: registered health checks raced against
//!   per-check timeouts, rolled up into a system verdict
//! - [`PerformanceSampler`]: periodic CPU, memory, and event-loop lag
//!   sampling with threshold evaluation
//! - [`AlertEngine`]: predicate rules with cooldowns, alert lifecycle,
//!   and pluggable notification delivery
//!
//! Cross-component signals (threshold violations, health transitions,
//! dispatch failures) flow over a shared [`EventBus`].
//!
//! ```no_run
//! use vigil::{EventBus, MetricCollector, MetricKind, MonitorConfig, PerformanceSampler};
//!
//! # async fn demo() {
//! let config = MonitorConfig::default();
//! let events = EventBus::default();
//! let metrics = MetricCollector::new(&config.metrics);
//! let sampler = PerformanceSampler::new(metrics.clone(), events.clone());
//!
//! metrics.record("requests_total", MetricKind::Counter, 1.0);
//! sampler.start(config.sampler.sample_interval());
//! # }
//! ```

pub mod alerts;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod sampler;

pub use alerts::{
    Alert, AlertEngine, AlertRule, AlertSeverity, AlertStats, AlertStatus, ChannelKind,
    HistoryFilter, MessageTemplate, NotificationChannel, NotificationSender, UnimplementedSender,
};
pub use config::{AlertsConfig, HealthConfig, MetricsConfig, MonitorConfig, SamplerConfig};
pub use error::{MonitorError, Result};
pub use events::{EventBus, MonitorEvent};
pub use health::{
    check_fn, CheckOutcome, HealthCheck, HealthCheckConfig, HealthOrchestrator, HealthResult,
    HealthStatus, SystemHealth,
};
pub use metrics::{MetricCollector, MetricKind, MetricQuery, MetricSample, MetricStats};
pub use sampler::{
    MetricState, PerfSnapshot, PerformanceReport, PerformanceSampler, PerformanceThreshold,
    ReportEntry, ReportSummary, RuntimeProbe, SystemProbe, ThresholdOp, ThresholdViolation,
    ViolationLevel,
};

//! Health-check orchestration.
//!
//! Each registered check runs raced against its timeout. A per-run
//! settled flag shared by the completion path and the timeout path
//! guarantees exactly one outcome is stored: whichever side loses the
//! race observes the flag and leaves the stored result alone, so a check
//! that resolves after its timeout can never overwrite the timeout
//! result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{MonitorError, Result};
use crate::events::{EventBus, MonitorEvent};

pub const TIMEOUT_MESSAGE: &str = "Health check timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// What a check function reports back on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl CheckOutcome {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
            metadata: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// External-collaborator contract for a single health probe.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> anyhow::Result<CheckOutcome>;
}

struct FnCheck<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> HealthCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<CheckOutcome>> + Send,
{
    async fn check(&self) -> anyhow::Result<CheckOutcome> {
        (self.f)().await
    }
}

/// Adapt an async closure into a [`HealthCheck`].
pub fn check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<CheckOutcome>> + Send + 'static,
{
    Arc::new(FnCheck { f })
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub name: String,
    /// When set, the check also runs on its own periodic timer.
    pub interval: Option<Duration>,
    pub timeout: Duration,
    /// A critical check failing alone forces overall status to unhealthy.
    pub critical: bool,
}

impl HealthCheckConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: None,
            timeout: Duration::from_millis(5000),
            critical: false,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Aggregate of the latest result per check plus the derived overall
/// status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: HashMap<String, HealthResult>,
}

struct RegisteredCheck {
    config: HealthCheckConfig,
    check: Arc<dyn HealthCheck>,
    timer: Option<JoinHandle<()>>,
}

struct OrchestratorInner {
    checks: tokio::sync::RwLock<HashMap<String, RegisteredCheck>>,
    results: tokio::sync::RwLock<HashMap<String, HealthResult>>,
    events: EventBus,
}

#[derive(Clone)]
pub struct HealthOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl HealthOrchestrator {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                checks: tokio::sync::RwLock::new(HashMap::new()),
                results: tokio::sync::RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Register a check. If the config carries an interval, the check
    /// also starts running on its own timer immediately.
    pub async fn register(&self, config: HealthCheckConfig, check: Arc<dyn HealthCheck>) {
        let name = config.name.clone();
        let timer = config.interval.map(|every| self.spawn_timer(name.clone(), every));

        let mut checks = self.inner.checks.write().await;
        if let Some(previous) = checks.insert(
            name.clone(),
            RegisteredCheck {
                config,
                check,
                timer,
            },
        ) {
            if let Some(handle) = previous.timer {
                handle.abort();
            }
            info!("replaced health check {name}");
        } else {
            info!("registered health check {name}");
        }
    }

    /// Remove a check, cancel its timer, and forget its last result.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let removed = self.inner.checks.write().await.remove(name);
        match removed {
            Some(entry) => {
                if let Some(handle) = entry.timer {
                    handle.abort();
                }
                self.inner.results.write().await.remove(name);
                info!("unregistered health check {name}");
                Ok(())
            }
            None => Err(MonitorError::CheckNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Run one check, racing it against its timeout. Exactly one result
    /// is recorded per run; check failure or timeout yields a normal
    /// unhealthy result rather than an error.
    pub async fn run_check(&self, name: &str) -> Result<HealthResult> {
        let (check, config) = {
            let checks = self.inner.checks.read().await;
            let entry = checks.get(name).ok_or_else(|| MonitorError::CheckNotFound {
                name: name.to_string(),
            })?;
            (entry.check.clone(), entry.config.clone())
        };

        let settled = Arc::new(AtomicBool::new(false));
        let started = Instant::now();
        let (tx, rx) = tokio::sync::oneshot::channel::<HealthResult>();

        // Completion path. The check keeps running even if the timeout
        // fires first; the settled flag makes a late completion a no-op.
        {
            let settled = Arc::clone(&settled);
            let inner = Arc::clone(&self.inner);
            let name = name.to_string();
            tokio::spawn(async move {
                let outcome = check.check().await;
                let duration_ms = started.elapsed().as_millis() as u64;
                let result = match outcome {
                    Ok(outcome) => HealthResult {
                        name: name.clone(),
                        status: if outcome.healthy {
                            HealthStatus::Healthy
                        } else {
                            HealthStatus::Unhealthy
                        },
                        message: outcome.message,
                        timestamp: Utc::now(),
                        duration_ms,
                        metadata: outcome.metadata,
                    },
                    Err(e) => HealthResult {
                        name: name.clone(),
                        status: HealthStatus::Unhealthy,
                        message: Some(e.to_string()),
                        timestamp: Utc::now(),
                        duration_ms,
                        metadata: None,
                    },
                };
                if !settled.swap(true, Ordering::SeqCst) {
                    Self::store_result(&inner, result.clone()).await;
                    let _ = tx.send(result);
                } else {
                    debug!("check {name} completed after timeout, result discarded");
                }
            });
        }

        // Timeout path.
        match tokio::time::timeout(config.timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                // The check task aborted before sending (e.g. panicked).
                let result = HealthResult {
                    name: name.to_string(),
                    status: HealthStatus::Unhealthy,
                    message: Some("Health check aborted".to_string()),
                    timestamp: Utc::now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    metadata: None,
                };
                if !settled.swap(true, Ordering::SeqCst) {
                    Self::store_result(&self.inner, result.clone()).await;
                }
                Ok(result)
            }
            Err(_elapsed) => {
                if !settled.swap(true, Ordering::SeqCst) {
                    let result = HealthResult {
                        name: name.to_string(),
                        status: HealthStatus::Unhealthy,
                        message: Some(TIMEOUT_MESSAGE.to_string()),
                        timestamp: Utc::now(),
                        duration_ms: config.timeout.as_millis() as u64,
                        metadata: None,
                    };
                    warn!("health check {name} timed out after {:?}", config.timeout);
                    Self::store_result(&self.inner, result.clone()).await;
                    Ok(result)
                } else {
                    // The check settled in the same instant the timer
                    // fired; the stored result wins.
                    let stored = self.inner.results.read().await.get(name).cloned();
                    Ok(stored.unwrap_or(HealthResult {
                        name: name.to_string(),
                        status: HealthStatus::Unknown,
                        message: None,
                        timestamp: Utc::now(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        metadata: None,
                    }))
                }
            }
        }
    }

    /// Run every registered check concurrently and return the full
    /// result set.
    pub async fn run_all(&self) -> Vec<HealthResult> {
        let names: Vec<String> = self.inner.checks.read().await.keys().cloned().collect();
        let runs = names.iter().map(|name| self.run_check(name));
        join_all(runs)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect()
    }

    /// Re-run everything and derive the overall status: a failing
    /// critical check forces unhealthy, any other failure or degradation
    /// yields degraded, a full set of passes is healthy, anything else
    /// (including an empty check set) is unknown.
    pub async fn system_health(&self) -> SystemHealth {
        let results = self.run_all().await;
        let criticality: HashMap<String, bool> = {
            let checks = self.inner.checks.read().await;
            checks
                .iter()
                .map(|(name, entry)| (name.clone(), entry.config.critical))
                .collect()
        };

        let mut critical_unhealthy = false;
        let mut any_unhealthy = false;
        let mut any_degraded = false;
        let mut any_unknown = false;

        for result in &results {
            match result.status {
                HealthStatus::Unhealthy => {
                    any_unhealthy = true;
                    if criticality.get(&result.name).copied().unwrap_or(false) {
                        critical_unhealthy = true;
                        error!(
                            "critical health check {} is unhealthy: {:?}",
                            result.name, result.message
                        );
                    }
                }
                HealthStatus::Degraded => any_degraded = true,
                HealthStatus::Unknown => any_unknown = true,
                HealthStatus::Healthy => {}
            }
        }

        let status = if results.is_empty() {
            HealthStatus::Unknown
        } else if critical_unhealthy {
            HealthStatus::Unhealthy
        } else if any_unhealthy || any_degraded {
            HealthStatus::Degraded
        } else if any_unknown {
            HealthStatus::Unknown
        } else {
            HealthStatus::Healthy
        };

        SystemHealth {
            status,
            timestamp: Utc::now(),
            checks: results.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    /// Latest stored result per check without re-running anything.
    pub async fn last_results(&self) -> HashMap<String, HealthResult> {
        self.inner.results.read().await.clone()
    }

    /// Cancel every periodic timer. Safe to call more than once.
    pub async fn shutdown(&self) {
        let mut checks = self.inner.checks.write().await;
        for entry in checks.values_mut() {
            if let Some(handle) = entry.timer.take() {
                handle.abort();
            }
        }
        info!("health orchestrator shut down");
    }

    fn spawn_timer(&self, name: String, every: Duration) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately; skip it so registration
            // does not race the caller's own first run_check.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.run_check(&name).await {
                    error!("periodic health check {name} failed to run: {e}");
                }
            }
        })
    }

    async fn store_result(inner: &Arc<OrchestratorInner>, result: HealthResult) {
        let previous = {
            let mut results = inner.results.write().await;
            results.insert(result.name.clone(), result.clone())
        };

        let previous_status = previous.map(|r| r.status).unwrap_or(HealthStatus::Unknown);
        if previous_status != result.status {
            debug!(
                "health check {} transitioned {previous_status:?} -> {:?}",
                result.name, result.status
            );
            inner.events.emit(MonitorEvent::HealthChanged {
                check: result.name.clone(),
                previous: previous_status,
                current: result.status,
                timestamp: result.timestamp,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn orchestrator() -> HealthOrchestrator {
        HealthOrchestrator::new(EventBus::default())
    }

    #[tokio::test]
    async fn test_healthy_check_records_result() {
        let health = orchestrator();
        health
            .register(
                HealthCheckConfig::new("db"),
                check_fn(|| async { Ok(CheckOutcome::healthy()) }),
            )
            .await;

        let result = health.run_check("db").await.unwrap();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(health.last_results().await["db"].status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failing_check_becomes_unhealthy_result() {
        let health = orchestrator();
        health
            .register(
                HealthCheckConfig::new("db"),
                check_fn(|| async { Err(anyhow::anyhow!("connection refused")) }),
            )
            .await;

        let result = health.run_check("db").await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.message.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_unknown_check_is_not_found() {
        let health = orchestrator();
        let err = health.run_check("nope").await.unwrap_err();
        assert!(matches!(err, MonitorError::CheckNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_settling_check_times_out_once() {
        let health = orchestrator();
        health
            .register(
                HealthCheckConfig::new("stuck").timeout(Duration::from_millis(50)),
                check_fn(|| async {
                    std::future::pending::<()>().await;
                    Ok(CheckOutcome::healthy())
                }),
            )
            .await;

        let result = health.run_check("stuck").await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.message.as_deref(), Some(TIMEOUT_MESSAGE));

        let stored = health.last_results().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["stuck"].message.as_deref(), Some(TIMEOUT_MESSAGE));
    }

    #[tokio::test]
    async fn test_late_completion_does_not_overwrite_timeout() {
        let health = orchestrator();
        health
            .register(
                HealthCheckConfig::new("slow").timeout(Duration::from_millis(20)),
                check_fn(|| async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(CheckOutcome::healthy())
                }),
            )
            .await;

        let result = health.run_check("slow").await.unwrap();
        assert_eq!(result.message.as_deref(), Some(TIMEOUT_MESSAGE));

        // Let the check finish well past its timeout.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let stored = health.last_results().await;
        assert_eq!(stored["slow"].status, HealthStatus::Unhealthy);
        assert_eq!(stored["slow"].message.as_deref(), Some(TIMEOUT_MESSAGE));
    }

    #[tokio::test]
    async fn test_critical_failure_forces_unhealthy() {
        let health = orchestrator();
        health
            .register(
                HealthCheckConfig::new("core").critical(true),
                check_fn(|| async { Ok(CheckOutcome::unhealthy("down")) }),
            )
            .await;
        health
            .register(
                HealthCheckConfig::new("aux"),
                check_fn(|| async { Ok(CheckOutcome::healthy()) }),
            )
            .await;

        let system = health.system_health().await;
        assert_eq!(system.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_noncritical_failure_degrades() {
        let health = orchestrator();
        health
            .register(
                HealthCheckConfig::new("aux"),
                check_fn(|| async { Ok(CheckOutcome::unhealthy("flaky")) }),
            )
            .await;
        health
            .register(
                HealthCheckConfig::new("core").critical(true),
                check_fn(|| async { Ok(CheckOutcome::healthy()) }),
            )
            .await;

        let system = health.system_health().await;
        assert_eq!(system.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_empty_check_set_is_unknown() {
        let health = orchestrator();
        assert_eq!(health.system_health().await.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_periodic_check_runs_on_timer() {
        let health = orchestrator();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        health
            .register(
                HealthCheckConfig::new("tick").interval(Duration::from_millis(20)),
                check_fn(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(CheckOutcome::healthy())
                    }
                }),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(90)).await;
        health.shutdown().await;
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least two periodic runs, saw {seen}");

        // Timers are cancelled; the count stops moving.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let health = orchestrator();
        health
            .register(
                HealthCheckConfig::new("tick").interval(Duration::from_millis(10)),
                check_fn(|| async { Ok(CheckOutcome::healthy()) }),
            )
            .await;
        health.shutdown().await;
        health.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_changed_event_emitted_on_transition() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let health = HealthOrchestrator::new(bus);

        let flip = Arc::new(AtomicBool::new(true));
        let state = Arc::clone(&flip);
        health
            .register(
                HealthCheckConfig::new("flaky"),
                check_fn(move || {
                    let state = Arc::clone(&state);
                    async move {
                        if state.swap(false, Ordering::SeqCst) {
                            Ok(CheckOutcome::healthy())
                        } else {
                            Ok(CheckOutcome::unhealthy("went down"))
                        }
                    }
                }),
            )
            .await;

        health.run_check("flaky").await.unwrap();
        health.run_check("flaky").await.unwrap();

        // First run: unknown -> healthy. Second run: healthy -> unhealthy.
        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            MonitorEvent::HealthChanged {
                current: HealthStatus::Healthy,
                ..
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            MonitorEvent::HealthChanged {
                current: HealthStatus::Unhealthy,
                ..
            }
        ));
    }
}

//! End-to-end tests wiring the collector, orchestrator, sampler, and
//! alert engine together the way a hosting service would.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use vigil::{
    check_fn, AlertEngine, AlertRule, AlertSeverity, AlertStatus, CheckOutcome, EventBus,
    HealthCheckConfig, HealthOrchestrator, HealthStatus, HistoryFilter, MetricCollector,
    MetricKind, MetricQuery, MonitorConfig, MonitorEvent, PerformanceSampler,
    PerformanceThreshold, ThresholdOp, ViolationLevel,
};

fn stack() -> (MonitorConfig, EventBus, MetricCollector) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let config = MonitorConfig::default();
    let events = EventBus::default();
    let metrics = MetricCollector::new(&config.metrics);
    (config, events, metrics)
}

#[tokio::test]
async fn threshold_violation_flows_from_sampler_to_alert_engine() -> Result<()> {
    let (_config, events, metrics) = stack();
    let mut rx = events.subscribe();
    let sampler = PerformanceSampler::new(metrics, events.clone());
    let alerts = AlertEngine::new(events.clone());

    alerts
        .add_rule(AlertRule::new(
            "slow_queries",
            AlertSeverity::Critical,
            "query latency over budget",
            |data| data["value"].as_f64().unwrap_or(0.0) > 500.0,
        ))
        .await;

    sampler.set_threshold(PerformanceThreshold {
        metric: "query_latency_ms".to_string(),
        warning: 200.0,
        critical: 500.0,
        operator: ThresholdOp::Gt,
    });
    sampler.record_latency("query", 750.0);

    // The violation arrives on the bus; feed it to the rule engine the
    // way a hosting service's event loop would.
    let violation = match rx.recv().await? {
        MonitorEvent::ThresholdViolated(v) => v,
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(violation.level, ViolationLevel::Critical);
    assert_eq!(violation.metric, "query_latency_ms");

    let fired = alerts
        .evaluate_rules(&json!({"metric": violation.metric, "value": violation.value}))
        .await;
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].severity, AlertSeverity::Critical);

    let active = alerts.active_alerts(Some(AlertSeverity::Critical)).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].rule_name, "slow_queries");
    Ok(())
}

#[tokio::test]
async fn health_transition_is_observable_and_rolls_up() -> Result<()> {
    let (config, events, _metrics) = stack();
    let mut rx = events.subscribe();
    let health = HealthOrchestrator::new(events.clone());

    let flaky = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let flag = flaky.clone();
    health
        .register(
            HealthCheckConfig::new("database")
                .timeout(config.health.default_timeout())
                .critical(true),
            check_fn(move || {
                let ok = flag.load(std::sync::atomic::Ordering::SeqCst);
                async move {
                    if ok {
                        Ok(CheckOutcome::healthy())
                    } else {
                        Ok(CheckOutcome::unhealthy("pool exhausted"))
                    }
                }
            }),
        )
        .await;

    let first = health.run_check("database").await?;
    assert_eq!(first.status, HealthStatus::Healthy);

    // The first result transitions from unknown.
    match rx.recv().await? {
        MonitorEvent::HealthChanged {
            check,
            previous,
            current,
            ..
        } => {
            assert_eq!(check, "database");
            assert_eq!(previous, HealthStatus::Unknown);
            assert_eq!(current, HealthStatus::Healthy);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    flaky.store(false, std::sync::atomic::Ordering::SeqCst);
    let second = health.run_check("database").await?;
    assert_eq!(second.status, HealthStatus::Unhealthy);

    match rx.recv().await? {
        MonitorEvent::HealthChanged {
            previous, current, ..
        } => {
            assert_eq!(previous, HealthStatus::Healthy);
            assert_eq!(current, HealthStatus::Unhealthy);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // A failing critical check forces the system verdict down.
    let system = health.system_health().await;
    assert_eq!(system.status, HealthStatus::Unhealthy);

    health.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn timed_out_check_degrades_noncritical_system() -> Result<()> {
    let (_config, events, _metrics) = stack();
    let health = HealthOrchestrator::new(events);

    health
        .register(
            HealthCheckConfig::new("upstream")
                .timeout(Duration::from_millis(20))
                .critical(false),
            check_fn(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(CheckOutcome::healthy())
            }),
        )
        .await;
    health
        .register(
            HealthCheckConfig::new("cache"),
            check_fn(|| async { Ok(CheckOutcome::healthy()) }),
        )
        .await;

    let results = health.run_all().await;
    assert_eq!(results.len(), 2);

    let system = health.system_health().await;
    assert_eq!(system.status, HealthStatus::Degraded);
    assert_eq!(
        system.checks["upstream"].message.as_deref(),
        Some("Health check timeout")
    );

    health.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn recorded_metrics_survive_to_both_export_formats() -> Result<()> {
    let (_config, _events, metrics) = stack();

    metrics.register_help("requests_total", "Requests served");
    for i in 0..5 {
        metrics.record_with_labels(
            "requests_total",
            MetricKind::Counter,
            1.0,
            [("route".to_string(), format!("/api/{i}"))].into(),
        );
    }
    metrics.record("queue_depth", MetricKind::Gauge, 17.0);

    let text = metrics.export_prometheus();
    assert!(text.contains("# HELP requests_total Requests served"));
    assert!(text.contains("# TYPE requests_total counter"));
    assert!(text.contains(r#"requests_total{route="/api/0"} 1"#));
    assert!(text.contains("queue_depth 17"));

    let parsed: serde_json::Value = serde_json::from_str(&metrics.export_json()?)?;
    assert_eq!(parsed["requests_total"].as_array().map(|a| a.len()), Some(5));
    assert_eq!(parsed["queue_depth"][0]["value"], json!(17.0));

    let labeled = metrics.query(
        "requests_total",
        &MetricQuery {
            labels: Some([("route".to_string(), "/api/3".to_string())].into()),
            ..Default::default()
        },
    );
    assert_eq!(labeled.len(), 1);
    Ok(())
}

#[tokio::test]
async fn silence_then_purge_lifecycle() -> Result<()> {
    let (_config, events, _metrics) = stack();
    let alerts = AlertEngine::new(events);

    alerts
        .add_rule(AlertRule::new(
            "disk_pressure",
            AlertSeverity::Warning,
            "disk filling up",
            |data| data["disk"].as_f64().unwrap_or(0.0) > 85.0,
        ))
        .await;

    let alert = alerts
        .evaluate_rules(&json!({"disk": 91.0}))
        .await
        .remove(0);

    alerts.silence(alert.id, Duration::from_millis(25)).await?;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        alerts.active_alerts(None).await[0].status,
        AlertStatus::Firing
    );

    alerts.resolve(alert.id).await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(alerts.purge_old(Duration::ZERO).await, 1);
    assert!(alerts.history(&HistoryFilter::default()).await.is_empty());

    alerts.shutdown();
    Ok(())
}

#[tokio::test]
async fn periodic_sampler_feeds_the_collector() -> Result<()> {
    let (_config, events, metrics) = stack();
    let sampler = PerformanceSampler::new(metrics.clone(), events);

    sampler.start(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(60)).await;
    sampler.shutdown();

    let names = metrics.metric_names();
    assert!(names.iter().any(|n| n == "cpu_usage_percent"));
    assert!(names.iter().any(|n| n == "memory_rss_bytes"));
    assert!(names.iter().any(|n| n == "event_loop_lag_ms"));

    let lag = metrics.stats("event_loop_lag_ms");
    assert!(lag.count >= 1);
    assert!(lag.min >= 0.0);
    Ok(())
}

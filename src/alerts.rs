//! Rule-driven alerting with cooldown, lifecycle tracking, and pluggable
//! notification delivery.
//!
//! Rules hold a predicate over caller-supplied JSON data. A firing rule
//! creates an alert, stamps the rule's cooldown, and dispatches to every
//! matching channel; each dispatch failure is isolated and surfaced as
//! an event. The bundled [`UnimplementedSender`] always fails; real
//! delivery (email, webhook, chat) is a per-deployment plug-in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{MonitorError, Result};
use crate::events::{EventBus, MonitorEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
    Acknowledged,
    Silenced,
}

/// Alert message body: fixed text, or rendered from the data that fired
/// the rule.
#[derive(Clone)]
pub enum MessageTemplate {
    Static(String),
    Render(Arc<dyn Fn(&serde_json::Value) -> String + Send + Sync>),
}

impl MessageTemplate {
    fn render(&self, data: &serde_json::Value) -> String {
        match self {
            MessageTemplate::Static(text) => text.clone(),
            MessageTemplate::Render(f) => f(data),
        }
    }
}

impl std::fmt::Debug for MessageTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageTemplate::Static(text) => f.debug_tuple("Static").field(text).finish(),
            MessageTemplate::Render(_) => f.write_str("Render(..)"),
        }
    }
}

impl From<&str> for MessageTemplate {
    fn from(text: &str) -> Self {
        MessageTemplate::Static(text.to_string())
    }
}

impl From<String> for MessageTemplate {
    fn from(text: String) -> Self {
        MessageTemplate::Static(text)
    }
}

pub type RulePredicate = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct AlertRule {
    /// Unique key; registering the same name replaces the rule.
    pub name: String,
    pub severity: AlertSeverity,
    pub message: MessageTemplate,
    /// Minimum spacing between firings. `None` means no cooldown.
    pub cooldown: Option<Duration>,
    pub labels: HashMap<String, String>,
    pub predicate: RulePredicate,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        severity: AlertSeverity,
        message: impl Into<MessageTemplate>,
        predicate: impl Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            severity,
            message: message.into(),
            cooldown: None,
            labels: HashMap::new(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub fired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Log,
    Webhook,
    Email,
    Slack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub config: serde_json::Value,
    /// When present, only alerts of these severities are dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_filter: Option<Vec<AlertSeverity>>,
}

/// External-collaborator contract for notification delivery.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, channel: &NotificationChannel, alert: &Alert) -> Result<()>;
}

/// Deliberately unimplemented default sender. It fails loudly so the
/// caller's dispatch-error path is always exercised until a real sender
/// is plugged in.
pub struct UnimplementedSender;

#[async_trait]
impl NotificationSender for UnimplementedSender {
    async fn send(&self, channel: &NotificationChannel, _alert: &Alert) -> Result<()> {
        Err(MonitorError::NotificationUnimplemented {
            channel: channel.name.clone(),
        })
    }
}

/// Filters for [`AlertEngine::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub severity: Option<AlertSeverity>,
    pub status: Option<AlertStatus>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AlertStats {
    pub total: usize,
    pub firing: usize,
    pub resolved: usize,
    pub acknowledged: usize,
    pub silenced: usize,
    pub info: usize,
    pub warning: usize,
    pub critical: usize,
}

struct EngineInner {
    rules: tokio::sync::RwLock<HashMap<String, AlertRule>>,
    alerts: tokio::sync::RwLock<HashMap<Uuid, Alert>>,
    last_fired: tokio::sync::RwLock<HashMap<String, Instant>>,
    channels: tokio::sync::RwLock<Vec<NotificationChannel>>,
    sender: Arc<dyn NotificationSender>,
    events: EventBus,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct AlertEngine {
    inner: Arc<EngineInner>,
}

impl AlertEngine {
    pub fn new(events: EventBus) -> Self {
        Self::with_sender(events, Arc::new(UnimplementedSender))
    }

    pub fn with_sender(events: EventBus, sender: Arc<dyn NotificationSender>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                rules: tokio::sync::RwLock::new(HashMap::new()),
                alerts: tokio::sync::RwLock::new(HashMap::new()),
                last_fired: tokio::sync::RwLock::new(HashMap::new()),
                channels: tokio::sync::RwLock::new(Vec::new()),
                sender,
                events,
                timers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Add or replace a rule (rule names are unique keys).
    pub async fn add_rule(&self, rule: AlertRule) {
        let name = rule.name.clone();
        if self.inner.rules.write().await.insert(name.clone(), rule).is_some() {
            info!("replaced alert rule {name}");
        } else {
            info!("added alert rule {name}");
        }
    }

    pub async fn remove_rule(&self, name: &str) -> bool {
        let removed = self.inner.rules.write().await.remove(name).is_some();
        if removed {
            self.inner.last_fired.write().await.remove(name);
            info!("removed alert rule {name}");
        }
        removed
    }

    pub async fn add_channel(&self, channel: NotificationChannel) {
        self.inner.channels.write().await.push(channel);
    }

    pub async fn remove_channel(&self, name: &str) -> bool {
        let mut channels = self.inner.channels.write().await;
        let before = channels.len();
        channels.retain(|c| c.name != name);
        channels.len() < before
    }

    /// Evaluate every rule against `data`, firing those whose predicate
    /// matches and whose cooldown has elapsed. A panicking predicate is
    /// reported and skipped; it never stops the remaining rules.
    pub async fn evaluate_rules(&self, data: &serde_json::Value) -> Vec<Alert> {
        let rules: Vec<AlertRule> = self.inner.rules.read().await.values().cloned().collect();
        let mut fired = Vec::new();

        for rule in rules {
            if let Some(cooldown) = rule.cooldown {
                let within_cooldown = self
                    .inner
                    .last_fired
                    .read()
                    .await
                    .get(&rule.name)
                    .is_some_and(|at| at.elapsed() < cooldown);
                if within_cooldown {
                    continue;
                }
            }

            let predicate = Arc::clone(&rule.predicate);
            let matched = match catch_unwind(AssertUnwindSafe(|| predicate(data))) {
                Ok(matched) => matched,
                Err(panic) => {
                    let reason = panic_message(panic);
                    warn!("alert rule {} predicate panicked: {reason}", rule.name);
                    self.inner.events.emit(MonitorEvent::RuleEvalFailed {
                        rule: rule.name.clone(),
                        reason,
                        timestamp: Utc::now(),
                    });
                    continue;
                }
            };

            if matched {
                fired.push(self.fire(&rule, data).await);
            }
        }

        fired
    }

    /// Create an alert from a rule, store it, stamp the cooldown, and
    /// dispatch to every matching channel. Channel failures are isolated:
    /// they are reported as events and never alter the alert.
    pub async fn fire(&self, rule: &AlertRule, data: &serde_json::Value) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            status: AlertStatus::Firing,
            message: rule.message.render(data),
            labels: rule.labels.clone(),
            fired_at: Utc::now(),
            resolved_at: None,
            acked_at: None,
        };

        self.inner.alerts.write().await.insert(alert.id, alert.clone());
        self.inner
            .last_fired
            .write()
            .await
            .insert(rule.name.clone(), Instant::now());

        match alert.severity {
            AlertSeverity::Critical => error!("ALERT {}: {}", alert.rule_name, alert.message),
            AlertSeverity::Warning => warn!("ALERT {}: {}", alert.rule_name, alert.message),
            AlertSeverity::Info => info!("ALERT {}: {}", alert.rule_name, alert.message),
        }

        let channels = self.inner.channels.read().await.clone();
        for channel in &channels {
            let wanted = channel
                .severity_filter
                .as_ref()
                .map_or(true, |filter| filter.contains(&alert.severity));
            if !wanted {
                continue;
            }

            if let Err(e) = self.inner.sender.send(channel, &alert).await {
                error!(
                    "notification dispatch to {} failed for alert {}: {e}",
                    channel.name, alert.id
                );
                self.inner.events.emit(MonitorEvent::DispatchFailed {
                    channel: channel.name.clone(),
                    alert_id: alert.id,
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        alert
    }

    pub async fn resolve(&self, id: Uuid) -> Result<Alert> {
        let mut alerts = self.inner.alerts.write().await;
        let alert = alerts
            .get_mut(&id)
            .ok_or(MonitorError::AlertNotFound { id })?;
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(Utc::now());
        info!("alert {id} resolved");
        Ok(alert.clone())
    }

    pub async fn acknowledge(&self, id: Uuid) -> Result<Alert> {
        let mut alerts = self.inner.alerts.write().await;
        let alert = alerts
            .get_mut(&id)
            .ok_or(MonitorError::AlertNotFound { id })?;
        alert.status = AlertStatus::Acknowledged;
        alert.acked_at = Some(Utc::now());
        info!("alert {id} acknowledged");
        Ok(alert.clone())
    }

    /// Silence an alert for a duration. The reversion timer re-checks
    /// the alert's current status: it flips back to firing only if still
    /// silenced, so a resolve or acknowledge in the meantime sticks.
    pub async fn silence(&self, id: Uuid, duration: Duration) -> Result<Alert> {
        let silenced = {
            let mut alerts = self.inner.alerts.write().await;
            let alert = alerts
                .get_mut(&id)
                .ok_or(MonitorError::AlertNotFound { id })?;
            alert.status = AlertStatus::Silenced;
            alert.clone()
        };
        info!("alert {id} silenced for {duration:?}");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut alerts = inner.alerts.write().await;
            if let Some(alert) = alerts.get_mut(&id) {
                if alert.status == AlertStatus::Silenced {
                    alert.status = AlertStatus::Firing;
                    info!("alert {id} silence expired, back to firing");
                }
            }
        });
        if let Ok(mut timers) = self.inner.timers.lock() {
            timers.retain(|t| !t.is_finished());
            timers.push(handle);
        }

        Ok(silenced)
    }

    /// Alerts not yet resolved, newest first, optionally filtered by
    /// severity.
    pub async fn active_alerts(&self, severity: Option<AlertSeverity>) -> Vec<Alert> {
        let alerts = self.inner.alerts.read().await;
        let mut active: Vec<Alert> = alerts
            .values()
            .filter(|a| a.status != AlertStatus::Resolved)
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
        active
    }

    /// All alerts matching the filter, newest first.
    pub async fn history(&self, filter: &HistoryFilter) -> Vec<Alert> {
        let alerts = self.inner.alerts.read().await;
        let mut matching: Vec<Alert> = alerts
            .values()
            .filter(|a| filter.start.map_or(true, |t| a.fired_at >= t))
            .filter(|a| filter.end.map_or(true, |t| a.fired_at <= t))
            .filter(|a| filter.severity.map_or(true, |s| a.severity == s))
            .filter(|a| filter.status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
        matching
    }

    pub async fn stats(&self) -> AlertStats {
        let alerts = self.inner.alerts.read().await;
        let mut stats = AlertStats::default();
        for alert in alerts.values() {
            stats.total += 1;
            match alert.status {
                AlertStatus::Firing => stats.firing += 1,
                AlertStatus::Resolved => stats.resolved += 1,
                AlertStatus::Acknowledged => stats.acknowledged += 1,
                AlertStatus::Silenced => stats.silenced += 1,
            }
            match alert.severity {
                AlertSeverity::Info => stats.info += 1,
                AlertSeverity::Warning => stats.warning += 1,
                AlertSeverity::Critical => stats.critical += 1,
            }
        }
        stats
    }

    /// Delete resolved alerts older than `max_age`, returning how many
    /// were removed. Unresolved alerts are never swept.
    pub async fn purge_old(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age.as_millis() as i64);
        let mut alerts = self.inner.alerts.write().await;
        let before = alerts.len();
        alerts.retain(|_, alert| {
            if alert.status != AlertStatus::Resolved {
                return true;
            }
            alert.resolved_at.unwrap_or(alert.fired_at) > cutoff
        });
        let removed = before - alerts.len();
        if removed > 0 {
            info!("purged {removed} resolved alerts");
        }
        removed
    }

    /// Cancel outstanding silence-reversion timers. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        if let Ok(mut timers) = self.inner.timers.lock() {
            for handle in timers.drain(..) {
                handle.abort();
            }
        }
        info!("alert engine shut down");
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "predicate panicked".to_string()
    }
}

//! Typed event signaling shared by all monitoring components.
//!
//! Rule-evaluation failures, notification-dispatch failures, threshold
//! violations, and health transitions are surfaced here instead of being
//! thrown at the call site. Listeners subscribe through a broadcast
//! channel; a slow or dropped listener never affects the emitter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::health::HealthStatus;
use crate::sampler::ThresholdViolation;

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub enum MonitorEvent {
    ThresholdViolated(ThresholdViolation),
    HealthChanged {
        check: String,
        previous: HealthStatus,
        current: HealthStatus,
        timestamp: DateTime<Utc>,
    },
    RuleEvalFailed {
        rule: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    DispatchFailed {
        channel: String,
        alert_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast fan-out for [`MonitorEvent`]s.
///
/// Cloning the bus shares the underlying channel, so every component a
/// host wires up with the same bus reports into one stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers. Having no subscribers
    /// is not an error.
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(MonitorEvent::RuleEvalFailed {
            rule: "r".to_string(),
            reason: "boom".to_string(),
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_all_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.emit(MonitorEvent::RuleEvalFailed {
            rule: "cpu_rule".to_string(),
            reason: "predicate panicked".to_string(),
            timestamp: Utc::now(),
        });

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                MonitorEvent::RuleEvalFailed { rule, .. } => assert_eq!(rule, "cpu_rule"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}

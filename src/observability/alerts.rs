//! Alert events for the external alerting sink.
//!
//! The platform's alerting pipeline is an external collaborator; this module
//! only defines the narrow interface the gate emits through. Emission must
//! not block the request path, so the trait is synchronous and
//! implementations are expected to hand off internally (log, channel, ...).

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    KillSwitchActivated,
    BudgetDenied,
    CircuitOpened,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub kind: AlertKind,
    /// Scope the event applies to: an org id, a breaker target, or `global`.
    pub scope: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            scope: scope.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Narrow interface to the alerting pipeline.
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: AlertEvent);
}

/// Default sink: structured log records, picked up by whatever subscriber
/// the host process installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, event: AlertEvent) {
        tracing::warn!(
            alert_id = %event.id,
            kind = ?event.kind,
            scope = %event.scope,
            "{}",
            event.message
        );
    }
}

/// Buffering sink for tests and local inspection.
#[derive(Debug, Default)]
pub struct BufferedAlertSink {
    events: std::sync::Mutex<Vec<AlertEvent>>,
}

impl BufferedAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count_of(&self, kind: AlertKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl AlertSink for BufferedAlertSink {
    fn emit(&self, event: AlertEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_sink_collects_events() {
        let sink = BufferedAlertSink::new();
        sink.emit(AlertEvent::new(
            AlertKind::KillSwitchActivated,
            "org-a",
            "spend ceiling breached",
        ));
        sink.emit(AlertEvent::new(AlertKind::BudgetDenied, "org-a", "denied"));

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.count_of(AlertKind::KillSwitchActivated), 1);
    }
}

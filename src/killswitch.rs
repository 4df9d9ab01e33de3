//! Kill-switch flag store.
//!
//! A tripped scope denies all further spend until an operator resets it.
//! This component is a pure flag store plus event emission; the policy that
//! decides *when* to trip lives in the enforcement guard.
//!
//! Reads sit on the hot path of every request and are lock-free; writes
//! (activate/reset) are rare.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::observability::{AlertEvent, AlertKind, AlertSink, TracingAlertSink};

/// Isolation boundary a kill-switch applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "org_id")]
pub enum Scope {
    Global,
    Org(String),
}

impl Scope {
    pub fn org(org_id: impl Into<String>) -> Self {
        Self::Org(org_id.into())
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Org(org_id) => f.write_str(org_id),
        }
    }
}

/// State recorded for an active kill-switch.
#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub scope: Scope,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
}

/// Per-scope kill-switch controller.
pub struct KillSwitch {
    active: DashMap<Scope, Activation>,
    alerts: Arc<dyn AlertSink>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(TracingAlertSink))
    }

    pub fn with_sink(alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            active: DashMap::new(),
            alerts,
        }
    }

    /// Returns true when `scope` itself or the global switch is tripped.
    pub fn is_active(&self, scope: &Scope) -> bool {
        self.active.contains_key(&Scope::Global) || self.active.contains_key(scope)
    }

    pub fn activation(&self, scope: &Scope) -> Option<Activation> {
        self.active
            .get(&Scope::Global)
            .or_else(|| self.active.get(scope))
            .map(|e| e.value().clone())
    }

    /// Trip the switch for `scope`.
    ///
    /// Idempotent: re-activating an already-tripped scope keeps the original
    /// activation and emits no further alert.
    pub fn activate(&self, scope: Scope, reason: impl Into<String>) {
        let reason = reason.into();
        let mut newly_activated = false;

        self.active.entry(scope.clone()).or_insert_with(|| {
            newly_activated = true;
            Activation {
                scope: scope.clone(),
                reason: reason.clone(),
                activated_at: Utc::now(),
            }
        });

        if newly_activated {
            tracing::warn!(scope = %scope, reason = %reason, "Kill switch activated");
            self.alerts.emit(AlertEvent::new(
                AlertKind::KillSwitchActivated,
                scope.to_string(),
                format!("Kill switch activated: {reason}"),
            ));
        }
    }

    /// Clear the switch for `scope`. Explicit administrative action.
    ///
    /// Idempotent: resetting an inactive scope is a no-op.
    pub fn reset(&self, scope: &Scope) -> bool {
        let cleared = self.active.remove(scope).is_some();
        if cleared {
            tracing::info!(scope = %scope, "Kill switch reset");
        }
        cleared
    }

    /// Snapshot of all tripped scopes (admin surface).
    pub fn active_scopes(&self) -> Vec<Activation> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("active", &self.active.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::BufferedAlertSink;

    #[test]
    fn test_activate_and_reset() {
        let ks = KillSwitch::new();
        let scope = Scope::org("org-a");

        assert!(!ks.is_active(&scope));
        ks.activate(scope.clone(), "budget breached");
        assert!(ks.is_active(&scope));

        assert!(ks.reset(&scope));
        assert!(!ks.is_active(&scope));
        assert!(!ks.reset(&scope));
    }

    #[test]
    fn test_activation_is_idempotent_one_alert() {
        let sink = Arc::new(BufferedAlertSink::new());
        let ks = KillSwitch::with_sink(sink.clone());
        let scope = Scope::org("org-a");

        ks.activate(scope.clone(), "first");
        ks.activate(scope.clone(), "second");

        assert!(ks.is_active(&scope));
        assert_eq!(sink.count_of(AlertKind::KillSwitchActivated), 1);
        // The original activation wins.
        assert_eq!(ks.activation(&scope).unwrap().reason, "first");
    }

    #[test]
    fn test_global_scope_covers_all_orgs() {
        let ks = KillSwitch::new();
        ks.activate(Scope::Global, "platform emergency");

        assert!(ks.is_active(&Scope::org("org-a")));
        assert!(ks.is_active(&Scope::org("org-b")));

        ks.reset(&Scope::Global);
        assert!(!ks.is_active(&Scope::org("org-a")));
    }

    #[test]
    fn test_org_scopes_are_isolated() {
        let ks = KillSwitch::new();
        ks.activate(Scope::org("org-a"), "breach");

        assert!(ks.is_active(&Scope::org("org-a")));
        assert!(!ks.is_active(&Scope::org("org-b")));
        assert_eq!(ks.active_scopes().len(), 1);
    }
}

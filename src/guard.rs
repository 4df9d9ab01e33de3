//! Budget enforcement guard.
//!
//! Gates every agent invocation: kill-switch check, cost estimate, atomic
//! budget reservation. Denials are typed and structured; backend trouble
//! fails closed. The guard holds its collaborators by injection so tests
//! and multi-instance deployments can wire their own.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::estimator::{CostEstimate, CostEstimator, Provider};
use crate::killswitch::{KillSwitch, Scope};
use crate::ledger::{BudgetLedger, Clock, LedgerError, PeriodKind, SystemClock};
use crate::limiter::RateLimitDecision;
use crate::observability::{AlertEvent, AlertKind, AlertSink, GateMetrics, TracingAlertSink};

/// Inbound request descriptor, produced by the (external) HTTP layer from an
/// authenticated, tenant-scoped call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforceRequest {
    pub org_id: String,
    pub agent_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

impl EnforceRequest {
    pub fn new(org_id: impl Into<String>, agent_key: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            agent_key: agent_key.into(),
            provider: None,
            tokens: None,
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

/// Positive enforcement decision with the metadata the calling layer
/// surfaces as response headers.
#[derive(Debug, Clone, Serialize)]
pub struct Allowance {
    pub estimate: CostEstimate,
    /// Committed period spend after this reservation.
    pub new_total: Decimal,
    /// Percentage of the period budget consumed after this request.
    pub pct: Decimal,
}

impl Allowance {
    /// Header pairs for the calling layer.
    pub fn headers(&self) -> [(&'static str, String); 2] {
        [
            ("X-Est-Cost-EUR", self.estimate.amount_eur.to_string()),
            ("X-Budget-Pct", self.pct.to_string()),
        ]
    }
}

/// Machine-readable denial code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyCode {
    BudgetExceeded,
    KillSwitchActive,
    CircuitOpen,
    RateLimited,
    StorageUnavailable,
}

impl DenyCode {
    /// HTTP status the calling layer should map this code to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BudgetExceeded | Self::KillSwitchActive => 402,
            Self::CircuitOpen => 503,
            Self::RateLimited => 429,
            Self::StorageUnavailable => 503,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenyDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pct: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Structured denial, returned as a typed value so it cannot be swallowed
/// like a generic exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Denial {
    pub code: DenyCode,
    pub message: String,
    pub details: DenyDetails,
}

impl Denial {
    pub fn budget_exceeded(pct: Decimal) -> Self {
        Self {
            code: DenyCode::BudgetExceeded,
            message: format!("Budget exceeded: request would reach {pct}% of the period limit"),
            details: DenyDetails {
                pct: Some(pct),
                ..Default::default()
            },
        }
    }

    pub fn kill_switch(scope: &Scope, reason: &str) -> Self {
        Self {
            code: DenyCode::KillSwitchActive,
            message: format!("Kill switch active for {scope}: {reason}"),
            details: DenyDetails {
                scope: Some(scope.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn circuit_open(target: &str, retry_after: Duration) -> Self {
        Self {
            code: DenyCode::CircuitOpen,
            message: format!("Circuit open for downstream target '{target}'"),
            details: DenyDetails {
                retry_after_ms: Some(retry_after.as_millis() as u64),
                ..Default::default()
            },
        }
    }

    pub fn rate_limited(decision: &RateLimitDecision) -> Self {
        Self {
            code: DenyCode::RateLimited,
            message: "Rate limit exceeded for this window".to_string(),
            details: DenyDetails {
                retry_after_ms: Some(decision.reset_after.as_millis() as u64),
                ..Default::default()
            },
        }
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self {
            code: DenyCode::StorageUnavailable,
            message: message.into(),
            details: DenyDetails::default(),
        }
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for Denial {}

/// Policy knobs for the guard.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub period: PeriodKind,
    /// Denials at or above this percentage of budget trip the org kill-switch.
    pub activation_threshold_pct: Decimal,
    /// Ceiling on the ledger round-trip; on expiry the guard fails closed.
    pub ledger_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            period: PeriodKind::Monthly,
            activation_threshold_pct: rust_decimal_macros::dec!(100),
            ledger_timeout: Duration::from_millis(100),
        }
    }
}

/// Orchestrates estimator, ledger, and kill-switch for one admission
/// decision per request.
pub struct EnforcementGuard {
    estimator: CostEstimator,
    ledger: BudgetLedger,
    kill_switch: Arc<KillSwitch>,
    clock: Arc<dyn Clock>,
    config: GuardConfig,
    metrics: Arc<GateMetrics>,
    alerts: Arc<dyn AlertSink>,
}

impl EnforcementGuard {
    pub fn new(
        estimator: CostEstimator,
        ledger: BudgetLedger,
        kill_switch: Arc<KillSwitch>,
        config: GuardConfig,
    ) -> Self {
        Self {
            estimator,
            ledger,
            kill_switch,
            clock: Arc::new(SystemClock),
            config,
            metrics: Arc::new(GateMetrics::new()),
            alerts: Arc::new(TracingAlertSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn metrics(&self) -> &Arc<GateMetrics> {
        &self.metrics
    }

    pub fn current_period_key(&self) -> String {
        self.config.period.key(self.clock.now_utc())
    }

    /// Decide whether one agent invocation may spend.
    ///
    /// Exactly one ledger mutation happens per allow; a denial never
    /// consumes budget. Ledger trouble (error or timeout) denies rather
    /// than silently allowing unlimited spend.
    pub async fn enforce(&self, request: &EnforceRequest) -> Result<Allowance, Denial> {
        let scope = Scope::org(&request.org_id);

        if self.kill_switch.is_active(&scope) {
            self.metrics.denied_kill_switch.inc();
            let reason = self
                .kill_switch
                .activation(&scope)
                .map(|a| a.reason)
                .unwrap_or_else(|| "active".to_string());
            return Err(Denial::kill_switch(&scope, &reason));
        }

        let estimate =
            self.estimator
                .estimate(&request.agent_key, request.provider, request.tokens);
        let period_key = self.current_period_key();

        let reservation = match tokio::time::timeout(
            self.config.ledger_timeout,
            self.ledger
                .reserve_and_commit(&request.org_id, &period_key, estimate.amount_eur),
        )
        .await
        {
            Ok(Ok(reservation)) => reservation,
            Ok(Err(e)) => {
                // Fail closed: an unreachable ledger must not become a blank check.
                self.metrics.denied_storage.inc();
                tracing::error!(org_id = %request.org_id, error = %e, "Budget ledger error, denying");
                return Err(Denial::storage_unavailable(match e {
                    LedgerError::StorageUnavailable { message } => {
                        format!("Budget ledger unavailable: {message}")
                    }
                    other => format!("Budget ledger rejected the reservation: {other}"),
                }));
            }
            Err(_) => {
                self.metrics.denied_storage.inc();
                tracing::error!(
                    org_id = %request.org_id,
                    timeout_ms = self.config.ledger_timeout.as_millis() as u64,
                    "Budget ledger timed out, denying"
                );
                return Err(Denial::storage_unavailable(format!(
                    "Budget ledger timed out after {}ms",
                    self.config.ledger_timeout.as_millis()
                )));
            }
        };

        if !reservation.accepted {
            self.metrics.denied_budget.inc();
            self.alerts.emit(AlertEvent::new(
                AlertKind::BudgetDenied,
                request.org_id.clone(),
                format!(
                    "Denied {} EUR for agent '{}': would reach {}% of budget",
                    estimate.amount_eur, request.agent_key, reservation.pct
                ),
            ));

            // Auto-trip policy evaluates on denial, not on acceptance.
            if reservation.pct >= self.config.activation_threshold_pct {
                let was_active = self.kill_switch.is_active(&scope);
                self.kill_switch.activate(
                    scope,
                    format!(
                        "Budget denial at {}% (threshold {}%)",
                        reservation.pct, self.config.activation_threshold_pct
                    ),
                );
                if !was_active {
                    self.metrics.kill_switch_activations.inc();
                }
            }

            return Err(Denial::budget_exceeded(reservation.pct));
        }

        self.metrics.allowed.inc();
        tracing::debug!(
            org_id = %request.org_id,
            agent_key = %request.agent_key,
            cost_eur = %estimate.amount_eur,
            pct = %reservation.pct,
            "Spend admitted"
        );

        Ok(Allowance {
            estimate,
            new_total: reservation.new_total,
            pct: reservation.pct,
        })
    }
}

impl std::fmt::Debug for EnforcementGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnforcementGuard")
            .field("ledger", &self.ledger)
            .field("config", &self.config)
            .finish()
    }
}

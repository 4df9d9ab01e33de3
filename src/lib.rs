//! # finops-gate
//!
//! FinOps admission control for multi-tenant AI agent workloads.
//!
//! Every agent invocation passes a pipeline of independent gates, each of
//! which can short-circuit the request with a distinct, structured denial:
//!
//! 1. **Rate limiter** — fixed-window counter per tenant/route.
//! 2. **Enforcement guard** — kill-switch check, cost estimate, atomic
//!    budget reservation; fails closed when the ledger is unreachable.
//! 3. **Circuit breaker** — per-downstream-target failure isolation with
//!    exponential, capped recovery backoff.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use finops_gate::{
//!     BudgetLedger, BudgetLimits, CostEstimator, EnforceRequest, EnforcementGuard,
//!     GuardConfig, KillSwitch, MemoryBudgetStore,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let ledger = BudgetLedger::new(
//!         Arc::new(MemoryBudgetStore::new()),
//!         BudgetLimits::new(rust_decimal_macros::dec!(100)),
//!     );
//!     let guard = EnforcementGuard::new(
//!         CostEstimator::default(),
//!         ledger,
//!         Arc::new(KillSwitch::new()),
//!         GuardConfig::default(),
//!     );
//!
//!     let request = EnforceRequest::new("org-1", "lead_scoring_agent").with_tokens(5_000);
//!     match guard.enforce(&request).await {
//!         Ok(allowance) => println!("allowed, budget at {}%", allowance.pct),
//!         Err(denial) => println!("denied ({}): {}", denial.http_status(), denial),
//!     }
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod breaker;
pub mod config;
pub mod estimator;
pub mod guard;
pub mod killswitch;
pub mod ledger;
pub mod limiter;
pub mod observability;

// Re-exports for convenience
pub use breaker::{
    BreakerError, BreakerRegistry, CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState,
    ExponentialBackoff,
};
pub use config::{BudgetSettings, ConfigError, ConfigResult, GateConfig, LimiterSettings};
pub use estimator::{
    CostEstimate, CostEstimator, EstimateError, EstimatorConfig, PriceTable, PriceTableBuilder,
    Provider, ProviderPricing, global_price_table,
};
pub use guard::{
    Allowance, Denial, DenyCode, DenyDetails, EnforceRequest, EnforcementGuard, GuardConfig,
};
pub use killswitch::{Activation, KillSwitch, Scope};
pub use ledger::{
    BudgetLedger, BudgetLimits, BudgetPeriod, BudgetStore, Clock, LedgerError, LedgerResult,
    ManualClock, MemoryBudgetStore, PeriodKind, Reservation, StoreReservation, SystemClock,
};
#[cfg(feature = "redis-backend")]
pub use ledger::{RedisBudgetStore, RedisStoreConfig};
pub use limiter::{RateLimitDecision, RateLimitTier, RateLimiter};
pub use observability::{
    AlertEvent, AlertKind, AlertSink, BufferedAlertSink, Counter, Gauge, GateMetrics,
    GateMetricsSnapshot, TracingAlertSink,
};

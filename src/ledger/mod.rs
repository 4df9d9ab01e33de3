//! Per-tenant, per-period budget accounting.
//!
//! The ledger is the admission-control heart of the crate: a reservation
//! either commits atomically within the period ceiling or leaves the
//! counters untouched. Storage lives behind [`BudgetStore`] with an
//! in-memory implementation for tests and single-instance deployments and
//! a Redis-backed one (feature `redis-backend`) for multi-instance
//! deployments.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use thiserror::Error;

pub mod period;
pub mod store;
#[cfg(feature = "redis-backend")]
pub mod store_redis;

pub use period::{BudgetPeriod, Clock, ManualClock, PeriodKind, SystemClock};
pub use store::{BudgetStore, MemoryBudgetStore, StoreReservation};
#[cfg(feature = "redis-backend")]
pub use store_redis::{RedisBudgetStore, RedisStoreConfig};

/// Scale factor for storing EUR amounts as integer counters (6 decimal places).
pub(crate) const EUR_MICROS: Decimal = dec!(1_000_000);

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    #[error("Amount out of range: {amount} EUR")]
    AmountOutOfRange { amount: Decimal },

    #[error("Invalid budget limit for {org_id}: {limit} EUR")]
    InvalidLimit { org_id: String, limit: Decimal },
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

pub(crate) fn eur_to_micros(amount: Decimal) -> LedgerResult<u64> {
    if amount < Decimal::ZERO {
        return Err(LedgerError::AmountOutOfRange { amount });
    }
    (amount * EUR_MICROS)
        .round()
        .to_u64()
        .ok_or(LedgerError::AmountOutOfRange { amount })
}

pub(crate) fn micros_to_eur(micros: u64) -> Decimal {
    Decimal::from(micros) / EUR_MICROS
}

/// Per-organization budget limits, resolved against a default.
#[derive(Debug, Clone)]
pub struct BudgetLimits {
    default_limit_eur: Decimal,
    org_overrides: HashMap<String, Decimal>,
}

impl BudgetLimits {
    pub fn new(default_limit_eur: Decimal) -> Self {
        Self {
            default_limit_eur,
            org_overrides: HashMap::new(),
        }
    }

    pub fn with_org_limit(mut self, org_id: impl Into<String>, limit_eur: Decimal) -> Self {
        self.org_overrides.insert(org_id.into(), limit_eur);
        self
    }

    pub fn limit_for(&self, org_id: &str) -> Decimal {
        self.org_overrides
            .get(org_id)
            .copied()
            .unwrap_or(self.default_limit_eur)
    }
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self::new(dec!(100))
    }
}

/// Outcome of a reservation attempt against a period budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub accepted: bool,
    /// Committed spend after this reservation (unchanged spend on deny).
    pub new_total: Decimal,
    /// Percentage of the period limit the relevant total represents: the
    /// committed total on accept, the would-be total on deny.
    pub pct: Decimal,
}

/// Budget ledger with atomic reserve-and-commit semantics.
///
/// A reservation is admission control, not post-hoc accounting: it commits
/// only when the would-be total stays within the hard ceiling, and a denial
/// never mutates the stored spend.
#[derive(Clone)]
pub struct BudgetLedger {
    store: Arc<dyn BudgetStore>,
    limits: BudgetLimits,
    hard_ceiling_pct: Decimal,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn BudgetStore>, limits: BudgetLimits) -> Self {
        Self {
            store,
            limits,
            hard_ceiling_pct: dec!(100),
        }
    }

    /// Allow reservations up to `pct` percent of the nominal limit.
    pub fn with_hard_ceiling_pct(mut self, pct: Decimal) -> Self {
        self.hard_ceiling_pct = pct;
        self
    }

    pub fn limit_for(&self, org_id: &str) -> Decimal {
        self.limits.limit_for(org_id)
    }

    /// Read-only view of the committed spend; zero when no record exists.
    pub async fn current_spend(&self, org_id: &str, period_key: &str) -> LedgerResult<Decimal> {
        let micros = self.store.spent_micros(org_id, period_key).await?;
        Ok(micros_to_eur(micros))
    }

    /// Full period view for admin/status surfaces.
    pub async fn period_snapshot(
        &self,
        org_id: &str,
        period_key: &str,
    ) -> LedgerResult<BudgetPeriod> {
        let spent_eur = self.current_spend(org_id, period_key).await?;
        let updated_at = self
            .store
            .updated_at(org_id, period_key)
            .await?
            .unwrap_or_else(chrono::Utc::now);
        Ok(BudgetPeriod {
            org_id: org_id.to_string(),
            period_key: period_key.to_string(),
            limit_eur: self.limits.limit_for(org_id),
            spent_eur,
            updated_at,
        })
    }

    /// Atomically reserve `amount` against the period budget.
    ///
    /// Concurrent reservations for the same `(org_id, period_key)` are
    /// linearized by the store; no interleaving can push the committed spend
    /// past the ceiling.
    pub async fn reserve_and_commit(
        &self,
        org_id: &str,
        period_key: &str,
        amount: Decimal,
    ) -> LedgerResult<Reservation> {
        let limit = self.limits.limit_for(org_id);
        if limit <= Decimal::ZERO {
            return Err(LedgerError::InvalidLimit {
                org_id: org_id.to_string(),
                limit,
            });
        }

        let ceiling = limit * self.hard_ceiling_pct / dec!(100);
        let amount_micros = eur_to_micros(amount)?;
        let ceiling_micros = eur_to_micros(ceiling)?;

        let outcome = self
            .store
            .try_add_micros(org_id, period_key, amount_micros, ceiling_micros)
            .await?;

        let reference = if outcome.accepted {
            outcome.total_micros
        } else {
            outcome.would_be_micros
        };
        let mut pct = (micros_to_eur(reference) / limit * dec!(100)).round_dp(2);
        // Fixed two-place scale so header rendering is stable.
        pct.rescale(2);

        Ok(Reservation {
            accepted: outcome.accepted,
            new_total: micros_to_eur(outcome.total_micros),
            pct,
        })
    }
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("store", &self.store.name())
            .field("limits", &self.limits)
            .field("hard_ceiling_pct", &self.hard_ceiling_pct)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(limit: Decimal) -> BudgetLedger {
        BudgetLedger::new(
            Arc::new(MemoryBudgetStore::new()),
            BudgetLimits::new(limit),
        )
    }

    #[tokio::test]
    async fn test_reserve_within_limit() {
        let ledger = ledger(dec!(10));

        let r = ledger
            .reserve_and_commit("org-a", "2026-08", dec!(4))
            .await
            .unwrap();

        assert!(r.accepted);
        assert_eq!(r.new_total, dec!(4));
        assert_eq!(r.pct, dec!(40));
    }

    #[tokio::test]
    async fn test_deny_does_not_mutate() {
        let ledger = ledger(dec!(10));

        ledger
            .reserve_and_commit("org-a", "2026-08", dec!(8))
            .await
            .unwrap();

        let denied = ledger
            .reserve_and_commit("org-a", "2026-08", dec!(4))
            .await
            .unwrap();
        assert!(!denied.accepted);
        // pct reports the would-be total: (8 + 4) / 10 = 120%
        assert_eq!(denied.pct, dec!(120));
        assert_eq!(denied.new_total, dec!(8));

        // Spend unchanged after the denial.
        let spend = ledger.current_spend("org-a", "2026-08").await.unwrap();
        assert_eq!(spend, dec!(8));
    }

    #[tokio::test]
    async fn test_unknown_period_reads_zero() {
        let ledger = ledger(dec!(10));
        let spend = ledger.current_spend("org-a", "2026-07").await.unwrap();
        assert_eq!(spend, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_periods_are_isolated() {
        let ledger = ledger(dec!(10));

        ledger
            .reserve_and_commit("org-a", "2026-07", dec!(9))
            .await
            .unwrap();

        // New period starts from zero; the old one is not merged in.
        let r = ledger
            .reserve_and_commit("org-a", "2026-08", dec!(9))
            .await
            .unwrap();
        assert!(r.accepted);
        assert_eq!(
            ledger.current_spend("org-a", "2026-07").await.unwrap(),
            dec!(9)
        );
    }

    #[tokio::test]
    async fn test_org_override_limit() {
        let limits = BudgetLimits::new(dec!(10)).with_org_limit("premium-org", dec!(100));
        let ledger = BudgetLedger::new(Arc::new(MemoryBudgetStore::new()), limits);

        let r = ledger
            .reserve_and_commit("premium-org", "2026-08", dec!(50))
            .await
            .unwrap();
        assert!(r.accepted);

        let r = ledger
            .reserve_and_commit("basic-org", "2026-08", dec!(50))
            .await
            .unwrap();
        assert!(!r.accepted);
    }

    #[tokio::test]
    async fn test_period_snapshot() {
        let ledger = ledger(dec!(10));
        ledger
            .reserve_and_commit("org-a", "2026-08", dec!(2.5))
            .await
            .unwrap();

        let period = ledger.period_snapshot("org-a", "2026-08").await.unwrap();
        assert_eq!(period.org_id, "org-a");
        assert_eq!(period.period_key, "2026-08");
        assert_eq!(period.limit_eur, dec!(10));
        assert_eq!(period.spent_eur, dec!(2.5));
    }

    #[tokio::test]
    async fn test_negative_amount_rejected() {
        let ledger = ledger(dec!(10));
        let err = ledger
            .reserve_and_commit("org-a", "2026-08", dec!(-1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AmountOutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overspend() {
        let ledger = Arc::new(ledger(dec!(10)));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let l = Arc::clone(&ledger);
                tokio::spawn(async move { l.reserve_and_commit("org-a", "2026-08", dec!(4)).await })
            })
            .collect();

        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap().unwrap().accepted {
                accepted += 1;
            }
        }

        // 3 x 4.00 EUR against a 10.00 EUR limit: exactly 2 fit.
        assert_eq!(accepted, 2);
        assert_eq!(
            ledger.current_spend("org-a", "2026-08").await.unwrap(),
            dec!(8)
        );
    }
}

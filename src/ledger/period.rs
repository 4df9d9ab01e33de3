//! Calendar periods for budget accounting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Clock abstraction so period rollover is testable.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and deterministic replays.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Calendar bucket over which spend accumulates against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Daily,
    #[default]
    Monthly,
}

impl PeriodKind {
    /// Derive the period key for a point in time, e.g. `2026-08` or `2026-08-06`.
    ///
    /// Rollover is automatic: a new key simply addresses fresh counters, and
    /// stale periods keep their own key instead of merging into the current one.
    pub fn key(&self, at: DateTime<Utc>) -> String {
        match self {
            Self::Monthly => at.format("%Y-%m").to_string(),
            Self::Daily => at.format("%Y-%m-%d").to_string(),
        }
    }

    /// Retention for stored counters; generous enough that a period key stays
    /// readable until well after it can no longer receive reservations.
    pub fn retention_secs(&self) -> u64 {
        match self {
            Self::Monthly => 62 * 86_400,
            Self::Daily => 2 * 86_400,
        }
    }
}

/// Snapshot of one tenant's spend within one period.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetPeriod {
    pub org_id: String,
    pub period_key: String,
    pub limit_eur: Decimal,
    pub spent_eur: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_monthly_key() {
        let at = Utc.with_ymd_and_hms(2026, 8, 6, 12, 30, 0).unwrap();
        assert_eq!(PeriodKind::Monthly.key(at), "2026-08");
    }

    #[test]
    fn test_daily_key() {
        let at = Utc.with_ymd_and_hms(2026, 8, 6, 12, 30, 0).unwrap();
        assert_eq!(PeriodKind::Daily.key(at), "2026-08-06");
    }

    #[test]
    fn test_key_rolls_over_at_month_boundary() {
        let before = Utc.with_ymd_and_hms(2026, 8, 31, 23, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap();
        assert_ne!(PeriodKind::Monthly.key(before), PeriodKind::Monthly.key(after));
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2026, 8, 31, 23, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(PeriodKind::Monthly.key(clock.now_utc()), "2026-08");

        clock.advance(chrono::Duration::hours(2));
        assert_eq!(PeriodKind::Monthly.key(clock.now_utc()), "2026-09");
    }
}

//! Typed configuration for the whole gate.
//!
//! Every recognized option is an explicit field with a sane default,
//! loadable from `FINOPS_`-prefixed environment variables and validated at
//! startup. Nothing in the enforcement path reads the environment directly.

use std::collections::HashMap;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::breaker::CircuitConfig;
use crate::estimator::{EstimatorConfig, Provider};
use crate::guard::GuardConfig;
use crate::ledger::{BudgetLimits, PeriodKind};
use crate::limiter::RateLimitTier;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Failed to parse {key}={value}")]
    Parse { key: String, value: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Budget-related settings.
#[derive(Debug, Clone)]
pub struct BudgetSettings {
    /// Default period limit applied to orgs without an override.
    pub default_limit_eur: Decimal,
    /// Per-org limit overrides.
    pub org_limits: HashMap<String, Decimal>,
    pub period: PeriodKind,
    /// Reservations may fill the budget up to this percentage of the limit.
    pub hard_ceiling_pct: Decimal,
    /// Denials at or above this percentage trip the org kill-switch.
    pub activation_threshold_pct: Decimal,
    /// Ceiling on one ledger round-trip before the guard fails closed.
    pub ledger_timeout: Duration,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            default_limit_eur: dec!(100),
            org_limits: HashMap::new(),
            period: PeriodKind::Monthly,
            hard_ceiling_pct: dec!(100),
            activation_threshold_pct: dec!(100),
            ledger_timeout: Duration::from_millis(100),
        }
    }
}

/// Rate-limiter tier settings.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub demo: RateLimitTier,
    pub production: RateLimitTier,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            demo: RateLimitTier::demo(),
            production: RateLimitTier::production(),
        }
    }
}

/// Top-level configuration for the gate.
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    pub budget: BudgetSettings,
    pub circuit: CircuitConfig,
    pub limiter: LimiterSettings,
    pub estimator: EstimatorConfig,
}

impl GateConfig {
    /// Load overrides from `FINOPS_*` environment variables on top of the
    /// defaults, then validate.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<Decimal>("FINOPS_BUDGET_LIMIT_EUR")? {
            config.budget.default_limit_eur = v;
        }
        if let Some(v) = env_var("FINOPS_BUDGET_PERIOD") {
            config.budget.period = match v.to_lowercase().as_str() {
                "daily" => PeriodKind::Daily,
                "monthly" => PeriodKind::Monthly,
                _ => {
                    return Err(ConfigError::Parse {
                        key: "FINOPS_BUDGET_PERIOD".into(),
                        value: v,
                    });
                }
            };
        }
        if let Some(v) = env_parse::<Decimal>("FINOPS_HARD_CEILING_PCT")? {
            config.budget.hard_ceiling_pct = v;
        }
        if let Some(v) = env_parse::<Decimal>("FINOPS_KILL_SWITCH_THRESHOLD_PCT")? {
            config.budget.activation_threshold_pct = v;
        }
        if let Some(v) = env_parse::<u64>("FINOPS_LEDGER_TIMEOUT_MS")? {
            config.budget.ledger_timeout = Duration::from_millis(v);
        }

        if let Some(v) = env_parse::<u32>("FINOPS_CB_FAILURE_THRESHOLD")? {
            config.circuit.failure_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("FINOPS_CB_RECOVERY_TIMEOUT_MS")? {
            config.circuit.base_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("FINOPS_CB_MAX_BACKOFF_MS")? {
            config.circuit.max_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("FINOPS_CB_HALF_OPEN_MAX_CALLS")? {
            config.circuit.half_open_max_calls = v;
        }
        if let Some(v) = env_parse::<u64>("FINOPS_CB_MONITORING_PERIOD_MS")? {
            config.circuit.monitoring_period = Duration::from_millis(v);
        }

        if let Some(v) = env_parse::<u64>("FINOPS_RL_DEMO_WINDOW_MS")? {
            config.limiter.demo.window = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("FINOPS_RL_DEMO_MAX_REQUESTS")? {
            config.limiter.demo.max_requests = v;
        }
        if let Some(v) = env_parse::<u64>("FINOPS_RL_PROD_WINDOW_MS")? {
            config.limiter.production.window = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("FINOPS_RL_PROD_MAX_REQUESTS")? {
            config.limiter.production.max_requests = v;
        }

        if let Some(v) = env_var("FINOPS_DEFAULT_PROVIDER") {
            config.estimator.default_provider =
                v.parse::<Provider>()
                    .map_err(|_| ConfigError::Parse {
                        key: "FINOPS_DEFAULT_PROVIDER".into(),
                        value: v,
                    })?;
        }
        if let Some(v) = env_parse::<u64>("FINOPS_DEFAULT_TOKENS")? {
            config.estimator.default_tokens = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn org_limit(mut self, org_id: impl Into<String>, limit_eur: Decimal) -> Self {
        self.budget.org_limits.insert(org_id.into(), limit_eur);
        self
    }

    /// Reject configurations that would make enforcement meaningless.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.budget.default_limit_eur <= Decimal::ZERO {
            return Err(invalid(
                "FINOPS_BUDGET_LIMIT_EUR",
                self.budget.default_limit_eur.to_string(),
                "must be positive",
            ));
        }
        for (org, limit) in &self.budget.org_limits {
            if *limit <= Decimal::ZERO {
                return Err(invalid(
                    "org_limits",
                    format!("{org}={limit}"),
                    "must be positive",
                ));
            }
        }
        if self.budget.hard_ceiling_pct <= Decimal::ZERO
            || self.budget.hard_ceiling_pct > dec!(200)
        {
            return Err(invalid(
                "FINOPS_HARD_CEILING_PCT",
                self.budget.hard_ceiling_pct.to_string(),
                "must be in (0, 200]",
            ));
        }
        if self.budget.activation_threshold_pct <= Decimal::ZERO {
            return Err(invalid(
                "FINOPS_KILL_SWITCH_THRESHOLD_PCT",
                self.budget.activation_threshold_pct.to_string(),
                "must be positive",
            ));
        }
        if self.budget.ledger_timeout.is_zero() {
            return Err(invalid(
                "FINOPS_LEDGER_TIMEOUT_MS",
                "0".to_string(),
                "must be positive",
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(invalid(
                "FINOPS_CB_FAILURE_THRESHOLD",
                "0".to_string(),
                "must be positive",
            ));
        }
        if self.circuit.half_open_max_calls == 0 {
            return Err(invalid(
                "FINOPS_CB_HALF_OPEN_MAX_CALLS",
                "0".to_string(),
                "must be positive",
            ));
        }
        if self.circuit.max_backoff < self.circuit.base_backoff {
            return Err(invalid(
                "FINOPS_CB_MAX_BACKOFF_MS",
                format!("{:?}", self.circuit.max_backoff),
                "must be >= the base backoff",
            ));
        }
        for (name, tier) in [("demo", &self.limiter.demo), ("production", &self.limiter.production)]
        {
            if tier.max_requests == 0 || tier.window.is_zero() {
                return Err(invalid(
                    "limiter tier",
                    name.to_string(),
                    "window and max_requests must be positive",
                ));
            }
        }
        Ok(())
    }

    /// Budget limits view for the ledger.
    pub fn budget_limits(&self) -> BudgetLimits {
        let mut limits = BudgetLimits::new(self.budget.default_limit_eur);
        for (org, limit) in &self.budget.org_limits {
            limits = limits.with_org_limit(org.clone(), *limit);
        }
        limits
    }

    /// Policy view for the enforcement guard.
    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            period: self.budget.period,
            activation_threshold_pct: self.budget.activation_threshold_pct,
            ledger_timeout: self.budget.ledger_timeout,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> ConfigResult<Option<T>> {
    match env_var(key) {
        None => Ok(None),
        Some(v) => v.parse::<T>().map(Some).map_err(|_| ConfigError::Parse {
            key: key.into(),
            value: v,
        }),
    }
}

fn invalid(key: &'static str, value: String, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue { key, value, reason }
}

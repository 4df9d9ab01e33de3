//! Cost estimation for agent invocations.
//!
//! Prices can be customized via environment variables or programmatically.
//! Default prices reflect the platform's negotiated €/token rates.

use std::collections::HashMap;
use std::sync::LazyLock;

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Surcharge applied to director-class agents.
const DIRECTOR_MULTIPLIER: Decimal = dec!(1.5);

/// Estimates are rounded half-up to this many decimal places.
const AMOUNT_SCALE: u32 = 4;

/// Downstream AI provider an agent invocation is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Azure,
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Azure => "azure",
            Self::Local => "local",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = EstimateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "azure" => Ok(Self::Azure),
            "local" => Ok(Self::Local),
            other => Err(EstimateError::InvalidProvider {
                provider: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EstimateError {
    #[error("Unknown provider: {provider} (expected 'azure' or 'local')")]
    InvalidProvider { provider: String },
}

/// Estimated cost of a single agent invocation. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub agent_key: String,
    pub provider: Provider,
    pub tokens: u64,
    pub multiplier: Decimal,
    pub amount_eur: Decimal,
}

/// Per-provider base price in €/token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderPricing {
    pub eur_per_token: Decimal,
}

impl ProviderPricing {
    pub const fn new(eur_per_token: Decimal) -> Self {
        Self { eur_per_token }
    }
}

/// Price table mapping providers (and per-agent overrides) to €/token rates.
///
/// Lookup order: exact agent-key override, then provider base price.
#[derive(Debug, Clone)]
pub struct PriceTable {
    providers: HashMap<Provider, ProviderPricing>,
    agent_overrides: HashMap<String, ProviderPricing>,
    default: ProviderPricing,
}

impl PriceTable {
    pub fn builder() -> PriceTableBuilder {
        PriceTableBuilder::new()
    }

    pub fn get(&self, agent_key: &str, provider: Provider) -> &ProviderPricing {
        self.agent_overrides
            .get(agent_key)
            .or_else(|| self.providers.get(&provider))
            .unwrap_or(&self.default)
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        global_price_table().clone()
    }
}

#[derive(Debug, Default)]
pub struct PriceTableBuilder {
    providers: HashMap<Provider, ProviderPricing>,
    agent_overrides: HashMap<String, ProviderPricing>,
    default: Option<ProviderPricing>,
}

impl PriceTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self) -> Self {
        self.providers
            .insert(Provider::Azure, ProviderPricing::new(dec!(0.00002)));
        // Self-hosted models bill no per-token cost.
        self.providers
            .insert(Provider::Local, ProviderPricing::new(dec!(0)));
        self
    }

    pub fn provider(mut self, provider: Provider, pricing: ProviderPricing) -> Self {
        self.providers.insert(provider, pricing);
        self
    }

    pub fn agent_override(mut self, agent_key: impl Into<String>, eur_per_token: Decimal) -> Self {
        self.agent_overrides
            .insert(agent_key.into(), ProviderPricing::new(eur_per_token));
        self
    }

    pub fn default_pricing(mut self, pricing: ProviderPricing) -> Self {
        self.default = Some(pricing);
        self
    }

    pub fn from_env(mut self) -> Self {
        self = self.with_defaults();

        if let Some(pricing) = Self::parse_env_pricing("AZURE") {
            self.providers.insert(Provider::Azure, pricing);
        }
        if let Some(pricing) = Self::parse_env_pricing("LOCAL") {
            self.providers.insert(Provider::Local, pricing);
        }

        self
    }

    fn parse_env_pricing(provider: &str) -> Option<ProviderPricing> {
        let rate = std::env::var(format!("FINOPS_PRICING_{}_EUR_PER_TOKEN", provider))
            .ok()?
            .parse::<Decimal>()
            .ok()?;
        Some(ProviderPricing::new(rate))
    }

    pub fn build(self) -> PriceTable {
        let default = self
            .default
            .or_else(|| self.providers.get(&Provider::Azure).copied())
            .unwrap_or(ProviderPricing::new(dec!(0.00002)));

        PriceTable {
            providers: self.providers,
            agent_overrides: self.agent_overrides,
            default,
        }
    }
}

static GLOBAL_PRICES: LazyLock<PriceTable> =
    LazyLock::new(|| PriceTableBuilder::new().from_env().build());

pub fn global_price_table() -> &'static PriceTable {
    &GLOBAL_PRICES
}

/// Fallbacks applied when the request descriptor omits provider or tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    pub default_provider: Provider,
    pub default_tokens: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            default_provider: Provider::Azure,
            default_tokens: 1_000,
        }
    }
}

/// Pure, deterministic cost estimator.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    prices: PriceTable,
    config: EstimatorConfig,
}

impl CostEstimator {
    pub fn new(prices: PriceTable, config: EstimatorConfig) -> Self {
        Self { prices, config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimate the cost of one invocation in EUR, rounded half-up to 4 places.
    pub fn estimate(
        &self,
        agent_key: &str,
        provider: Option<Provider>,
        tokens: Option<u64>,
    ) -> CostEstimate {
        let provider = provider.unwrap_or(self.config.default_provider);
        let tokens = tokens.unwrap_or(self.config.default_tokens);

        let multiplier = if is_director_agent(agent_key) {
            DIRECTOR_MULTIPLIER
        } else {
            Decimal::ONE
        };

        let rate = self.prices.get(agent_key, provider).eur_per_token;
        let mut amount_eur = (rate * Decimal::from(tokens) * multiplier)
            .round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero);
        // Fixed four-place scale so header rendering is stable.
        amount_eur.rescale(AMOUNT_SCALE);

        CostEstimate {
            agent_key: agent_key.to_string(),
            provider,
            tokens,
            multiplier,
            amount_eur,
        }
    }
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self::new(PriceTable::default(), EstimatorConfig::default())
    }
}

/// Director-class agents carry a pricing surcharge. The convention covers
/// `sales_director_agent`, `director-of-ops`, `cfo_director`, etc.
fn is_director_agent(agent_key: &str) -> bool {
    let key = agent_key.to_lowercase();
    key.split(['_', '-', '.']).any(|part| part == "director")
}

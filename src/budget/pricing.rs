//! Model pricing - per-1000-unit rates keyed by provider and model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Rate used when no exact provider/model entry exists.
pub const DEFAULT_FALLBACK_RATE: ModelRate = ModelRate {
    input_per_1k: 0.01,
    output_per_1k: 0.03,
};

/// Price per 1000 metered units, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelRate {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// `true` when both rates are finite and not negative.
    pub fn is_valid(&self) -> bool {
        [self.input_per_1k, self.output_per_1k]
            .iter()
            .all(|r| r.is_finite() && *r >= 0.0)
    }

    /// Cost in USD for the given unit counts.
    pub fn cost(&self, input_units: u64, output_units: u64) -> f64 {
        (input_units as f64 / 1000.0) * self.input_per_1k
            + (output_units as f64 / 1000.0) * self.output_per_1k
    }
}

/// Where a quoted rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSource {
    Exact,
    Fallback,
}

/// A rate returned by [`PricingTable::quote`].
#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    pub rate: ModelRate,
    pub source: RateSource,
}

impl PriceQuote {
    pub fn is_fallback(&self) -> bool {
        self.source == RateSource::Fallback
    }
}

/// One row of the pricing table as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingRow {
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub rate: ModelRate,
}

/// Pricing table as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingConfig {
    #[serde(default = "default_fallback")]
    pub fallback: ModelRate,
    #[serde(default)]
    pub rates: Vec<PricingRow>,
}

fn default_fallback() -> ModelRate {
    DEFAULT_FALLBACK_RATE
}

impl PricingConfig {
    /// Reject rates that are negative, infinite or NaN, including the fallback.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rows = std::iter::once(("*", "*", &self.fallback)).chain(
            self.rates
                .iter()
                .map(|row| (row.provider.as_str(), row.model.as_str(), &row.rate)),
        );
        for (provider, model, rate) in rows {
            if rate.is_valid() {
                continue;
            }
            let value = if rate.input_per_1k.is_finite() && rate.input_per_1k >= 0.0 {
                rate.output_per_1k
            } else {
                rate.input_per_1k
            };
            return Err(ConfigError::InvalidRate {
                provider: provider.to_string(),
                model: model.to_string(),
                value,
            });
        }
        Ok(())
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            fallback: DEFAULT_FALLBACK_RATE,
            rates: Vec::new(),
        }
    }
}

/// Lookup table from (provider, model) to rates.
///
/// A missing entry is not an error: the explicit fallback rate is quoted and
/// the caller decides whether to log it.
#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<(String, String), ModelRate>,
    fallback: ModelRate,
}

impl PricingTable {
    pub fn new(fallback: ModelRate) -> Self {
        Self {
            rates: HashMap::new(),
            fallback,
        }
    }

    pub fn from_config(config: &PricingConfig) -> Self {
        let mut table = Self::new(config.fallback);
        for row in &config.rates {
            table.insert(&row.provider, &row.model, row.rate);
        }
        table
    }

    /// Builder-style insert.
    pub fn with_rate(mut self, provider: &str, model: &str, rate: ModelRate) -> Self {
        self.insert(provider, model, rate);
        self
    }

    pub fn insert(&mut self, provider: &str, model: &str, rate: ModelRate) {
        self.rates
            .insert((provider.to_string(), model.to_string()), rate);
    }

    pub fn fallback(&self) -> ModelRate {
        self.fallback
    }

    /// Quote the rate for a provider/model pair.
    pub fn quote(&self, provider: &str, model: &str) -> PriceQuote {
        match self.rates.get(&(provider.to_string(), model.to_string())) {
            Some(rate) => PriceQuote {
                rate: *rate,
                source: RateSource::Exact,
            },
            None => PriceQuote {
                rate: self.fallback,
                source: RateSource::Fallback,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_is_per_thousand_units() {
        let rate = ModelRate::new(3.0, 15.0);
        let cost = rate.cost(2000, 500);
        assert!((cost - (6.0 + 7.5)).abs() < 1e-9);
    }

    #[test]
    fn test_exact_match_wins_over_fallback() {
        let table =
            PricingTable::default().with_rate("anthropic", "sonnet", ModelRate::new(3.0, 15.0));

        let quote = table.quote("anthropic", "sonnet");
        assert!(!quote.is_fallback());
        assert_eq!(quote.rate, ModelRate::new(3.0, 15.0));
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        let table = PricingTable::new(ModelRate::new(1.0, 2.0))
            .with_rate("anthropic", "sonnet", ModelRate::new(3.0, 15.0));

        // Same model name under a different provider is not an exact match
        let quote = table.quote("openrouter", "sonnet");
        assert!(quote.is_fallback());
        assert_eq!(quote.rate, ModelRate::new(1.0, 2.0));
    }

    #[test]
    fn test_from_config_rows() {
        let config = PricingConfig {
            fallback: ModelRate::new(0.5, 0.5),
            rates: vec![PricingRow {
                provider: "openai".to_string(),
                model: "gpt-4o".to_string(),
                rate: ModelRate::new(2.5, 10.0),
            }],
        };
        let table = PricingTable::from_config(&config);
        assert_eq!(table.len(), 1);
        assert_eq!(table.fallback(), ModelRate::new(0.5, 0.5));
        assert!(!table.quote("openai", "gpt-4o").is_fallback());
    }

    #[test]
    fn test_validate_rejects_unusable_rates() {
        assert!(PricingConfig::default().validate().is_ok());

        let negative_fallback = PricingConfig {
            fallback: ModelRate::new(-0.01, 0.03),
            rates: Vec::new(),
        };
        match negative_fallback.validate() {
            Err(ConfigError::InvalidRate {
                provider, value, ..
            }) => {
                assert_eq!(provider, "*");
                assert_eq!(value, -0.01);
            }
            other => panic!("expected InvalidRate, got {:?}", other),
        }

        for bad in [f64::NAN, f64::INFINITY] {
            let config = PricingConfig {
                rates: vec![PricingRow {
                    provider: "acme".to_string(),
                    model: "bad".to_string(),
                    rate: ModelRate::new(1.0, bad),
                }],
                ..Default::default()
            };
            match config.validate() {
                Err(ConfigError::InvalidRate { provider, model, .. }) => {
                    assert_eq!((provider.as_str(), model.as_str()), ("acme", "bad"));
                }
                other => panic!("expected InvalidRate, got {:?}", other),
            }
        }
    }
}

//! Pricing catalog: exact-match price lookup and call costing.

pub mod loader;

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::error::GatewayError;
use crate::money::MONEY_SCALE;
use crate::proxy::usage::UsageTotals;
use crate::store::Store;

/// Per-1k prices and markup for one model.
#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub model_name: String,
    pub input_per_1k: Decimal,
    pub cache_read_per_1k: Decimal,
    pub cache_create_per_1k: Decimal,
    pub output_per_1k: Decimal,
    pub markup: Decimal,
}

pub struct Catalog {
    store: Arc<Store>,
}

impl Catalog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Exact-match lookup on the normalized model name.
    pub fn price(&self, model: &str) -> Result<PriceQuote, GatewayError> {
        let pricing = self
            .store
            .get_pricing(model)?
            .ok_or_else(|| GatewayError::PricingMissing(model.to_string()))?;
        Ok(PriceQuote {
            model_name: pricing.model_name,
            input_per_1k: pricing.input_price_per_1k,
            cache_read_per_1k: pricing.cache_read_price_per_1k,
            cache_create_per_1k: pricing.cache_create_price_per_1k,
            output_per_1k: pricing.output_price_per_1k,
            markup: pricing.markup_multiplier,
        })
    }
}

/// Cost of a call: cached reads and cache creation are priced at their own
/// rates, the rest of the input at the full rate, all per 1k tokens, then
/// marked up.
pub fn compute_cost(quote: &PriceQuote, usage: &UsageTotals) -> Decimal {
    let billable_input = Decimal::from(usage.billable_input());
    let cache_read = Decimal::from(usage.cached_tokens.max(0));
    let cache_create = Decimal::from(usage.cache_creation_tokens.max(0));
    let output = Decimal::from(usage.output_tokens.max(0));

    let raw = (billable_input * quote.input_per_1k
        + cache_read * quote.cache_read_per_1k
        + cache_create * quote.cache_create_per_1k
        + output * quote.output_per_1k)
        / Decimal::from(1000);
    (raw * quote.markup).round_dp(MONEY_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(input: &str, output: &str, cache_read: &str, markup: &str) -> PriceQuote {
        PriceQuote {
            model_name: "gpt-5.1-codex".to_string(),
            input_per_1k: input.parse().unwrap(),
            cache_read_per_1k: cache_read.parse().unwrap(),
            cache_create_per_1k: cache_read.parse().unwrap(),
            output_per_1k: output.parse().unwrap(),
            markup: markup.parse().unwrap(),
        }
    }

    #[test]
    fn plain_call_costs_per_thousand() {
        // 10 input at $0.00125/1k + 5 output at $0.01/1k, no markup.
        let usage = UsageTotals {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };
        let cost = compute_cost(&quote("0.00125", "0.01", "0", "1"), &usage);
        assert_eq!(cost, "0.0000625".parse::<Decimal>().unwrap());
    }

    #[test]
    fn cached_input_priced_at_cache_rate() {
        // input=1234 with 1000 cache reads: 234 billable at full rate.
        let usage = UsageTotals {
            input_tokens: 1234,
            output_tokens: 77,
            cached_tokens: 1000,
            ..Default::default()
        };
        assert_eq!(usage.billable_input(), 234);
        let q = quote("0.00125", "0.01", "0.000125", "1");
        let cost = compute_cost(&q, &usage);
        let expected = (Decimal::from(234) * q.input_per_1k
            + Decimal::from(1000) * q.cache_read_per_1k
            + Decimal::from(77) * q.output_per_1k)
            / Decimal::from(1000);
        assert_eq!(cost, expected.round_dp(MONEY_SCALE));
    }

    #[test]
    fn markup_multiplies_the_sum() {
        let usage = UsageTotals {
            input_tokens: 1000,
            output_tokens: 1000,
            ..Default::default()
        };
        let base = compute_cost(&quote("0.001", "0.002", "0", "1"), &usage);
        let marked = compute_cost(&quote("0.001", "0.002", "0", "1.5"), &usage);
        assert_eq!(marked, (base * "1.5".parse::<Decimal>().unwrap()).round_dp(MONEY_SCALE));
    }

    #[test]
    fn missing_model_is_an_error() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let catalog = Catalog::new(store);
        let err = catalog.price("nope").unwrap_err();
        assert!(matches!(err, GatewayError::PricingMissing(_)));
    }
}

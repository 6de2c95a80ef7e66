use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

use super::{fmt_ts, parse_ts, Store};
use crate::error::GatewayError;
use crate::models::ModelPricing;
use crate::money;

fn pricing_from_row(row: &Row<'_>) -> rusqlite::Result<ModelPricing> {
    let markup: String = row.get("markup_multiplier")?;
    Ok(ModelPricing {
        id: row.get("id")?,
        model_name: row.get("model_name")?,
        input_price_per_1k: money::from_nanos(row.get("input_nanos_per_1k")?),
        cache_read_price_per_1k: money::from_nanos(row.get("cache_read_nanos_per_1k")?),
        cache_create_price_per_1k: money::from_nanos(row.get("cache_create_nanos_per_1k")?),
        output_price_per_1k: money::from_nanos(row.get("output_nanos_per_1k")?),
        markup_multiplier: markup.parse::<Decimal>().unwrap_or(Decimal::ONE),
        effective_from: parse_ts(&row.get::<_, String>("effective_from")?),
    })
}

const PRICING_COLS: &str = "id, model_name, input_nanos_per_1k, cache_read_nanos_per_1k, \
                            cache_create_nanos_per_1k, output_nanos_per_1k, markup_multiplier, \
                            effective_from";

/// Prices per 1k tokens for one model.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PricingSpec {
    pub model_name: String,
    pub input_price_per_1k: Decimal,
    #[serde(default)]
    pub cache_read_price_per_1k: Decimal,
    #[serde(default)]
    pub cache_create_price_per_1k: Decimal,
    pub output_price_per_1k: Decimal,
    #[serde(default = "default_markup")]
    pub markup_multiplier: Decimal,
}

fn default_markup() -> Decimal {
    "1.5".parse().expect("literal decimal")
}

impl Store {
    /// Exact-match lookup on the normalized model name.
    pub fn get_pricing(&self, model_name: &str) -> Result<Option<ModelPricing>, GatewayError> {
        let conn = self.conn();
        let pricing = conn
            .query_row(
                &format!("SELECT {PRICING_COLS} FROM model_pricing WHERE model_name = ?1"),
                params![model_name],
                pricing_from_row,
            )
            .optional()?;
        Ok(pricing)
    }

    pub fn list_pricing(&self) -> Result<Vec<ModelPricing>, GatewayError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PRICING_COLS} FROM model_pricing ORDER BY model_name"
        ))?;
        let rows = stmt
            .query_map([], pricing_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Upsert a pricing row (admin writes and the startup seed).
    pub fn upsert_pricing(&self, spec: &PricingSpec) -> Result<(), GatewayError> {
        self.conn().execute(
            "INSERT INTO model_pricing (model_name, input_nanos_per_1k, cache_read_nanos_per_1k,
                                        cache_create_nanos_per_1k, output_nanos_per_1k,
                                        markup_multiplier, effective_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(model_name) DO UPDATE SET
                 input_nanos_per_1k = ?2, cache_read_nanos_per_1k = ?3,
                 cache_create_nanos_per_1k = ?4, output_nanos_per_1k = ?5,
                 markup_multiplier = ?6",
            params![
                spec.model_name,
                money::to_nanos(spec.input_price_per_1k),
                money::to_nanos(spec.cache_read_price_per_1k),
                money::to_nanos(spec.cache_create_price_per_1k),
                money::to_nanos(spec.output_price_per_1k),
                spec.markup_multiplier.to_string(),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Insert-only variant used by the remote catalog sync. Returns whether a
    /// row was created.
    pub fn insert_pricing_if_absent(&self, spec: &PricingSpec) -> Result<bool, GatewayError> {
        let n = self.conn().execute(
            "INSERT OR IGNORE INTO model_pricing
                 (model_name, input_nanos_per_1k, cache_read_nanos_per_1k,
                  cache_create_nanos_per_1k, output_nanos_per_1k, markup_multiplier,
                  effective_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                spec.model_name,
                money::to_nanos(spec.input_price_per_1k),
                money::to_nanos(spec.cache_read_price_per_1k),
                money::to_nanos(spec.cache_create_price_per_1k),
                money::to_nanos(spec.output_price_per_1k),
                spec.markup_multiplier.to_string(),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(n > 0)
    }

    /// Seed the served Codex family so a fresh install can price calls.
    pub fn seed_default_pricing(&self) -> Result<(), GatewayError> {
        let seed = |model: &str, input: &str, output: &str, cache: &str| PricingSpec {
            model_name: model.to_string(),
            input_price_per_1k: input.parse().expect("literal decimal"),
            cache_read_price_per_1k: cache.parse().expect("literal decimal"),
            cache_create_price_per_1k: cache.parse().expect("literal decimal"),
            output_price_per_1k: output.parse().expect("literal decimal"),
            markup_multiplier: Decimal::ONE,
        };
        let rows = [
            seed("gpt-5.1-codex", "0.00125", "0.01", "0.000125"),
            seed("gpt-5.1-codex-mini", "0.00025", "0.002", "0.000025"),
            seed("gpt-5.1-codex-max", "0.00125", "0.01", "0.000125"),
            seed("gpt-5.2-codex", "0.00175", "0.014", "0.000175"),
            seed("gpt-5.1", "0.00125", "0.01", "0.000125"),
            seed("gpt-5.2", "0.00175", "0.014", "0.000175"),
        ];
        for spec in &rows {
            self.upsert_pricing(spec)?;
        }
        log::info!("[Pricing] Seeded {} default models", rows.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_then_lookup() {
        let store = Store::open_in_memory().unwrap();
        store.seed_default_pricing().unwrap();

        let pricing = store.get_pricing("gpt-5.1-codex").unwrap().unwrap();
        assert_eq!(pricing.input_price_per_1k, "0.00125".parse().unwrap());
        assert_eq!(pricing.output_price_per_1k, "0.01".parse().unwrap());
        assert_eq!(pricing.markup_multiplier, Decimal::ONE);
        assert!(store.get_pricing("unknown-model").unwrap().is_none());
    }

    #[test]
    fn insert_if_absent_never_overwrites() {
        let store = Store::open_in_memory().unwrap();
        let mut spec = PricingSpec {
            model_name: "gpt-5.1-codex".to_string(),
            input_price_per_1k: "0.00125".parse().unwrap(),
            cache_read_price_per_1k: Decimal::ZERO,
            cache_create_price_per_1k: Decimal::ZERO,
            output_price_per_1k: "0.01".parse().unwrap(),
            markup_multiplier: Decimal::ONE,
        };
        assert!(store.insert_pricing_if_absent(&spec).unwrap());

        spec.input_price_per_1k = "9.99".parse().unwrap();
        assert!(!store.insert_pricing_if_absent(&spec).unwrap());
        let pricing = store.get_pricing("gpt-5.1-codex").unwrap().unwrap();
        assert_eq!(pricing.input_price_per_1k, "0.00125".parse().unwrap());
    }
}

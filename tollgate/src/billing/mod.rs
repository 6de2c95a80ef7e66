//! Billing engine: turns extracted usage and a price quote into one
//! transactional charge.

pub mod expirer;

use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::money;
use crate::proxy::usage::UsageTotals;
use crate::store::{BillParams, BillingError, Store};
use crate::timezone;

pub struct BillingEngine {
    store: Arc<Store>,
}

impl BillingEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Debit package quota then balance under the daily cap, append the usage
    /// log and advance the key's cumulative usage, all in one transaction.
    pub fn charge(
        &self,
        user_id: Uuid,
        api_key_id: i64,
        model: &str,
        usage: &UsageTotals,
        cost: Decimal,
        latency_ms: i64,
        status_code: u16,
    ) -> Result<(), GatewayError> {
        let params = BillParams {
            user_id,
            api_key_id,
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_tokens: usage.cached_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            total_tokens: usage.total(),
            cost_nanos: money::to_nanos(cost),
            latency_ms,
            status_code,
        };
        self.store
            .bill(&params, timezone::today())
            .map_err(|e| match e {
                BillingError::DailyLimitExceeded => GatewayError::DailyLimitExceeded,
                BillingError::InsufficientBalance => GatewayError::InsufficientBalance,
                BillingError::ApiKeyQuotaExceeded => GatewayError::KeyQuotaExceeded,
                BillingError::Storage(err) => {
                    log::error!("billing transaction failed: {err}");
                    GatewayError::BillingFailed
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_billing_errors_onto_402s() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let user = store
            .create_user("e@example.com", Decimal::ZERO, None)
            .unwrap();
        let key = store
            .create_api_key(user.id, "k", "hash-engine", "sk-engin", None)
            .unwrap();
        let engine = BillingEngine::new(Arc::clone(&store));

        let usage = UsageTotals {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };
        let err = engine
            .charge(user.id, key.id, "gpt-5.1-codex", &usage, "0.01".parse().unwrap(), 5, 200)
            .unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientBalance));
    }
}

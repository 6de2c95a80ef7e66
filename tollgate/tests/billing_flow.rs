//! End-to-end billing flow against an in-memory store: price extraction,
//! charging, caps, and the key-material hygiene guarantee.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;

use tollgate::admission::generate_api_key;
use tollgate::billing::BillingEngine;
use tollgate::models::{ApiKey, User};
use tollgate::pricing::{compute_cost, Catalog};
use tollgate::proxy::usage::extract_from_response;
use tollgate::store::pricing::PricingSpec;
use tollgate::store::Store;
use tollgate::timezone;

fn setup(balance: &str, daily_limit: Option<&str>) -> (Arc<Store>, User, ApiKey, String) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store
        .upsert_pricing(&PricingSpec {
            model_name: "gpt-5.1-codex".to_string(),
            input_price_per_1k: "0.00125".parse().unwrap(),
            cache_read_price_per_1k: "0.000125".parse().unwrap(),
            cache_create_price_per_1k: "0.000125".parse().unwrap(),
            output_price_per_1k: "0.01".parse().unwrap(),
            markup_multiplier: Decimal::ONE,
        })
        .unwrap();
    let user = store
        .create_user(
            "flow@example.com",
            balance.parse().unwrap(),
            daily_limit.map(|s| s.parse().unwrap()),
        )
        .unwrap();
    let (raw, hash, prefix) = generate_api_key();
    let key = store
        .create_api_key(user.id, "flow", &hash, &prefix, None)
        .unwrap();
    (store, user, key, raw)
}

#[test]
fn happy_path_charges_the_documented_amount() {
    let (store, user, key, _) = setup("10", None);
    let catalog = Catalog::new(Arc::clone(&store));
    let engine = BillingEngine::new(Arc::clone(&store));

    // The upstream's non-streaming reply.
    let response = json!({
        "id": "chatcmpl-1",
        "model": "gpt-5.1-codex",
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        "choices": [{"message": {"role": "assistant", "content": "hi"}}]
    });
    let totals = extract_from_response(&response).unwrap();
    let quote = catalog.price("gpt-5.1-codex").unwrap();
    let cost = compute_cost(&quote, &totals);
    assert_eq!(cost, "0.0000625".parse::<Decimal>().unwrap());

    engine
        .charge(user.id, key.id, "gpt-5.1-codex", &totals, cost, 12, 200)
        .unwrap();

    let balance = store.get_user(user.id).unwrap().unwrap().balance;
    assert_eq!(balance, "9.9999375".parse::<Decimal>().unwrap());

    let (logs, total) = store.list_usage_logs(Some(user.id), None, 1, 10).unwrap();
    assert_eq!(total, 1);
    assert_eq!(logs[0].total_tokens, 15);
    assert_eq!(logs[0].input_tokens, 10);
    assert_eq!(logs[0].output_tokens, 5);

    let keys = store.list_keys_for_user(user.id).unwrap();
    assert_eq!(keys[0].total_usage, 15);
}

#[test]
fn streaming_usage_event_prices_like_the_spec_scenario() {
    let (store, user, key, _) = setup("10", None);
    let catalog = Catalog::new(Arc::clone(&store));
    let engine = BillingEngine::new(Arc::clone(&store));

    // Authoritative usage from a response.completed event.
    let usage = json!({
        "input_tokens": 50,
        "output_tokens": 80,
        "input_tokens_details": {"cache_read_tokens": 40}
    });
    let totals = tollgate::proxy::usage::usage_from_object(&usage).unwrap();
    assert_eq!(totals.billable_input(), 10);

    let quote = catalog.price("gpt-5.1-codex").unwrap();
    let cost = compute_cost(&quote, &totals);
    let expected = (Decimal::from(10) * quote.input_per_1k
        + Decimal::from(40) * quote.cache_read_per_1k
        + Decimal::from(80) * quote.output_per_1k)
        / Decimal::from(1000);
    assert_eq!(cost, expected.round_dp(9));

    engine
        .charge(user.id, key.id, "gpt-5.1-codex", &totals, cost, 80, 200)
        .unwrap();
    let (logs, _) = store.list_usage_logs(Some(user.id), None, 1, 10).unwrap();
    assert_eq!(logs[0].cached_tokens, 40);
    assert_eq!(logs[0].total_tokens, 130);
}

#[test]
fn daily_cap_rejects_then_accepts_smaller_call() {
    let (store, user, key, _) = setup("100", Some("0.50"));
    let engine = BillingEngine::new(Arc::clone(&store));
    let totals = tollgate::proxy::usage::UsageTotals {
        input_tokens: 10,
        output_tokens: 5,
        ..Default::default()
    };

    let err = engine
        .charge(user.id, key.id, "gpt-5.1-codex", &totals, "0.60".parse().unwrap(), 5, 200)
        .unwrap_err();
    assert_eq!(err.to_string(), "daily limit exceeded");
    assert_eq!(store.get_user(user.id).unwrap().unwrap().balance, Decimal::from(100));
    let (_, count) = store.list_usage_logs(Some(user.id), None, 1, 10).unwrap();
    assert_eq!(count, 0);

    engine
        .charge(user.id, key.id, "gpt-5.1-codex", &totals, "0.40".parse().unwrap(), 5, 200)
        .unwrap();
    let logged = store.usage_stats(user.id, timezone::today()).unwrap();
    assert_eq!(logged.today_cost, "0.40".parse::<Decimal>().unwrap());
}

#[test]
fn concurrent_charges_never_drive_balance_negative() {
    let (store, user, key, _) = setup("0.005", None);
    let totals = tollgate::proxy::usage::UsageTotals {
        input_tokens: 1000,
        output_tokens: 1000,
        ..Default::default()
    };

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = Arc::clone(&store);
        let totals = totals;
        let user_id = user.id;
        let key_id = key.id;
        handles.push(std::thread::spawn(move || {
            let engine = BillingEngine::new(store);
            engine
                .charge(user_id, key_id, "gpt-5.1-codex", &totals, "0.002".parse().unwrap(), 1, 200)
                .is_ok()
        }));
    }
    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    // 0.005 funds exactly two 0.002 charges.
    assert_eq!(successes, 2);
    let balance = store.get_user(user.id).unwrap().unwrap().balance;
    assert!(balance >= Decimal::ZERO);
    assert_eq!(balance, "0.001".parse::<Decimal>().unwrap());
}

#[test]
fn raw_key_material_never_reaches_the_store() {
    let (store, user, key, raw) = setup("10", None);
    let engine = BillingEngine::new(Arc::clone(&store));
    let totals = tollgate::proxy::usage::UsageTotals {
        input_tokens: 10,
        output_tokens: 5,
        ..Default::default()
    };
    engine
        .charge(user.id, key.id, "gpt-5.1-codex", &totals, "0.01".parse().unwrap(), 3, 200)
        .unwrap();

    // Everything persisted about the key is the prefix and the hash.
    let keys = store.list_keys_for_user(user.id).unwrap();
    assert_eq!(keys.len(), 1);
    assert_ne!(keys[0].key_hash, raw);
    assert!(!keys[0].key_hash.contains(&raw[3..]));
    assert_eq!(keys[0].key_prefix.len(), 7);
    assert!(raw.starts_with(&keys[0].key_prefix));

    // Serialized representations never leak the hash or the raw key.
    let serialized = serde_json::to_string(&keys).unwrap();
    assert!(!serialized.contains(&raw));
    assert!(!serialized.contains(&keys[0].key_hash));
}

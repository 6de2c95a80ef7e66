//! Explicit wiring of the core components.
//!
//! One builder assembles stores, catalog, registry, health checker, limiter
//! and billing engine; handlers receive the whole context as axum state.
//! There are no process-wide singletons.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tollgate_config::GatewayConfig;

use crate::billing::BillingEngine;
use crate::error::GatewayError;
use crate::pricing::Catalog;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::store::Store;
use crate::upstream::health::HealthChecker;
use crate::upstream::UpstreamRegistry;

/// Minimum spacing between persisted `last_used_at` writes per key.
pub const LAST_USED_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<Store>,
    pub catalog: Arc<Catalog>,
    pub registry: Arc<UpstreamRegistry>,
    pub health: Arc<HealthChecker>,
    pub limiter: Arc<RateLimiter>,
    pub billing: Arc<BillingEngine>,
    pub http: reqwest::Client,
    last_used: Arc<Mutex<HashMap<i64, Instant>>>,
}

impl AppState {
    pub fn build(config: GatewayConfig, store: Store) -> Result<Self, GatewayError> {
        let store = Arc::new(store);
        store.ensure_settings()?;

        let registry = Arc::new(UpstreamRegistry::new(Arc::clone(&store)));
        if let Err(e) = registry.refresh() {
            log::warn!("initial upstream refresh failed: {e}");
        }

        let health = Arc::new(HealthChecker::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Duration::from_secs(config.health_check_interval_secs),
            Duration::from_secs(config.health_check_timeout_secs),
            config.health_check_max_failures,
        ));

        let settings = store.get_settings()?;
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            enabled: settings.rate_limit_enabled,
            requests_per_minute: settings.rate_limit_rpm,
            burst: settings.rate_limit_burst,
        }));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream_timeout_secs))
            .pool_max_idle_per_host(config.upstream_pool_per_host)
            .pool_idle_timeout(Duration::from_secs(config.upstream_pool_idle_secs))
            .build()
            .map_err(|e| GatewayError::Storage(format!("http client: {e}")))?;

        Ok(Self {
            config: Arc::new(config),
            catalog: Arc::new(Catalog::new(Arc::clone(&store))),
            billing: Arc::new(BillingEngine::new(Arc::clone(&store))),
            registry,
            health,
            limiter,
            http,
            store,
            last_used: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Process-wide throttle for `last_used_at` writes: true at most once per
    /// interval per key. The store-side guard handles other processes.
    pub fn should_touch_last_used(&self, api_key_id: i64) -> bool {
        let now = Instant::now();
        let mut map = self.last_used.lock().expect("last_used lock poisoned");
        match map.get(&api_key_id) {
            Some(last) if now.duration_since(*last) < LAST_USED_INTERVAL => false,
            _ => {
                map.insert(api_key_id, now);
                true
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    let mut config = test_config();
    config.admin_token = "test-admin-token".to_string();
    AppState::build(config, Store::open_in_memory().unwrap()).unwrap()
}

#[cfg(test)]
pub(crate) fn test_config() -> GatewayConfig {
    GatewayConfig {
        port: 0,
        database_path: ":memory:".into(),
        admin_token: String::new(),
        upstream_timeout_secs: 5,
        upstream_pool_per_host: 10,
        upstream_pool_idle_secs: 90,
        health_check_interval_secs: 60,
        health_check_timeout_secs: 10,
        health_check_max_failures: 3,
        pricing_url: String::new(),
        pricing_cache_dir: "./data/pricing".into(),
        shutdown_grace_secs: 5,
    }
}

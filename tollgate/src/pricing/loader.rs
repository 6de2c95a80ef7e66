//! Background loader for the remote model-price catalog.
//!
//! Downloads the LiteLLM price table at most once per 24 h (a 10-minute tick
//! checks whether the interval elapsed), keeps a disk cache next to a sha256
//! marker, and reconciles new Codex/GPT-5-family models into the store
//! insert-only so operator-set prices are never clobbered.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::store::pricing::PricingSpec;
use crate::store::Store;

const UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const CHECK_INTERVAL: Duration = Duration::from_secs(600);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const CACHE_FILE: &str = "pricing.json";
const HASH_FILE: &str = "pricing.sha256";
const SYNC_MARKUP: &str = "1.5";

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePrice {
    #[serde(default)]
    pub input_cost_per_token: f64,
    #[serde(default)]
    pub output_cost_per_token: f64,
    #[serde(default)]
    pub cache_read_input_token_cost: f64,
    #[serde(default)]
    pub cache_creation_input_token_cost: f64,
}

#[derive(Default)]
struct LoaderState {
    last_updated: Option<SystemTime>,
    local_hash: String,
}

pub struct PricingLoader {
    http: reqwest::Client,
    url: String,
    cache_dir: PathBuf,
    store: Arc<Store>,
    data: RwLock<HashMap<String, RemotePrice>>,
    state: RwLock<LoaderState>,
}

impl PricingLoader {
    pub fn new(url: String, cache_dir: PathBuf, store: Arc<Store>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .expect("pricing http client");
        Self {
            http,
            url,
            cache_dir,
            store,
            data: RwLock::new(HashMap::new()),
            state: RwLock::new(LoaderState::default()),
        }
    }

    /// Load from a fresh-enough disk cache, otherwise download. Failure is
    /// non-fatal: the seeded store prices keep the gateway serving.
    pub async fn initialize(&self) {
        if let Err(e) = std::fs::create_dir_all(&self.cache_dir) {
            log::warn!("[Pricing] Failed to create cache directory: {e}");
        }

        let cache_file = self.cache_dir.join(CACHE_FILE);
        if let Ok(meta) = std::fs::metadata(&cache_file) {
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok());
            if age.is_some_and(|a| a < UPDATE_INTERVAL) && self.load_from_file().is_ok() {
                log::info!(
                    "[Pricing] Loaded {} models from cache",
                    self.data.read().unwrap().len()
                );
                return;
            }
        }

        if let Err(e) = self.download().await {
            log::warn!("[Pricing] Initial download failed: {e}");
        }
    }

    /// Periodic update task.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let due = {
                let state = self.state.read().unwrap();
                match state.last_updated {
                    Some(at) => SystemTime::now()
                        .duration_since(at)
                        .map_or(true, |elapsed| elapsed >= UPDATE_INTERVAL),
                    None => true,
                }
            };
            if !due {
                continue;
            }
            log::info!("[Pricing] Update interval reached, downloading...");
            if let Err(e) = self.download().await {
                log::warn!("[Pricing] Update failed: {e}");
            }
        }
    }

    async fn download(&self) -> Result<(), String> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| format!("download failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("unexpected status: {}", resp.status()));
        }
        let body = resp.bytes().await.map_err(|e| format!("read body: {e}"))?;

        let data = parse_catalog(&body)?;

        if let Err(e) = std::fs::write(self.cache_dir.join(CACHE_FILE), &body) {
            log::warn!("[Pricing] Failed to save cache: {e}");
        }
        let hash = hex::encode(Sha256::digest(&body));
        if let Err(e) = std::fs::write(self.cache_dir.join(HASH_FILE), &hash) {
            log::warn!("[Pricing] Failed to save hash marker: {e}");
        }

        let count = data.len();
        *self.data.write().unwrap() = data;
        {
            let mut state = self.state.write().unwrap();
            state.last_updated = Some(SystemTime::now());
            state.local_hash = hash;
        }
        self.sync_to_store();

        log::info!("[Pricing] Downloaded {count} models");
        Ok(())
    }

    fn load_from_file(&self) -> Result<(), String> {
        let path = self.cache_dir.join(CACHE_FILE);
        let bytes = std::fs::read(&path).map_err(|e| format!("read cache: {e}"))?;
        let data = parse_catalog(&bytes)?;
        let hash = hex::encode(Sha256::digest(&bytes));

        *self.data.write().unwrap() = data;
        let mut state = self.state.write().unwrap();
        state.local_hash = hash;
        state.last_updated = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        drop(state);

        self.sync_to_store();
        Ok(())
    }

    /// Insert-only reconciliation for the families this gateway serves.
    fn sync_to_store(&self) {
        let data = self.data.read().unwrap();
        let mut synced = 0usize;
        for (name, price) in data.iter() {
            if !name.contains("codex") && !name.contains("gpt-5") {
                continue;
            }
            let spec = PricingSpec {
                model_name: name.clone(),
                input_price_per_1k: per_1k(price.input_cost_per_token),
                cache_read_price_per_1k: per_1k(price.cache_read_input_token_cost),
                cache_create_price_per_1k: per_1k(price.cache_creation_input_token_cost),
                output_price_per_1k: per_1k(price.output_cost_per_token),
                markup_multiplier: SYNC_MARKUP.parse().expect("literal decimal"),
            };
            match self.store.insert_pricing_if_absent(&spec) {
                Ok(true) => synced += 1,
                Ok(false) => {}
                Err(e) => log::warn!("[Pricing] Failed to sync {name}: {e}"),
            }
        }
        if synced > 0 {
            log::info!("[Pricing] Synced {synced} new models into the store");
        }
    }

    pub fn status(&self) -> serde_json::Value {
        let state = self.state.read().unwrap();
        let marker = state.local_hash.get(..8).unwrap_or("").to_string();
        serde_json::json!({
            "model_count": self.data.read().unwrap().len(),
            "last_updated": state
                .last_updated
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            "local_hash": marker,
        })
    }
}

fn per_1k(cost_per_token: f64) -> rust_decimal::Decimal {
    rust_decimal::Decimal::try_from(cost_per_token * 1000.0)
        .unwrap_or_default()
        .round_dp(crate::money::MONEY_SCALE)
}

fn parse_catalog(bytes: &[u8]) -> Result<HashMap<String, RemotePrice>, String> {
    let raw: HashMap<String, serde_json::Value> =
        serde_json::from_slice(bytes).map_err(|e| format!("parse pricing: {e}"))?;

    let mut result = HashMap::new();
    for (name, entry) in raw {
        if name == "sample_spec" {
            continue;
        }
        let Ok(price) = serde_json::from_value::<RemotePrice>(entry) else {
            continue;
        };
        if price.input_cost_per_token > 0.0 || price.output_cost_per_token > 0.0 {
            result.insert(name.to_lowercase(), price);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const SAMPLE: &str = r#"{
        "sample_spec": {"input_cost_per_token": 1.0},
        "gpt-5.1-codex": {
            "input_cost_per_token": 0.00000125,
            "output_cost_per_token": 0.00001,
            "cache_read_input_token_cost": 0.000000125
        },
        "Free-Model": {"input_cost_per_token": 0.0, "output_cost_per_token": 0.0},
        "weird": "not an object"
    }"#;

    #[test]
    fn parse_skips_spec_free_and_malformed_entries() {
        let data = parse_catalog(SAMPLE.as_bytes()).unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("gpt-5.1-codex"));
    }

    #[test]
    fn per_token_costs_become_per_1k() {
        let data = parse_catalog(SAMPLE.as_bytes()).unwrap();
        let price = &data["gpt-5.1-codex"];
        assert_eq!(per_1k(price.input_cost_per_token), "0.00125".parse::<Decimal>().unwrap());
        assert_eq!(per_1k(price.output_cost_per_token), "0.01".parse::<Decimal>().unwrap());
        assert_eq!(
            per_1k(price.cache_read_input_token_cost),
            "0.000125".parse::<Decimal>().unwrap()
        );
    }

    #[tokio::test]
    async fn cached_copy_is_preferred_and_synced_insert_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), SAMPLE).unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        // Operator already priced this model; sync must not replace it.
        store
            .upsert_pricing(&PricingSpec {
                model_name: "gpt-5.1-codex".to_string(),
                input_price_per_1k: "0.009".parse().unwrap(),
                cache_read_price_per_1k: Decimal::ZERO,
                cache_create_price_per_1k: Decimal::ZERO,
                output_price_per_1k: "0.09".parse().unwrap(),
                markup_multiplier: Decimal::ONE,
            })
            .unwrap();

        let loader = PricingLoader::new(
            "http://unreachable.invalid/pricing.json".to_string(),
            dir.path().to_path_buf(),
            Arc::clone(&store),
        );
        loader.initialize().await;

        assert_eq!(loader.status()["model_count"], 1);
        let kept = store.get_pricing("gpt-5.1-codex").unwrap().unwrap();
        assert_eq!(kept.input_price_per_1k, "0.009".parse::<Decimal>().unwrap());
    }
}

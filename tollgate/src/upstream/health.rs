//! Active upstream health checking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use super::UpstreamRegistry;
use crate::models::{Upstream, UpstreamStatus};
use crate::store::Store;

pub struct HealthChecker {
    store: Arc<Store>,
    registry: Arc<UpstreamRegistry>,
    http: reqwest::Client,
    interval: Duration,
    max_failures: u32,
    failures: Mutex<HashMap<i64, u32>>,
}

impl HealthChecker {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<UpstreamRegistry>,
        interval: Duration,
        probe_timeout: Duration,
        max_failures: u32,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .expect("health http client");
        Self {
            store,
            registry,
            http,
            interval,
            max_failures,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Background loop: one cycle immediately, then on the configured
    /// interval. Each upstream is probed in its own task so a slow probe
    /// never stalls the cycle.
    pub async fn run(self: Arc<Self>) {
        log::info!("[HealthCheck] Started (interval: {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_cycle();
        }
    }

    /// Fire probes for every active or unhealthy upstream. Manually disabled
    /// upstreams are skipped.
    pub fn check_cycle(self: &Arc<Self>) {
        let upstreams = match self
            .store
            .list_upstreams_for(&[UpstreamStatus::Active, UpstreamStatus::Unhealthy])
        {
            Ok(list) => list,
            Err(e) => {
                log::warn!("[HealthCheck] Failed to load upstreams: {e}");
                return;
            }
        };
        log::info!("[HealthCheck] Checking {} upstreams", upstreams.len());
        for upstream in upstreams {
            let checker = Arc::clone(self);
            tokio::spawn(async move {
                let healthy = checker.probe(&upstream).await;
                checker.record_result(&upstream, healthy);
            });
        }
    }

    /// Minimal chat-completion probe. Any response below 500 means the
    /// endpoint is reachable; 4xx is auth/request trouble, not an outage.
    async fn probe(&self, upstream: &Upstream) -> bool {
        let url = format!("{}{}", upstream.base_url, upstream.health_check_path);
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "test"}],
            "max_tokens": 1,
        });
        let result = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", upstream.api_key))
            .json(&body)
            .send()
            .await;
        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                // Drain a little of the body, then drop the connection.
                let mut resp = resp;
                let _ = resp.chunk().await;
                let healthy = probe_status_is_healthy(status);
                if !healthy {
                    log::warn!(
                        "[HealthCheck] Upstream {} returned error (status: {status})",
                        upstream.name
                    );
                }
                healthy
            }
            Err(e) => {
                log::warn!("[HealthCheck] Request failed for {}: {e}", upstream.name);
                false
            }
        }
    }

    /// Apply one probe outcome to the failure counters and stored status.
    fn record_result(&self, upstream: &Upstream, healthy: bool) {
        let now = Utc::now();
        if healthy {
            self.failures.lock().unwrap().insert(upstream.id, 0);
            if upstream.status == UpstreamStatus::Unhealthy {
                if let Err(e) =
                    self.store
                        .update_upstream_status(upstream.id, UpstreamStatus::Active, now)
                {
                    log::warn!("[HealthCheck] Failed to update {}: {e}", upstream.name);
                    return;
                }
                log::info!("[HealthCheck] Upstream {} recovered (active)", upstream.name);
                if let Err(e) = self.registry.refresh() {
                    log::warn!("[HealthCheck] Registry refresh failed: {e}");
                }
            } else if let Err(e) = self.store.touch_upstream_checked(upstream.id, now) {
                log::warn!("[HealthCheck] Failed to touch {}: {e}", upstream.name);
            }
            return;
        }

        let count = {
            let mut failures = self.failures.lock().unwrap();
            let count = failures.entry(upstream.id).or_insert(0);
            *count += 1;
            *count
        };
        log::warn!(
            "[HealthCheck] Upstream {} check failed (failures: {count}/{})",
            upstream.name,
            self.max_failures
        );

        if count >= self.max_failures && upstream.status == UpstreamStatus::Active {
            if let Err(e) =
                self.store
                    .update_upstream_status(upstream.id, UpstreamStatus::Unhealthy, now)
            {
                log::warn!("[HealthCheck] Failed to update {}: {e}", upstream.name);
                return;
            }
            log::warn!("[HealthCheck] Upstream {} marked as unhealthy", upstream.name);
            if let Err(e) = self.registry.refresh() {
                log::warn!("[HealthCheck] Registry refresh failed: {e}");
            }
        } else if let Err(e) = self.store.touch_upstream_checked(upstream.id, now) {
            log::warn!("[HealthCheck] Failed to touch {}: {e}", upstream.name);
        }
    }

    pub fn failure_count(&self, upstream_id: i64) -> u32 {
        *self.failures.lock().unwrap().get(&upstream_id).unwrap_or(&0)
    }
}

/// 2xx/3xx/4xx mean the server answered; only 5xx counts as a failure.
fn probe_status_is_healthy(status: u16) -> bool {
    (200..500).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::upstreams::UpstreamSpec;

    fn checker_with_upstream() -> (Arc<Store>, Arc<HealthChecker>, Upstream) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let upstream = store
            .create_upstream(&UpstreamSpec {
                name: "probe-me".to_string(),
                base_url: "https://up.example".to_string(),
                api_key: "secret".to_string(),
                priority: 10,
                weight: 1,
                max_retries: 2,
                timeout_seconds: 120,
                health_check_path: "/v1/chat/completions".to_string(),
            })
            .unwrap();
        let registry = Arc::new(UpstreamRegistry::new(Arc::clone(&store)));
        registry.refresh().unwrap();
        let checker = Arc::new(HealthChecker::new(
            Arc::clone(&store),
            registry,
            Duration::from_secs(60),
            Duration::from_secs(10),
            3,
        ));
        (store, checker, upstream)
    }

    #[test]
    fn four_xx_counts_as_healthy() {
        assert!(probe_status_is_healthy(200));
        assert!(probe_status_is_healthy(301));
        assert!(probe_status_is_healthy(418));
        assert!(!probe_status_is_healthy(500));
        assert!(!probe_status_is_healthy(503));
    }

    #[test]
    fn three_failures_flip_active_to_unhealthy() {
        let (store, checker, upstream) = checker_with_upstream();

        checker.record_result(&upstream, false);
        checker.record_result(&upstream, false);
        assert_eq!(
            store.get_upstream(upstream.id).unwrap().unwrap().status,
            UpstreamStatus::Active
        );

        checker.record_result(&upstream, false);
        let stored = store.get_upstream(upstream.id).unwrap().unwrap();
        assert_eq!(stored.status, UpstreamStatus::Unhealthy);
        assert!(stored.last_checked_at.is_some());
        assert_eq!(checker.failure_count(upstream.id), 3);
    }

    #[test]
    fn one_success_restores_an_unhealthy_upstream() {
        let (store, checker, upstream) = checker_with_upstream();
        for _ in 0..3 {
            checker.record_result(&upstream, false);
        }
        let unhealthy = store.get_upstream(upstream.id).unwrap().unwrap();
        assert_eq!(unhealthy.status, UpstreamStatus::Unhealthy);

        checker.record_result(&unhealthy, true);
        assert_eq!(
            store.get_upstream(upstream.id).unwrap().unwrap().status,
            UpstreamStatus::Active
        );
        assert_eq!(checker.failure_count(upstream.id), 0);
    }

    #[test]
    fn success_on_active_only_touches_timestamp() {
        let (store, checker, upstream) = checker_with_upstream();
        assert!(store
            .get_upstream(upstream.id)
            .unwrap()
            .unwrap()
            .last_checked_at
            .is_none());
        checker.record_result(&upstream, true);
        assert!(store
            .get_upstream(upstream.id)
            .unwrap()
            .unwrap()
            .last_checked_at
            .is_some());
    }
}

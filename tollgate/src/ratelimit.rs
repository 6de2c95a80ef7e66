//! Optional per-key token-bucket rate limiting.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

const BUCKET_IDLE_TTL: Duration = Duration::from_secs(3600);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: 0,
            burst: 0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
    last_seen: Instant,
}

/// Token-bucket limiter. Capacity is `burst` (falling back to the per-minute
/// rate), refill is `rpm / 60` per second. Buckets are lazily created and
/// swept after an hour of inactivity.
#[derive(Debug)]
pub struct RateLimiter {
    config: RwLock<RateLimitConfig>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

/// The bucket key function. Currently ApiKey-id scoped; swap here to key by
/// user or (user, endpoint) instead.
pub fn bucket_key(api_key_id: i64) -> String {
    format!("key:{api_key_id}")
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: RwLock::new(config),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_config(&self, config: RateLimitConfig) {
        *self.config.write().unwrap() = config;
    }

    pub fn config(&self) -> RateLimitConfig {
        *self.config.read().unwrap()
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let cfg = self.config();
        if !cfg.enabled || cfg.requests_per_minute == 0 || key.is_empty() {
            return true;
        }

        let capacity = if cfg.burst > 0 {
            f64::from(cfg.burst)
        } else {
            f64::from(cfg.requests_per_minute)
        };
        let rate = f64::from(cfg.requests_per_minute) / 60.0;

        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last: now,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        }

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        bucket.last = now;
        bucket.last_seen = now;
        allowed
    }

    /// Drop buckets idle for more than an hour.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < BUCKET_IDLE_TTL);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(rpm: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests_per_minute: rpm,
            burst,
        })
    }

    #[test]
    fn disabled_always_allows() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..1000 {
            assert!(limiter.allow("key:1"));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn burst_bounds_initial_capacity() {
        let limiter = enabled(60, 3);
        let now = Instant::now();
        assert!(limiter.allow_at("key:1", now));
        assert!(limiter.allow_at("key:1", now));
        assert!(limiter.allow_at("key:1", now));
        assert!(!limiter.allow_at("key:1", now));
    }

    #[test]
    fn refills_at_rpm_over_sixty() {
        let limiter = enabled(60, 1);
        let start = Instant::now();
        assert!(limiter.allow_at("key:1", start));
        assert!(!limiter.allow_at("key:1", start));
        // One token per second at 60 rpm.
        assert!(limiter.allow_at("key:1", start + Duration::from_millis(1100)));
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = enabled(60, 1);
        let now = Instant::now();
        assert!(limiter.allow_at(&bucket_key(1), now));
        assert!(limiter.allow_at(&bucket_key(2), now));
        assert!(!limiter.allow_at(&bucket_key(1), now));
    }

    #[test]
    fn sweep_keeps_recent_buckets() {
        let limiter = enabled(60, 1);
        limiter.allow("key:1");
        limiter.sweep();
        assert_eq!(limiter.bucket_count(), 1);
    }
}

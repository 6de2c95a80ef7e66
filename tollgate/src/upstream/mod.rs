//! Upstream registry and session-affine selection.

pub mod health;

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::{SystemSettings, Upstream, UpstreamStatus};
use crate::store::Store;

/// Snapshots older than this are refreshed before the next selection.
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

struct Snapshot {
    upstreams: Vec<Upstream>,
    refreshed_at: Option<Instant>,
}

/// In-memory snapshot of configured upstreams, ordered by priority then id.
/// Disabled upstreams are excluded; unhealthy ones are retained so the
/// health checker can restore them but never returned by selection.
pub struct UpstreamRegistry {
    store: Arc<Store>,
    inner: RwLock<Snapshot>,
}

impl UpstreamRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            inner: RwLock::new(Snapshot {
                upstreams: Vec::new(),
                refreshed_at: None,
            }),
        }
    }

    /// Replace the snapshot from the store.
    pub fn refresh(&self) -> Result<(), GatewayError> {
        let upstreams = self
            .store
            .list_upstreams_for(&[UpstreamStatus::Active, UpstreamStatus::Unhealthy])?;
        let mut inner = self.inner.write().expect("registry lock poisoned");
        log::info!("[Upstream] Loaded {} upstreams", upstreams.len());
        inner.upstreams = upstreams;
        inner.refreshed_at = Some(Instant::now());
        Ok(())
    }

    fn ensure_fresh(&self) -> Result<(), GatewayError> {
        let stale = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .refreshed_at
                .map_or(true, |at| at.elapsed() > REFRESH_INTERVAL)
        };
        if stale {
            self.refresh()?;
        }
        Ok(())
    }

    /// The current snapshot (active and unhealthy entries).
    pub fn snapshot(&self) -> Vec<Upstream> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .upstreams
            .clone()
    }

    /// Pick the active upstream for a user. The same user keeps landing on
    /// the same upstream for the lifetime of a snapshot, which stabilizes
    /// upstream-side context caches.
    pub fn select_for_user(&self, user_id: Uuid) -> Result<Upstream, GatewayError> {
        self.select_with_fallback(user_id, &[])
    }

    /// Same, excluding upstreams already tried in this request.
    pub fn select_with_fallback(
        &self,
        user_id: Uuid,
        exclude_ids: &[i64],
    ) -> Result<Upstream, GatewayError> {
        self.ensure_fresh()?;
        let inner = self.inner.read().expect("registry lock poisoned");
        let candidates: Vec<&Upstream> = inner
            .upstreams
            .iter()
            .filter(|u| u.status == UpstreamStatus::Active && !exclude_ids.contains(&u.id))
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::NoUpstreamAvailable);
        }

        let index = (hash_user_id(user_id) % candidates.len() as u64) as usize;
        let selected = candidates[index].clone();
        log::info!(
            "[Upstream] User {user_id} → Upstream {} ({})",
            selected.name,
            selected.base_url
        );
        Ok(selected)
    }
}

/// First 8 bytes, big-endian, of sha256 over the 16-byte user id.
fn hash_user_id(user_id: Uuid) -> u64 {
    let digest = Sha256::digest(user_id.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Synthetic upstream built from inline settings, used when the registry has
/// no active entry but the operator configured a fallback.
pub fn fallback_from_settings(settings: &SystemSettings) -> Option<Upstream> {
    let api_key = settings.openai_api_key.clone()?;
    let base_url = settings.openai_base_url.clone()?;
    if api_key.is_empty() || base_url.is_empty() {
        return None;
    }
    Some(Upstream {
        id: 0,
        name: "settings-fallback".to_string(),
        base_url: base_url.trim_end_matches('/').to_string(),
        api_key,
        priority: i32::MAX,
        status: UpstreamStatus::Active,
        weight: 1,
        max_retries: 0,
        timeout_seconds: 120,
        health_check_path: "/v1/chat/completions".to_string(),
        last_checked_at: None,
    })
}

//! API-key admission: authentication, account gating and rate limiting
//! ahead of any upstream contact.

use axum::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::context::{AppState, LAST_USED_INTERVAL};
use crate::error::GatewayError;
use crate::models::{ApiKey, User, UserStatus};
use crate::ratelimit;
use crate::timezone;

/// The authenticated principal, stashed in request extensions.
#[derive(Clone)]
pub struct AuthedCaller {
    pub user: User,
    pub api_key: ApiKey,
}

pub fn hash_api_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Mint a raw key (`sk-` + 48 hex), returning `(raw, hash, prefix)`. The raw
/// form is shown to the caller exactly once and never stored.
pub fn generate_api_key() -> (String, String, String) {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let raw = format!("sk-{}", hex::encode(bytes));
    let hash = hash_api_key(&raw);
    let prefix = raw[..7].to_string();
    (raw, hash, prefix)
}

pub async fn admission_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(GatewayError::MissingAuth)?;
    let raw_key = header
        .strip_prefix("Bearer ")
        .ok_or(GatewayError::InvalidAuthFormat)?;

    let (api_key, user) = state
        .store
        .find_active_key_by_hash(&hash_api_key(raw_key))?
        .ok_or(GatewayError::InvalidKey)?;

    if user.status != UserStatus::Active {
        return Err(GatewayError::UserNotActive);
    }

    if let Some(quota) = api_key.quota_limit {
        if api_key.total_usage >= quota {
            return Err(GatewayError::KeyQuotaExceeded);
        }
    }

    // Financial admission: a positive balance or an active package.
    if user.balance <= rust_decimal::Decimal::ZERO
        && !state.store.has_active_package(user.id, timezone::today())?
    {
        return Err(GatewayError::NoBalanceOrPackage);
    }

    if !state.limiter.allow(&ratelimit::bucket_key(api_key.id)) {
        return Err(GatewayError::RateLimited);
    }

    // Throttled, asynchronous and non-fatal.
    if state.should_touch_last_used(api_key.id) {
        let store = state.store.clone();
        let key_id = api_key.id;
        tokio::spawn(async move {
            let now = Utc::now();
            let threshold = now - chrono::Duration::seconds(LAST_USED_INTERVAL.as_secs() as i64);
            if let Err(e) = store.touch_key_last_used(key_id, now, threshold) {
                log::warn!("failed to update last_used_at for key {key_id}: {e}");
            }
        });
    }

    request.extensions_mut().insert(AuthedCaller { user, api_key });
    Ok(next.run(request).await)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthedCaller
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthedCaller>()
            .cloned()
            .ok_or(GatewayError::InvalidKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_state;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                admission_middleware,
            ))
            .with_state(state)
    }

    fn request(token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri("/v1/chat/completions");
        if let Some(token) = token {
            builder = builder.header("Authorization", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn generated_keys_have_the_documented_shape() {
        let (raw, hash, prefix) = generate_api_key();
        assert_eq!(raw.len(), 51);
        assert!(raw.starts_with("sk-"));
        assert_eq!(hash, hash_api_key(&raw));
        assert_eq!(hash.len(), 64);
        assert_eq!(prefix, &raw[..7]);
        // The hash never contains the raw key material.
        assert!(!hash.contains(&raw[3..]));
    }

    #[tokio::test]
    async fn missing_and_malformed_auth_are_401() {
        let state = test_state();
        let resp = app(state.clone()).oneshot(request(None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(state)
            .oneshot(request(Some("Basic abc")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_key_is_401() {
        let state = test_state();
        let resp = app(state)
            .oneshot(request(Some("Bearer sk-does-not-exist")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn funded_user_is_admitted() {
        let state = test_state();
        let user = state
            .store
            .create_user("ok@example.com", Decimal::from(5), None)
            .unwrap();
        let (raw, hash, prefix) = generate_api_key();
        state
            .store
            .create_api_key(user.id, "k", &hash, &prefix, None)
            .unwrap();

        let resp = app(state)
            .oneshot(request(Some(&format!("Bearer {raw}"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn suspended_user_is_403() {
        let state = test_state();
        let user = state
            .store
            .create_user("sus@example.com", Decimal::from(5), None)
            .unwrap();
        let (raw, hash, prefix) = generate_api_key();
        state
            .store
            .create_api_key(user.id, "k", &hash, &prefix, None)
            .unwrap();
        state
            .store
            .update_user_status(user.id, UserStatus::Suspended)
            .unwrap();

        let resp = app(state)
            .oneshot(request(Some(&format!("Bearer {raw}"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn no_balance_no_package_is_402() {
        let state = test_state();
        let user = state
            .store
            .create_user("broke@example.com", Decimal::ZERO, None)
            .unwrap();
        let (raw, hash, prefix) = generate_api_key();
        state
            .store
            .create_api_key(user.id, "k", &hash, &prefix, None)
            .unwrap();

        let resp = app(state.clone())
            .oneshot(request(Some(&format!("Bearer {raw}"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);

        // An active package admits the user with zero balance.
        state
            .store
            .create_package(
                user.id,
                "basic",
                Decimal::ZERO,
                30,
                Decimal::ONE,
                timezone::today(),
            )
            .unwrap();
        let resp = app(state)
            .oneshot(request(Some(&format!("Bearer {raw}"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn exhausted_key_quota_is_402() {
        let state = test_state();
        let user = state
            .store
            .create_user("q@example.com", Decimal::from(5), None)
            .unwrap();
        let (raw, hash, prefix) = generate_api_key();
        let key = state
            .store
            .create_api_key(user.id, "k", &hash, &prefix, Some(10))
            .unwrap();
        // Push cumulative usage to the cap.
        state
            .store
            .bill(
                &crate::store::BillParams {
                    user_id: user.id,
                    api_key_id: key.id,
                    model: "m".into(),
                    input_tokens: 6,
                    output_tokens: 4,
                    cached_tokens: 0,
                    cache_creation_tokens: 0,
                    total_tokens: 10,
                    cost_nanos: 0,
                    latency_ms: 0,
                    status_code: 200,
                },
                timezone::today(),
            )
            .unwrap();

        let resp = app(state)
            .oneshot(request(Some(&format!("Bearer {raw}"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn rate_limited_key_is_403() {
        let state = test_state();
        state.limiter.set_config(crate::ratelimit::RateLimitConfig {
            enabled: true,
            requests_per_minute: 60,
            burst: 1,
        });
        let user = state
            .store
            .create_user("rl@example.com", Decimal::from(5), None)
            .unwrap();
        let (raw, hash, prefix) = generate_api_key();
        state
            .store
            .create_api_key(user.id, "k", &hash, &prefix, None)
            .unwrap();

        let auth = format!("Bearer {raw}");
        let resp = app(state.clone())
            .oneshot(request(Some(&auth)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app(state).oneshot(request(Some(&auth))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}

//! Router assembly: the OpenAI-compatible data plane under `/v1`, the admin
//! control plane under `/api/admin`, and a liveness probe.

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;

use crate::admission::admission_middleware;
use crate::context::AppState;
use crate::handlers::{admin, admin_auth_middleware, keys, usage};
use crate::proxy::proxy_handler;

pub fn app(state: AppState) -> Router {
    let data_plane = Router::new()
        .route("/chat/completions", post(proxy_handler))
        .route("/completions", post(proxy_handler))
        .route("/responses", post(proxy_handler))
        .route("/engines/:engine/completions", post(proxy_handler))
        .route("/edits", post(proxy_handler))
        .route("/embeddings", post(proxy_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ));

    let admin_plane = Router::new()
        .route("/users", post(admin::create_user).get(admin::list_users))
        .route("/users/:id/balance", put(admin::update_user_balance))
        .route("/users/:id/status", put(admin::update_user_status))
        .route("/users/:id/keys", post(keys::create_key).get(keys::list_keys))
        .route(
            "/users/:id/packages",
            post(admin::create_package).get(admin::list_packages),
        )
        .route("/keys/:id/status", put(keys::update_key_status))
        .route("/keys/:id", delete(keys::delete_key))
        .route(
            "/upstreams",
            post(admin::create_upstream).get(admin::list_upstreams),
        )
        .route(
            "/upstreams/:id",
            put(admin::update_upstream).delete(admin::delete_upstream),
        )
        .route("/upstreams/:id/status", put(admin::update_upstream_status))
        .route(
            "/upstreams/health-check",
            post(admin::trigger_health_check),
        )
        .route(
            "/pricing",
            post(admin::upsert_pricing).get(admin::list_pricing),
        )
        .route(
            "/settings",
            get(admin::get_settings).put(admin::update_settings),
        )
        .route("/usage/logs", get(usage::list_logs))
        .route("/usage/stats", get(usage::stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/v1", data_plane)
        .nest("/api/admin", admin_plane)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_is_public() {
        let app = app(test_state());
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn data_plane_requires_a_key() {
        let app = app(test_state());
        let resp = app
            .oneshot(
                Request::post("/v1/responses")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_plane_rejects_bad_tokens() {
        let state = test_state();
        let resp = app(state.clone())
            .oneshot(Request::get("/api/admin/users").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(state)
            .oneshot(
                Request::get("/api/admin/users")
                    .header("Authorization", "Bearer test-admin-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_plane_disabled_without_token() {
        let state = crate::context::AppState::build(
            crate::context::test_config(),
            crate::store::Store::open_in_memory().unwrap(),
        )
        .unwrap();
        let resp = app(state)
            .oneshot(
                Request::get("/api/admin/users")
                    .header("Authorization", "Bearer anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! API-key lifecycle. The raw key is returned exactly once at creation;
//! only its SHA-256 and display prefix persist.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::admission::generate_api_key;
use crate::context::AppState;
use crate::error::GatewayError;
use crate::models::{ApiKey, KeyStatus};

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub quota_limit: Option<i64>,
}

pub async fn create_key(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<Response, GatewayError> {
    if state.store.get_user(user_id)?.is_none() {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "user not found"})),
        )
            .into_response());
    }

    let (raw, hash, prefix) = generate_api_key();
    let key = state
        .store
        .create_api_key(user_id, &req.name, &hash, &prefix, req.quota_limit)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": key.id,
            "key": raw,
            "key_prefix": key.key_prefix,
            "name": key.name,
        })),
    )
        .into_response())
}

pub async fn list_keys(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<ApiKey>>, GatewayError> {
    Ok(Json(state.store.list_keys_for_user(user_id)?))
}

#[derive(Deserialize)]
pub struct UpdateKeyStatusRequest {
    pub status: KeyStatus,
}

pub async fn update_key_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateKeyStatusRequest>,
) -> Result<Response, GatewayError> {
    if !state.store.update_key_status(id, req.status)? {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "key not found"})),
        )
            .into_response());
    }
    Ok(Json(json!({"message": "status updated"})).into_response())
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, GatewayError> {
    if !state.store.delete_api_key(id)? {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "key not found"})),
        )
            .into_response());
    }
    Ok(Json(json!({"message": "key deleted"})).into_response())
}

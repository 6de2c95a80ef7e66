//! User, package, upstream, pricing and settings administration.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::context::AppState;
use crate::error::GatewayError;
use crate::models::{ModelPricing, Upstream, UpstreamStatus, User, UserPackage, UserStatus};
use crate::store::pricing::PricingSpec;
use crate::store::upstreams::UpstreamSpec;

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{what} not found")})),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    #[serde(default)]
    pub balance: Decimal,
    pub daily_usage_limit: Option<Decimal>,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), GatewayError> {
    let user = state
        .store
        .create_user(&req.email, req.balance, req.daily_usage_limit)?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn list_users(
    State(state): State<AppState>,
) -> Result<Json<Vec<User>>, GatewayError> {
    Ok(Json(state.store.list_users()?))
}

#[derive(Deserialize)]
pub struct UpdateBalanceRequest {
    pub balance: Decimal,
}

pub async fn update_user_balance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateBalanceRequest>,
) -> Result<Response, GatewayError> {
    if state.store.get_user(id)?.is_none() {
        return Ok(not_found("user"));
    }
    state.store.update_user_balance(id, req.balance)?;
    Ok(Json(json!({"message": "balance updated"})).into_response())
}

#[derive(Deserialize)]
pub struct UpdateUserStatusRequest {
    pub status: UserStatus,
}

pub async fn update_user_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateUserStatusRequest>,
) -> Result<Response, GatewayError> {
    if state.store.get_user(id)?.is_none() {
        return Ok(not_found("user"));
    }
    state.store.update_user_status(id, req.status)?;
    Ok(Json(json!({"message": "status updated"})).into_response())
}

#[derive(Deserialize)]
pub struct CreatePackageRequest {
    pub package_name: String,
    #[serde(default)]
    pub package_price: Decimal,
    pub duration_days: i32,
    pub daily_limit: Decimal,
    /// Defaults to today in Asia/Shanghai.
    pub start_date: Option<NaiveDate>,
}

pub async fn create_package(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<CreatePackageRequest>,
) -> Result<Response, GatewayError> {
    if state.store.get_user(user_id)?.is_none() {
        return Ok(not_found("user"));
    }
    let start = req.start_date.unwrap_or_else(crate::timezone::today);
    let package = state.store.create_package(
        user_id,
        &req.package_name,
        req.package_price,
        req.duration_days,
        req.daily_limit,
        start,
    )?;
    Ok((StatusCode::CREATED, Json(package)).into_response())
}

pub async fn list_packages(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<UserPackage>>, GatewayError> {
    Ok(Json(state.store.list_packages_for_user(user_id)?))
}

pub async fn create_upstream(
    State(state): State<AppState>,
    Json(spec): Json<UpstreamSpec>,
) -> Result<(StatusCode, Json<Upstream>), GatewayError> {
    let upstream = state.store.create_upstream(&spec)?;
    state.registry.refresh()?;
    Ok((StatusCode::CREATED, Json(upstream)))
}

pub async fn list_upstreams(
    State(state): State<AppState>,
) -> Result<Json<Vec<Upstream>>, GatewayError> {
    Ok(Json(state.store.list_all_upstreams()?))
}

pub async fn update_upstream(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(spec): Json<UpstreamSpec>,
) -> Result<Response, GatewayError> {
    if !state.store.update_upstream(id, &spec)? {
        return Ok(not_found("upstream"));
    }
    state.registry.refresh()?;
    Ok(Json(json!({"message": "upstream updated"})).into_response())
}

#[derive(Deserialize)]
pub struct UpdateUpstreamStatusRequest {
    pub status: UpstreamStatus,
}

pub async fn update_upstream_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateUpstreamStatusRequest>,
) -> Result<Response, GatewayError> {
    if state.store.get_upstream(id)?.is_none() {
        return Ok(not_found("upstream"));
    }
    state
        .store
        .update_upstream_status(id, req.status, chrono::Utc::now())?;
    state.registry.refresh()?;
    Ok(Json(json!({"message": "status updated"})).into_response())
}

pub async fn delete_upstream(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, GatewayError> {
    if !state.store.delete_upstream(id)? {
        return Ok(not_found("upstream"));
    }
    state.registry.refresh()?;
    Ok(Json(json!({"message": "upstream deleted"})).into_response())
}

/// Manual probe trigger; probes run in their own tasks.
pub async fn trigger_health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.health.check_cycle();
    Json(json!({"message": "health check triggered"}))
}

pub async fn list_pricing(
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelPricing>>, GatewayError> {
    Ok(Json(state.store.list_pricing()?))
}

pub async fn upsert_pricing(
    State(state): State<AppState>,
    Json(spec): Json<PricingSpec>,
) -> Result<Response, GatewayError> {
    state.store.upsert_pricing(&spec)?;
    Ok(Json(json!({"message": "pricing saved"})).into_response())
}

pub async fn get_settings(
    State(state): State<AppState>,
) -> Result<Json<crate::models::SystemSettings>, GatewayError> {
    Ok(Json(state.store.get_settings()?))
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    pub announcement: Option<String>,
    pub registration_enabled: Option<bool>,
    pub rate_limit_enabled: Option<bool>,
    pub rate_limit_rpm: Option<u32>,
    pub rate_limit_burst: Option<u32>,
    #[serde(default, with = "double_option")]
    pub openai_api_key: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub openai_base_url: Option<Option<String>>,
}

// Distinguishes "field absent" from "field set to null".
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

pub async fn update_settings(
    State(state): State<AppState>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<crate::models::SystemSettings>, GatewayError> {
    let mut settings = state.store.get_settings()?;
    if let Some(v) = req.announcement {
        settings.announcement = v;
    }
    if let Some(v) = req.registration_enabled {
        settings.registration_enabled = v;
    }
    if let Some(v) = req.rate_limit_enabled {
        settings.rate_limit_enabled = v;
    }
    if let Some(v) = req.rate_limit_rpm {
        settings.rate_limit_rpm = v;
    }
    if let Some(v) = req.rate_limit_burst {
        settings.rate_limit_burst = v;
    }
    if let Some(v) = req.openai_api_key {
        settings.openai_api_key = v;
    }
    if let Some(v) = req.openai_base_url {
        settings.openai_base_url = v;
    }
    state.store.update_settings(&settings)?;

    // The limiter reads its snapshot from settings.
    state.limiter.set_config(crate::ratelimit::RateLimitConfig {
        enabled: settings.rate_limit_enabled,
        requests_per_minute: settings.rate_limit_rpm,
        burst: settings.rate_limit_burst,
    });

    Ok(Json(state.store.get_settings()?))
}

//! Usage log and spend queries.

use axum::extract::{Query, State};
use axum::Json;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::context::AppState;
use crate::error::GatewayError;
use crate::timezone;

#[derive(Deserialize)]
pub struct LogsQuery {
    pub user_id: Option<Uuid>,
    /// A Shanghai calendar day; converted to the matching UTC window.
    pub date: Option<NaiveDate>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}
fn default_page_size() -> u32 {
    20
}

pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, 100);
    let (logs, total) = state
        .store
        .list_usage_logs(query.user_id, query.date, page, page_size)?;
    let total_pages = (total + i64::from(page_size) - 1) / i64::from(page_size);
    Ok(Json(json!({
        "data": logs,
        "page": page,
        "page_size": page_size,
        "total": total,
        "total_pages": total_pages,
    })))
}

#[derive(Deserialize)]
pub struct StatsQuery {
    pub user_id: Uuid,
}

pub async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let stats = state.store.usage_stats(query.user_id, timezone::today())?;
    Ok(Json(json!({
        "today_cost": stats.today_cost,
        "month_cost": stats.month_cost,
        "total_cost": stats.total_cost,
    })))
}

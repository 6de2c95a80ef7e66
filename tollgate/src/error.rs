use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Data-plane error taxonomy. Every variant maps to a status code and a
/// `{"error": "<message>"}` body.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request body")]
    InvalidBody,

    #[error("missing authorization header")]
    MissingAuth,

    #[error("invalid authorization format")]
    InvalidAuthFormat,

    #[error("invalid or inactive API key")]
    InvalidKey,

    #[error("user account is not active")]
    UserNotActive,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("API key quota exceeded")]
    KeyQuotaExceeded,

    #[error("insufficient balance or active package")]
    NoBalanceOrPackage,

    #[error("daily limit exceeded")]
    DailyLimitExceeded,

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("pricing not found for model: {0}")]
    PricingMissing(String),

    #[error("no active upstreams available")]
    NoUpstreamAvailable,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("billing failed")]
    BillingFailed,

    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidBody | Self::PricingMissing(_) => StatusCode::BAD_REQUEST,
            Self::MissingAuth | Self::InvalidAuthFormat | Self::InvalidKey => {
                StatusCode::UNAUTHORIZED
            }
            Self::UserNotActive | Self::RateLimited => StatusCode::FORBIDDEN,
            Self::KeyQuotaExceeded
            | Self::NoBalanceOrPackage
            | Self::DailyLimitExceeded
            | Self::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
            Self::NoUpstreamAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::BillingFailed | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal detail stays in the log, not in the response body.
        let message = match &self {
            Self::Storage(detail) => {
                log::error!("storage error: {detail}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

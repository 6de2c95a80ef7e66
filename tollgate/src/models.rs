use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended,
    Banned,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Banned => "banned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "banned" => Some(Self::Banned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Disabled,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    Active,
    Disabled,
    Unhealthy,
}

impl UpstreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Active,
    Expired,
    Switched,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Switched => "switched",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "switched" => Some(Self::Switched),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub balance: Decimal,
    pub status: UserStatus,
    pub daily_usage_limit: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    /// Cap on cumulative `total_usage` tokens; `None` is unlimited.
    pub quota_limit: Option<i64>,
    pub total_usage: i64,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Per-1k-token prices. Lookups are exact-match on the normalized model name.
#[derive(Debug, Clone, Serialize)]
pub struct ModelPricing {
    pub id: i64,
    pub model_name: String,
    pub input_price_per_1k: Decimal,
    pub cache_read_price_per_1k: Decimal,
    pub cache_create_price_per_1k: Decimal,
    pub output_price_per_1k: Decimal,
    pub markup_multiplier: Decimal,
    pub effective_from: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Upstream {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub priority: i32,
    pub status: UpstreamStatus,
    pub weight: i32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub health_check_path: String,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPackage {
    pub id: i64,
    pub user_id: Uuid,
    pub package_name: String,
    pub package_price: Decimal,
    pub duration_days: i32,
    /// Daily quota consumable before spend cascades to the balance.
    pub daily_limit: Decimal,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: PackageStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyUsage {
    pub id: i64,
    pub user_id: Uuid,
    pub user_package_id: Option<i64>,
    pub date: NaiveDate,
    pub used_amount: Decimal,
    pub total_used_amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageLog {
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub api_key_id: i64,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,
    pub total_tokens: i64,
    pub cost: Decimal,
    pub latency_ms: i64,
    pub status_code: u16,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    pub announcement: String,
    pub registration_enabled: bool,
    pub rate_limit_enabled: bool,
    pub rate_limit_rpm: u32,
    pub rate_limit_burst: u32,
    /// Inline fallback upstream used when the registry has no active entry.
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            announcement: String::new(),
            registration_enabled: true,
            rate_limit_enabled: false,
            rate_limit_rpm: 60,
            rate_limit_burst: 0,
            openai_api_key: None,
            openai_base_url: None,
            updated_at: Utc::now(),
        }
    }
}

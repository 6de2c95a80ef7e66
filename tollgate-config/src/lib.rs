use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

/// Runtime configuration for the gateway process.
///
/// Values come from a JSON config file or from the environment (a local
/// `.env` file is honored). Every field has a workable default except
/// `admin_token`, which gates the admin API and stays disabled when empty.
#[derive(Debug, Clone, Serialize, Deserialize, Args)]
pub struct GatewayConfig {
    /// Data-plane listen port.
    #[clap(long, default_value = "8080")]
    pub port: u16,

    /// Path to the SQLite database file.
    #[clap(long, default_value = "./data/tollgate.db")]
    pub database_path: PathBuf,

    /// Bearer token protecting the /api/admin surface. Empty disables it.
    #[clap(long, default_value = "")]
    pub admin_token: String,

    /// Total timeout for upstream completion calls, in seconds.
    #[clap(long, default_value = "120")]
    pub upstream_timeout_secs: u64,

    /// Idle connections kept per upstream host.
    #[clap(long, default_value = "10")]
    pub upstream_pool_per_host: usize,

    /// Idle timeout for pooled upstream connections, in seconds.
    #[clap(long, default_value = "90")]
    pub upstream_pool_idle_secs: u64,

    /// Seconds between health-check cycles.
    #[clap(long, default_value = "60")]
    pub health_check_interval_secs: u64,

    /// Per-probe timeout, in seconds.
    #[clap(long, default_value = "10")]
    pub health_check_timeout_secs: u64,

    /// Consecutive probe failures before an upstream is marked unhealthy.
    #[clap(long, default_value = "3")]
    pub health_check_max_failures: u32,

    /// Remote pricing catalog URL. Empty disables the background loader.
    #[clap(
        long,
        default_value = "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json"
    )]
    pub pricing_url: String,

    /// Directory for the on-disk pricing cache.
    #[clap(long, default_value = "./data/pricing")]
    pub pricing_cache_dir: PathBuf,

    /// Seconds to wait for in-flight requests on shutdown.
    #[clap(long, default_value = "5")]
    pub shutdown_grace_secs: u64,
}

impl GatewayConfig {
    /// Read the configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(|e| {
            anyhow!("failed to read config {}: {e}", path.as_ref().display())
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Build the configuration from environment variables, falling back to
    /// defaults. Loads a `.env` file first when one is present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        Ok(Self {
            port: env_parse("TOLLGATE_PORT", 8080)?,
            database_path: PathBuf::from(env_or("TOLLGATE_DB_PATH", "./data/tollgate.db")),
            admin_token: env_or("TOLLGATE_ADMIN_TOKEN", ""),
            upstream_timeout_secs: env_parse("TOLLGATE_UPSTREAM_TIMEOUT_SECS", 120)?,
            upstream_pool_per_host: env_parse("TOLLGATE_UPSTREAM_POOL_PER_HOST", 10)?,
            upstream_pool_idle_secs: env_parse("TOLLGATE_UPSTREAM_POOL_IDLE_SECS", 90)?,
            health_check_interval_secs: env_parse("TOLLGATE_HEALTH_INTERVAL_SECS", 60)?,
            health_check_timeout_secs: env_parse("TOLLGATE_HEALTH_TIMEOUT_SECS", 10)?,
            health_check_max_failures: env_parse("TOLLGATE_HEALTH_MAX_FAILURES", 3)?,
            pricing_url: env_or(
                "TOLLGATE_PRICING_URL",
                "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json",
            ),
            pricing_cache_dir: PathBuf::from(env_or("TOLLGATE_PRICING_CACHE_DIR", "./data/pricing")),
            shutdown_grace_secs: env_parse("TOLLGATE_SHUTDOWN_GRACE_SECS", 5)?,
        })
    }

    pub fn admin_enabled(&self) -> bool {
        !self.admin_token.is_empty()
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|e| anyhow!("invalid value for {key}: {e}")),
        _ => Ok(default),
    }
}

//! SQLite-backed relational store.
//!
//! All monetary columns are INTEGER nano-dollars (see `money`); calendar
//! dates are ISO `YYYY-MM-DD` strings in Asia/Shanghai; timestamps are UTC
//! strings in a single lexically-comparable format.

pub mod billing;
pub mod keys;
pub mod packages;
pub mod pricing;
pub mod settings;
pub mod upstreams;
pub mod usage;
pub mod users;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;

use crate::error::GatewayError;

pub use billing::{BillParams, BillingError};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Storage(format!("create data dir: {e}")))?;
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    fn init_schema(&self) -> Result<(), GatewayError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id                 TEXT PRIMARY KEY,
                email              TEXT NOT NULL UNIQUE,
                balance_nanos      INTEGER NOT NULL DEFAULT 0,
                status             TEXT NOT NULL DEFAULT 'active',
                daily_limit_nanos  INTEGER,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL,
                deleted_at         TEXT
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id            TEXT NOT NULL REFERENCES users(id),
                key_hash           TEXT NOT NULL UNIQUE,
                key_prefix         TEXT NOT NULL,
                name               TEXT NOT NULL DEFAULT '',
                quota_limit        INTEGER,
                total_usage        INTEGER NOT NULL DEFAULT 0,
                status             TEXT NOT NULL DEFAULT 'active',
                created_at         TEXT NOT NULL,
                last_used_at       TEXT,
                deleted_at         TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

            CREATE TABLE IF NOT EXISTS model_pricing (
                id                          INTEGER PRIMARY KEY AUTOINCREMENT,
                model_name                  TEXT NOT NULL UNIQUE,
                input_nanos_per_1k          INTEGER NOT NULL,
                cache_read_nanos_per_1k     INTEGER NOT NULL DEFAULT 0,
                cache_create_nanos_per_1k   INTEGER NOT NULL DEFAULT 0,
                output_nanos_per_1k         INTEGER NOT NULL,
                markup_multiplier           TEXT NOT NULL DEFAULT '1.5',
                effective_from              TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS upstreams (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                name               TEXT NOT NULL,
                base_url           TEXT NOT NULL,
                api_key            TEXT NOT NULL,
                priority           INTEGER NOT NULL DEFAULT 100,
                status             TEXT NOT NULL DEFAULT 'active',
                weight             INTEGER NOT NULL DEFAULT 1,
                max_retries        INTEGER NOT NULL DEFAULT 2,
                timeout_seconds    INTEGER NOT NULL DEFAULT 120,
                health_check_path  TEXT NOT NULL DEFAULT '/v1/chat/completions',
                last_checked_at    TEXT
            );

            CREATE TABLE IF NOT EXISTS user_packages (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id              TEXT NOT NULL REFERENCES users(id),
                package_name         TEXT NOT NULL DEFAULT '',
                package_price_nanos  INTEGER NOT NULL DEFAULT 0,
                duration_days        INTEGER NOT NULL DEFAULT 30,
                daily_limit_nanos    INTEGER NOT NULL,
                start_date           TEXT NOT NULL,
                end_date             TEXT NOT NULL,
                status               TEXT NOT NULL DEFAULT 'active',
                created_at           TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_packages_user
                ON user_packages(user_id, status, end_date);

            CREATE TABLE IF NOT EXISTS daily_usage (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id            TEXT NOT NULL REFERENCES users(id),
                user_package_id    INTEGER,
                date               TEXT NOT NULL,
                used_nanos         INTEGER NOT NULL DEFAULT 0,
                total_used_nanos   INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, date)
            );

            CREATE TABLE IF NOT EXISTS usage_logs (
                request_id             TEXT PRIMARY KEY,
                user_id                TEXT NOT NULL,
                api_key_id             INTEGER NOT NULL,
                model                  TEXT NOT NULL DEFAULT '',
                input_tokens           INTEGER NOT NULL DEFAULT 0,
                output_tokens          INTEGER NOT NULL DEFAULT 0,
                cached_tokens          INTEGER NOT NULL DEFAULT 0,
                cache_creation_tokens  INTEGER NOT NULL DEFAULT 0,
                total_tokens           INTEGER NOT NULL DEFAULT 0,
                cost_nanos             INTEGER NOT NULL DEFAULT 0,
                latency_ms             INTEGER NOT NULL DEFAULT 0,
                status_code            INTEGER NOT NULL DEFAULT 0,
                created_at             TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_user_created
                ON usage_logs(user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_usage_key_created
                ON usage_logs(api_key_id, created_at);

            CREATE TABLE IF NOT EXISTS system_settings (
                id                    INTEGER PRIMARY KEY CHECK (id = 1),
                announcement          TEXT NOT NULL DEFAULT '',
                registration_enabled  INTEGER NOT NULL DEFAULT 1,
                rate_limit_enabled    INTEGER NOT NULL DEFAULT 0,
                rate_limit_rpm        INTEGER NOT NULL DEFAULT 60,
                rate_limit_burst      INTEGER NOT NULL DEFAULT 0,
                openai_api_key        TEXT,
                openai_base_url       TEXT,
                updated_at            TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

pub(crate) fn fmt_ts(at: DateTime<Utc>) -> String {
    at.format(TS_FORMAT).to_string()
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch"))
}

pub(crate) fn opt_parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}
